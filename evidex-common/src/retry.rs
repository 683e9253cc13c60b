//! Durable-write retry logic
//!
//! Retries operations that hit transient file-lock conditions with exponential
//! backoff until `max_wait_ms` elapses. Any other error fails immediately.
//! An exhausted budget is a `Persistence` error: an unlogged action must stop
//! the run.

use crate::{Error, Result};
use std::io;
use std::time::{Duration, Instant};

/// True for I/O errors that indicate another process briefly holds the file
pub fn is_lock_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => true,
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        _ if cfg!(windows) => matches!(err.raw_os_error(), Some(32) | Some(33)),
        _ => false,
    }
}

/// Retry a blocking write with exponential backoff until max_wait_ms elapses.
///
/// **Backoff Strategy:**
/// - Initial delay: 10ms
/// - Max delay: 1000ms
/// - Multiplier: 2.0 (exponential)
pub fn retry_on_lock<F, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        match operation() {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Durable write succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_lock_error(&err) {
                    tracing::error!(operation = operation_name, error = %err, "Durable write failed");
                    return Err(Error::Persistence(format!("{}: {}", operation_name, err)));
                }

                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Durable write failed: max retry time exceeded"
                    );
                    return Err(Error::Persistence(format!(
                        "{}: still locked after {} attempts ({} ms elapsed, max {} ms)",
                        operation_name,
                        attempt,
                        elapsed.as_millis(),
                        max_wait_ms
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    remaining_ms = max_duration.saturating_sub(elapsed).as_millis() as u64,
                    "File locked, will retry after backoff"
                );

                std::thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms = (backoff_ms * 2).min(1000);
            }
        }
    }
}
