//! # Evidex Common Library
//!
//! Shared code for the evidex ingestion core:
//! - Error taxonomy (`Error` enum)
//! - Bootstrap configuration (`IngestConfig`)
//! - Logging initialization
//! - Retry on transient lock conditions
//! - Clock helpers

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod time;

pub use config::{IngestConfig, SourceConfig, SourceKind};
pub use error::{Error, Result};
