//! Line-export timestamp templates
//!
//! Twelve header shapes: bracketed (`[date, time] rest`) and dash-separated
//! (`date, time - rest`) lines, each in three date dialects (US month-first
//! with a 12-hour clock, day-first with a 24-hour clock and `/` or `.`
//! separators, ISO year-first with a 24-hour clock), each with and without
//! seconds. Templates are tried in order, seconds-included first, and the
//! first one yielding a valid date wins.

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    TwelveHour,
    TwentyFourHour,
}

pub struct Template {
    pub name: &'static str,
    regex: Regex,
    clock: Clock,
}

const DATE_US: &str = r"(?P<month>\d{1,2})/(?P<day>\d{1,2})/(?P<year>\d{4}|\d{2})";
const DATE_DAY_FIRST: &str = r"(?P<day>\d{1,2})[./](?P<month>\d{1,2})[./](?P<year>\d{4}|\d{2})";
const DATE_ISO: &str = r"(?P<year>\d{4})-(?P<month>\d{1,2})-(?P<day>\d{1,2})";

const TIME_12_SEC: &str = r"(?P<hour>\d{1,2}):(?P<minute>\d{2}):(?P<second>\d{2})\s?(?P<meridiem>[AaPp]\.?[Mm]\.?)";
const TIME_12: &str = r"(?P<hour>\d{1,2}):(?P<minute>\d{2})\s?(?P<meridiem>[AaPp]\.?[Mm]\.?)";
const TIME_24_SEC: &str = r"(?P<hour>\d{1,2}):(?P<minute>\d{2}):(?P<second>\d{2})";
const TIME_24: &str = r"(?P<hour>\d{1,2}):(?P<minute>\d{2})";

fn template(name: &'static str, bracketed: bool, date: &str, time: &str, clock: Clock) -> Template {
    let pattern = if bracketed {
        format!(r"^\[{},?\s{}\]\s(?P<rest>.*)$", date, time)
    } else {
        format!(r"^{},?\s{}\s[-–]\s(?P<rest>.*)$", date, time)
    };
    Template {
        name,
        // Patterns are compile-time constants
        regex: Regex::new(&pattern).expect("line-export template must compile"),
        clock,
    }
}

pub static TEMPLATES: Lazy<Vec<Template>> = Lazy::new(|| {
    use Clock::*;
    vec![
        template("bracketed_us_12h_seconds", true, DATE_US, TIME_12_SEC, TwelveHour),
        template("bracketed_day_first_24h_seconds", true, DATE_DAY_FIRST, TIME_24_SEC, TwentyFourHour),
        template("bracketed_iso_24h_seconds", true, DATE_ISO, TIME_24_SEC, TwentyFourHour),
        template("dash_us_12h_seconds", false, DATE_US, TIME_12_SEC, TwelveHour),
        template("dash_day_first_24h_seconds", false, DATE_DAY_FIRST, TIME_24_SEC, TwentyFourHour),
        template("dash_iso_24h_seconds", false, DATE_ISO, TIME_24_SEC, TwentyFourHour),
        template("bracketed_us_12h", true, DATE_US, TIME_12, TwelveHour),
        template("bracketed_day_first_24h", true, DATE_DAY_FIRST, TIME_24, TwentyFourHour),
        template("bracketed_iso_24h", true, DATE_ISO, TIME_24, TwentyFourHour),
        template("dash_us_12h", false, DATE_US, TIME_12, TwelveHour),
        template("dash_day_first_24h", false, DATE_DAY_FIRST, TIME_24, TwentyFourHour),
        template("dash_iso_24h", false, DATE_ISO, TIME_24, TwentyFourHour),
    ]
});

/// Outcome of matching one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMatch<'a> {
    /// A message header; `rest` is everything after the timestamp
    Header {
        timestamp: NaiveDateTime,
        template: &'static str,
        rest: &'a str,
    },
    /// Shaped like a header but the date or time is impossible
    BadTimestamp { template: &'static str, line: &'a str },
    /// Not a header: a continuation line
    NoMatch,
}

pub fn match_line(line: &str) -> LineMatch<'_> {
    let mut bad = None;
    for template in TEMPLATES.iter() {
        let Some(caps) = template.regex.captures(line) else {
            continue;
        };
        match build_timestamp(&caps, template.clock) {
            Some(timestamp) => {
                let rest = caps.name("rest").map_or("", |m| m.as_str());
                return LineMatch::Header {
                    timestamp,
                    template: template.name,
                    rest,
                };
            }
            None => {
                bad.get_or_insert(template.name);
            }
        }
    }
    match bad {
        Some(template) => LineMatch::BadTimestamp { template, line },
        None => LineMatch::NoMatch,
    }
}

fn field(caps: &Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name)?.as_str().parse().ok()
}

fn build_timestamp(caps: &Captures<'_>, clock: Clock) -> Option<NaiveDateTime> {
    let year_text = caps.name("year")?.as_str();
    let mut year: i32 = year_text.parse().ok()?;
    if year_text.len() == 2 {
        year += 2000;
    }
    let date = NaiveDate::from_ymd_opt(year, field(caps, "month")?, field(caps, "day")?)?;

    let mut hour = field(caps, "hour")?;
    if clock == Clock::TwelveHour {
        if !(1..=12).contains(&hour) {
            return None;
        }
        let pm = caps
            .name("meridiem")
            .map_or(false, |m| m.as_str().starts_with(['P', 'p']));
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }
    let second = field(caps, "second").unwrap_or(0);
    date.and_hms_opt(hour, field(caps, "minute")?, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(line: &str) -> (NaiveDateTime, &'static str, &str) {
        match match_line(line) {
            LineMatch::Header {
                timestamp,
                template,
                rest,
            } => (timestamp, template, rest),
            other => panic!("{:?} did not match: {:?}", line, other),
        }
    }

    #[test]
    fn test_twelve_templates_in_seconds_first_order() {
        assert_eq!(TEMPLATES.len(), 12);
        assert!(TEMPLATES[..6].iter().all(|t| t.name.ends_with("_seconds")));
        assert!(TEMPLATES[6..].iter().all(|t| !t.name.ends_with("_seconds")));
    }

    #[test]
    fn test_us_bracketed_with_seconds() {
        let (ts, name, rest) = header("[3/8/22, 4:12:34 PM] Jordan: hi");
        assert_eq!(ts.to_string(), "2022-03-08 16:12:34");
        assert_eq!(name, "bracketed_us_12h_seconds");
        assert_eq!(rest, "Jordan: hi");
    }

    #[test]
    fn test_narrow_space_before_meridiem() {
        let (ts, _, _) = header("[3/8/22, 4:12:34\u{202f}PM] Jordan: hi");
        assert_eq!(ts.to_string(), "2022-03-08 16:12:34");
    }

    #[test]
    fn test_midnight_and_noon() {
        assert_eq!(header("3/8/22, 12:05 AM - A: x").0.to_string(), "2022-03-08 00:05:00");
        assert_eq!(header("3/8/22, 12:05 PM - A: x").0.to_string(), "2022-03-08 12:05:00");
    }

    #[test]
    fn test_day_first_dotted_and_slashed() {
        assert_eq!(header("08.03.22, 16:12 - A: x").0.to_string(), "2022-03-08 16:12:00");
        assert_eq!(header("[08/03/2022, 16:12:34] A: x").0.to_string(), "2022-03-08 16:12:34");
    }

    #[test]
    fn test_impossible_date_is_bad_timestamp() {
        assert!(matches!(
            match_line("[31/02/2022, 16:12:34] A: x"),
            LineMatch::BadTimestamp { .. }
        ));
        assert!(matches!(
            match_line("[3/8/22, 13:12:34 PM] A: x"),
            LineMatch::BadTimestamp { .. }
        ));
    }

    #[test]
    fn test_plain_text_is_no_match() {
        assert_eq!(match_line("see you there"), LineMatch::NoMatch);
        assert_eq!(match_line(""), LineMatch::NoMatch);
    }
}
