use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rrule::RRuleSet;
use thiserror::Error;

use crate::limits::{MAX_RULE_COUNT, MAX_RULE_INTERVAL, MAX_RULE_LEN};
use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("recurrence rule is empty")]
    Empty,
    #[error("recurrence rule longer than {MAX_RULE_LEN} bytes")]
    TooLong,
    #[error("recurring entry has no recurrence rule")]
    Missing,
    #[error("recurrence rule given for a non-recurring entry")]
    Unexpected,
    #[error("malformed rule part `{0}`")]
    MalformedPart(String),
    #[error("unknown rule part `{0}`")]
    UnknownPart(String),
    #[error("rule part `{0}` is not supported")]
    UnsupportedPart(String),
    #[error("rule part `{0}` given twice")]
    DuplicatePart(String),
    #[error("FREQ is required")]
    MissingFrequency,
    #[error("unsupported frequency `{0}`")]
    UnsupportedFrequency(String),
    #[error("invalid {part} value `{value}`")]
    InvalidValue { part: &'static str, value: String },
    #[error("COUNT and UNTIL cannot both be given")]
    CountAndUntil,
    /// Refused by the RRULE engine (bad BYDAY, BYMONTHDAY, BYMONTH or WKST value).
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntilSpec {
    /// `...Z` form, an absolute instant.
    Instant(Ms),
    /// Date or floating date-time, interpreted in the engine time zone.
    Local(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Never,
    Count(u32),
    Until(UntilSpec),
}

/// Parts handed to the RRULE engine, in the order they are rendered.
const CALENDAR_PARTS: [&str; 6] = ["FREQ", "INTERVAL", "BYMONTH", "BYMONTHDAY", "BYDAY", "WKST"];
const UNSUPPORTED_PARTS: [&str; 6] = ["BYSETPOS", "BYYEARDAY", "BYWEEKNO", "BYHOUR", "BYMINUTE", "BYSECOND"];

/// Parsed form of an iCalendar RRULE value.
///
/// Termination (COUNT or UNTIL) is kept here and enforced by the expander.
/// The calendar parts are vetted and later expanded by the `rrule` crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub termination: Termination,
    /// FREQ, INTERVAL and BY* parts in canonical order, without COUNT or UNTIL.
    pattern: String,
}

impl RecurrenceRule {
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RuleError::Empty);
        }
        if text.len() > MAX_RULE_LEN {
            return Err(RuleError::TooLong);
        }
        let upper = text.to_ascii_uppercase();
        let body = upper.strip_prefix("RRULE:").unwrap_or(&upper);

        let mut seen = HashSet::new();
        let mut calendar: Vec<(usize, String)> = Vec::new();
        let mut frequency = None;
        let mut interval = 1;
        let mut count = None;
        let mut until = None;

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => (k.trim(), v.trim()),
                _ => return Err(RuleError::MalformedPart(part.to_string())),
            };
            if !seen.insert(key) {
                return Err(RuleError::DuplicatePart(key.to_string()));
            }
            match key {
                "COUNT" => count = Some(parse_bounded("COUNT", value, 1, MAX_RULE_COUNT)?),
                "UNTIL" => until = Some(parse_until(value)?),
                "FREQ" => frequency = Some(parse_frequency(value)?),
                "INTERVAL" => interval = parse_bounded("INTERVAL", value, 1, MAX_RULE_INTERVAL)?,
                _ if UNSUPPORTED_PARTS.contains(&key) => return Err(RuleError::UnsupportedPart(key.to_string())),
                _ => {}
            }
            match CALENDAR_PARTS.iter().position(|p| *p == key) {
                Some(order) => calendar.push((order, format!("{key}={value}"))),
                None if key == "COUNT" || key == "UNTIL" => {}
                None => return Err(RuleError::UnknownPart(key.to_string())),
            }
        }

        let frequency = frequency.ok_or(RuleError::MissingFrequency)?;
        let termination = match (count, until) {
            (Some(_), Some(_)) => return Err(RuleError::CountAndUntil),
            (Some(n), None) => Termination::Count(n),
            (None, Some(u)) => Termination::Until(u),
            (None, None) => Termination::Never,
        };
        check_frequency_parts(frequency, &calendar)?;

        calendar.sort_by_key(|(order, _)| *order);
        let pattern = calendar.into_iter().map(|(_, p)| p).collect::<Vec<_>>().join(";");
        let rule = Self {
            frequency,
            interval,
            termination,
            pattern,
        };
        rule.recurrence_set(reference_start())?;
        Ok(rule)
    }

    /// Whether the rule itself ends (COUNT or UNTIL).
    pub fn is_bounded(&self) -> bool {
        !matches!(self.termination, Termination::Never)
    }

    /// The calendar parts of this rule anchored at a wall-clock start. The
    /// set runs in a fixed-offset frame; callers resolve each date in their
    /// own zone, so the set never sees a DST transition.
    pub(crate) fn recurrence_set(&self, start: NaiveDateTime) -> Result<RRuleSet, RuleError> {
        format!("DTSTART:{}Z\nRRULE:{}", start.format("%Y%m%dT%H%M%S"), self.pattern)
            .parse::<RRuleSet>()
            .map_err(|e| RuleError::Rejected(e.to_string()))
    }
}

impl FromStr for RecurrenceRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)?;
        match self.termination {
            Termination::Never => Ok(()),
            Termination::Count(n) => write!(f, ";COUNT={n}"),
            Termination::Until(UntilSpec::Instant(ms)) => {
                let utc = chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default();
                write!(f, ";UNTIL={}", utc.format("%Y%m%dT%H%M%SZ"))
            }
            Termination::Until(UntilSpec::Local(naive)) => write!(f, ";UNTIL={}", naive.format("%Y%m%dT%H%M%S")),
        }
    }
}

/// Anchor used to vet a rule before it is attached to a real start.
fn reference_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 3)
        .unwrap_or_default()
        .and_time(NaiveTime::MIN)
}

/// Ordinal weekdays (`2TU`, `-1FR`) only make sense inside a month or year,
/// and BYMONTHDAY has no meaning for a weekly cadence.
fn check_frequency_parts(frequency: Frequency, calendar: &[(usize, String)]) -> Result<(), RuleError> {
    for (_, part) in calendar {
        let Some((key, value)) = part.split_once('=') else { continue };
        match (frequency, key) {
            (Frequency::Daily | Frequency::Weekly, "BYDAY")
                if value.split(',').any(|d| d.starts_with(|c: char| c.is_ascii_digit() || c == '+' || c == '-')) =>
            {
                return Err(RuleError::InvalidValue {
                    part: "BYDAY",
                    value: value.to_string(),
                });
            }
            (Frequency::Weekly, "BYMONTHDAY") => {
                return Err(RuleError::InvalidValue {
                    part: "BYMONTHDAY",
                    value: "not allowed with FREQ=WEEKLY".into(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_frequency(value: &str) -> Result<Frequency, RuleError> {
    match value {
        "DAILY" => Ok(Frequency::Daily),
        "WEEKLY" => Ok(Frequency::Weekly),
        "MONTHLY" => Ok(Frequency::Monthly),
        "YEARLY" => Ok(Frequency::Yearly),
        _ => Err(RuleError::UnsupportedFrequency(value.to_string())),
    }
}

fn parse_bounded(part: &'static str, value: &str, min: u32, max: u32) -> Result<u32, RuleError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|n| (min..=max).contains(n))
        .ok_or_else(|| RuleError::InvalidValue {
            part,
            value: value.to_string(),
        })
}

fn parse_until(value: &str) -> Result<UntilSpec, RuleError> {
    let invalid = || RuleError::InvalidValue {
        part: "UNTIL",
        value: value.to_string(),
    };
    if let Some(utc) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S").map_err(|_| invalid())?;
        return Ok(UntilSpec::Instant(naive.and_utc().timestamp_millis()));
    }
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").map_err(|_| invalid())?;
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).ok_or_else(invalid)?;
        return Ok(UntilSpec::Local(date.and_time(end_of_day)));
    }
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .map(UntilSpec::Local)
        .map_err(|_| invalid())
}
