//! RRULE parsing and lazy occurrence expansion.

mod expander;
mod rule;

pub use expander::{Occurrences, expand, expand_blocking, parse_blocking_rule};
pub use rule::{Frequency, RecurrenceRule, RuleError, Termination, UntilSpec};
