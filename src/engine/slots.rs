use chrono::{Days, NaiveDate};
use chrono_tz::Tz;

use crate::calendar::{local_date, resolve_local, start_of_day};
use crate::model::{Ms, Span, TimeSlotConfig, Window};

use super::EngineError;

/// Lazy slot grid over a set of free intervals.
///
/// Each free interval is cut per local day to the configured opening hours.
/// Slots are anchored at the day's opening time (midnight if none) and only
/// whole slots are produced.
#[derive(Debug, Clone)]
pub struct Slots {
    free: Vec<Span>,
    config: TimeSlotConfig,
    tz: Tz,
    index: usize,
    day: Option<NaiveDate>,
    next: Ms,
    limit: Ms,
}

/// Slot grid of `config` inside `free`, restricted to `window`.
pub fn slots(free: &[Span], config: &TimeSlotConfig, window: Window, tz: Tz) -> Result<Slots, EngineError> {
    let end = window.end.ok_or(EngineError::UnboundedQuery)?;
    if config.interval_minutes == 0 {
        return Err(EngineError::InvalidSpan("slot interval must be positive"));
    }
    let bounds = Span { start: window.start, end };
    Ok(Slots {
        free: free.iter().filter_map(|f| f.intersection(&bounds)).collect(),
        config: config.clone(),
        tz,
        index: 0,
        day: None,
        next: 0,
        limit: 0,
    })
}

impl Slots {
    /// Opening and closing instants of a local day.
    fn day_bounds(&self, date: NaiveDate) -> (Ms, Ms) {
        let open = match self.config.earliest_start {
            Some(t) => resolve_local(date.and_time(t), self.tz),
            None => start_of_day(date, self.tz),
        };
        let close = match self.config.latest_end {
            Some(t) => resolve_local(date.and_time(t), self.tz),
            None => date
                .checked_add_days(Days::new(1))
                .map_or(Ms::MAX, |next| start_of_day(next, self.tz)),
        };
        (open, close)
    }

    /// Move to the next (free interval, day) pair with room for a slot.
    fn advance(&mut self) -> bool {
        let interval = self.config.interval_ms();
        while let Some(free) = self.free.get(self.index).copied() {
            let date = match self.day {
                None => local_date(free.start, self.tz),
                Some(d) => match d.checked_add_days(Days::new(1)) {
                    Some(next) => next,
                    None => {
                        self.index = self.free.len();
                        return false;
                    }
                },
            };
            if start_of_day(date, self.tz) >= free.end {
                self.index += 1;
                self.day = None;
                continue;
            }
            self.day = Some(date);

            let (open, close) = self.day_bounds(date);
            let from = free.start.max(open);
            let to = free.end.min(close);
            if from >= to {
                continue;
            }
            let steps = (from - open + interval - 1).div_euclid(interval);
            self.next = open + steps * interval;
            self.limit = to;
            if self.next + interval <= self.limit {
                return true;
            }
        }
        false
    }
}

impl Iterator for Slots {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        let interval = self.config.interval_ms();
        let exhausted = self.day.is_none() || self.next + interval > self.limit;
        if exhausted && !self.advance() {
            return None;
        }
        let slot = Span {
            start: self.next,
            end: self.next + interval,
        };
        self.next += interval;
        Some(slot)
    }
}
