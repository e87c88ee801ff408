use std::collections::VecDeque;

use chrono::{Duration, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use rrule::RRuleSet;

use super::rule::{RecurrenceRule, RuleError, Termination, UntilSpec};
use crate::calendar::{resolve_local, to_local};
use crate::engine::EngineError;
use crate::limits::MAX_VALID_TIMESTAMP_MS;
use crate::model::{BlockingRule, Ms, Span, Window};

/// Dates pulled from the rule set per refill.
const CHUNK: u16 = 64;

/// Lazy sequence of occurrence spans, ascending by start.
///
/// The origin span is always the first occurrence. Later occurrences keep the
/// origin's local time of day, so a 09:00 rule stays at 09:00 across DST.
/// Cloning yields an independent iterator at the same position.
#[derive(Debug, Clone)]
pub struct Occurrences {
    /// Calendar dates in wall-clock time, `None` for a one-off span.
    set: Option<RRuleSet>,
    tz: Tz,
    origin_start: Ms,
    /// Sub-second part of the origin; the rule set works in whole seconds.
    origin_millis: Ms,
    duration: Ms,
    window_start: Ms,
    window_end: Option<Ms>,
    /// Exclusive bound on occurrence starts.
    stop_before: Option<Ms>,
    /// Inclusive bound on occurrence starts (UNTIL).
    until: Option<Ms>,
    /// Occurrences left under COUNT, including ones outside the window.
    remaining: Option<u32>,
    origin_pending: bool,
    /// Wall-clock time of the last date taken from the set.
    cursor: NaiveDateTime,
    /// Wall-clock time past which the set is not searched.
    horizon: NaiveDateTime,
    pending: VecDeque<Ms>,
    exhausted: bool,
    done: bool,
}

/// Expand a rule (or a single span when `rule` is `None`) within `window`.
///
/// Occurrences overlapping the window are yielded with their true bounds.
/// `stop_before` additionally ends the series (a recurrence end date).
pub fn expand(
    rule: Option<&RecurrenceRule>,
    origin_start: Ms,
    duration: Ms,
    tz: Tz,
    stop_before: Option<Ms>,
    window: Window,
) -> Result<Occurrences, EngineError> {
    if duration <= 0 {
        return Err(EngineError::InvalidSpan("occurrence duration must be positive"));
    }
    if let Some(rule) = rule
        && !rule.is_bounded()
        && stop_before.is_none()
        && window.end.is_none()
    {
        return Err(EngineError::ExpansionOverflow);
    }

    let (until, remaining) = match rule.map(|r| r.termination) {
        None => (None, Some(1)),
        Some(Termination::Never) => (None, None),
        Some(Termination::Count(n)) => (None, Some(n)),
        Some(Termination::Until(UntilSpec::Instant(ms))) => (Some(ms), None),
        Some(Termination::Until(UntilSpec::Local(naive))) => (Some(resolve_local(naive, tz)), None),
    };

    let origin_millis = origin_start.rem_euclid(1000);
    let origin_wall = to_local(origin_start - origin_millis, tz).naive_local();
    let set = rule.map(|r| r.recurrence_set(origin_wall)).transpose()?;

    // Without COUNT nothing before the window needs counting, so the search
    // starts a day ahead of the first occurrence that could overlap it.
    let mut cursor = origin_wall;
    if remaining.is_none() {
        let target = window.start.saturating_sub(duration);
        if target > origin_start {
            cursor = cursor.max(to_local(target, tz).naive_local() - Duration::days(1));
        }
    }
    let bound = [window.end, stop_before, until]
        .into_iter()
        .flatten()
        .fold(MAX_VALID_TIMESTAMP_MS, Ms::min);
    let horizon = to_local(bound, tz).naive_local() + Duration::days(1);

    Ok(Occurrences {
        set,
        tz,
        origin_start,
        origin_millis,
        duration,
        window_start: window.start,
        window_end: window.end,
        stop_before,
        until,
        remaining,
        origin_pending: true,
        cursor,
        horizon,
        pending: VecDeque::new(),
        exhausted: false,
        done: false,
    })
}

/// Expand a stored blocking rule within `window`.
pub fn expand_blocking(rule: &BlockingRule, tz: Tz, window: Window) -> Result<Occurrences, EngineError> {
    let parsed = parse_blocking_rule(rule)?;
    expand(
        parsed.as_ref(),
        rule.span.start,
        rule.occurrence_duration(),
        tz,
        rule.recurrence_end,
        window,
    )
}

/// The parsed rule of a blocking entry, `None` for one-off entries.
pub fn parse_blocking_rule(rule: &BlockingRule) -> Result<Option<RecurrenceRule>, RuleError> {
    match (rule.is_recurring, rule.recurrence_rule.as_deref()) {
        (true, Some(text)) => RecurrenceRule::parse(text).map(Some),
        (true, None) => Err(RuleError::Missing),
        (false, Some(_)) => Err(RuleError::Unexpected),
        (false, None) => Ok(None),
    }
}

impl Occurrences {
    /// Queue the next chunk of dates after the cursor. An empty chunk ends the
    /// rule, unless the rule set gave up searching, which is an overflow.
    fn refill(&mut self) -> Result<(), EngineError> {
        let Some(set) = &self.set else {
            self.exhausted = true;
            return Ok(());
        };
        if self.cursor >= self.horizon {
            self.exhausted = true;
            return Ok(());
        }
        let after = rrule::Tz::UTC.from_utc_datetime(&(self.cursor + Duration::seconds(1)));
        let before = rrule::Tz::UTC.from_utc_datetime(&self.horizon);
        let chunk = set.clone().after(after).before(before).all(CHUNK);
        if chunk.dates.is_empty() {
            if chunk.limited {
                return Err(EngineError::ExpansionOverflow);
            }
            self.exhausted = true;
            return Ok(());
        }
        for date in chunk.dates {
            let wall = date.naive_utc();
            if wall <= self.cursor {
                continue;
            }
            self.cursor = wall;
            let start = resolve_local(wall, self.tz) + self.origin_millis;
            if start > self.origin_start {
                self.pending.push_back(start);
            }
        }
        Ok(())
    }
}

impl Iterator for Occurrences {
    type Item = Result<Span, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let start = if self.origin_pending {
                self.origin_pending = false;
                self.origin_start
            } else if let Some(start) = self.pending.pop_front() {
                start
            } else if self.exhausted {
                self.done = true;
                return None;
            } else {
                if let Err(e) = self.refill() {
                    self.done = true;
                    return Some(Err(e));
                }
                continue;
            };

            if let Some(remaining) = self.remaining.as_mut() {
                if *remaining == 0 {
                    self.done = true;
                    return None;
                }
                *remaining -= 1;
            }
            let past_end = self.until.is_some_and(|u| start > u)
                || self.stop_before.is_some_and(|b| start >= b)
                || self.window_end.is_some_and(|e| start >= e)
                || start >= MAX_VALID_TIMESTAMP_MS;
            if past_end {
                self.done = true;
                return None;
            }

            let span = Span {
                start,
                end: start + self.duration,
            };
            if span.end > self.window_start {
                return Some(Ok(span));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, NaiveDate, Timelike, Weekday};

    const H: Ms = 3_600_000;
    const DAY: Ms = 24 * H;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, tz: Tz) -> Ms {
        let naive: NaiveDateTime = NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap();
        resolve_local(naive, tz)
    }

    fn rule(text: &str) -> RecurrenceRule {
        RecurrenceRule::parse(text).unwrap()
    }

    fn spans(occurrences: Occurrences) -> Vec<Span> {
        occurrences.collect::<Result<_, _>>().unwrap()
    }

    fn local_days(occurrences: Occurrences) -> Vec<(i32, u32, u32)> {
        spans(occurrences)
            .iter()
            .map(|s| {
                let d = to_local(s.start, Tz::UTC);
                (d.year(), d.month(), d.day())
            })
            .collect()
    }

    #[test]
    fn non_recurring_yields_single_span() {
        let single = spans(expand(None, 1_000, 500, Tz::UTC, None, Window::new(0, 10_000)).unwrap());
        assert_eq!(single, vec![Span::new(1_000, 1_500)]);

        let outside = expand(None, 1_000, 500, Tz::UTC, None, Window::new(2_000, 3_000)).unwrap();
        assert_eq!(outside.count(), 0);
    }

    #[test]
    fn unbounded_rule_without_window_end_overflows() {
        let r = rule("FREQ=WEEKLY");
        let result = expand(Some(&r), 0, H, Tz::UTC, None, Window::open_ended(0));
        assert!(matches!(result, Err(EngineError::ExpansionOverflow)));

        // COUNT bounds the rule, so an open window is fine.
        let r = rule("FREQ=WEEKLY;COUNT=3");
        let got = spans(expand(Some(&r), 0, H, Tz::UTC, None, Window::open_ended(0)).unwrap());
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn weekly_weekend_rule() {
        // 2026-01-03 is a Saturday.
        let origin = at(2026, 1, 3, 0, 0, Tz::UTC);
        let r = rule("FREQ=WEEKLY;BYDAY=SA,SU");
        let window = Window::new(origin, origin + 14 * DAY);
        let starts: Vec<Ms> = spans(expand(Some(&r), origin, DAY, Tz::UTC, None, window).unwrap())
            .iter()
            .map(|s| s.start)
            .collect();
        assert_eq!(
            starts,
            vec![origin, origin + DAY, origin + 7 * DAY, origin + 8 * DAY]
        );
    }

    #[test]
    fn weekly_ninety_day_window_is_bounded() {
        let origin = at(2026, 1, 5, 9, 0, Tz::UTC);
        let r = rule("FREQ=WEEKLY");
        let window = Window::new(origin + 200 * DAY, origin + 290 * DAY);
        let got = spans(expand(Some(&r), origin, H, Tz::UTC, None, window).unwrap());
        assert!(!got.is_empty());
        assert!(got.len() <= 90 / 7 + 1);
        for s in &got {
            assert!(s.start >= window.start && s.start < window.end.unwrap());
            assert_eq!((s.start - origin) % (7 * DAY), 0);
        }
    }

    #[test]
    fn weekly_keeps_local_time_across_dst() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // Mondays 09:00, starting before the 2026-03-29 switch to summer time.
        let origin = at(2026, 3, 16, 9, 0, tz);
        let r = rule("FREQ=WEEKLY;COUNT=4");
        let got = spans(expand(Some(&r), origin, H, tz, None, Window::open_ended(origin)).unwrap());
        assert_eq!(got.len(), 4);
        for s in &got {
            let local = to_local(s.start, tz);
            assert_eq!(local.weekday(), Weekday::Mon);
            assert_eq!(local.hour(), 9);
        }
        // Summer time makes the week that spans the switch one hour shorter.
        assert_eq!(got[2].start - got[1].start, 7 * DAY - H);
    }

    #[test]
    fn partial_overlap_keeps_true_bounds() {
        let r = rule("FREQ=DAILY");
        let window = Window::new(DAY + 30 * 60_000, DAY + 2 * H);
        let got = spans(expand(Some(&r), 0, H, Tz::UTC, None, window).unwrap());
        assert_eq!(got, vec![Span::new(DAY, DAY + H)]);
    }

    #[test]
    fn sub_second_origin_is_kept() {
        let r = rule("FREQ=DAILY;COUNT=2");
        let got = spans(expand(Some(&r), 250, H, Tz::UTC, None, Window::open_ended(0)).unwrap());
        assert_eq!(got, vec![Span::new(250, 250 + H), Span::new(DAY + 250, DAY + 250 + H)]);
    }

    #[test]
    fn stop_before_and_until() {
        let r = rule("FREQ=DAILY");
        let got = spans(expand(Some(&r), 0, H, Tz::UTC, Some(3 * DAY), Window::open_ended(0)).unwrap());
        assert_eq!(got.len(), 3);

        // UNTIL is inclusive.
        let r = rule("FREQ=DAILY;UNTIL=19700103T000000Z");
        let got = spans(expand(Some(&r), 0, H, Tz::UTC, None, Window::open_ended(0)).unwrap());
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn count_includes_occurrences_before_window() {
        let r = rule("FREQ=DAILY;COUNT=5");
        let got = spans(expand(Some(&r), 0, H, Tz::UTC, None, Window::new(3 * DAY, 100 * DAY)).unwrap());
        assert_eq!(got, vec![Span::new(3 * DAY, 3 * DAY + H), Span::new(4 * DAY, 4 * DAY + H)]);
    }

    #[test]
    fn monthly_last_friday() {
        let origin = at(2026, 1, 30, 14, 0, Tz::UTC);
        let r = rule("FREQ=MONTHLY;BYDAY=-1FR;COUNT=3");
        let days = local_days(expand(Some(&r), origin, H, Tz::UTC, None, Window::open_ended(origin)).unwrap());
        assert_eq!(days, vec![(2026, 1, 30), (2026, 2, 27), (2026, 3, 27)]);
    }

    #[test]
    fn monthly_day_31_skips_short_months() {
        let origin = at(2026, 1, 31, 8, 0, Tz::UTC);
        let r = rule("FREQ=MONTHLY;COUNT=3");
        let days = local_days(expand(Some(&r), origin, H, Tz::UTC, None, Window::open_ended(origin)).unwrap());
        assert_eq!(days, vec![(2026, 1, 31), (2026, 3, 31), (2026, 5, 31)]);
    }

    #[test]
    fn yearly_holiday() {
        let origin = at(2026, 12, 25, 0, 0, Tz::UTC);
        let r = rule("FREQ=YEARLY");
        let window = Window::new(origin, at(2030, 1, 1, 0, 0, Tz::UTC));
        let years: Vec<i32> = local_days(expand(Some(&r), origin, DAY, Tz::UTC, None, window).unwrap())
            .into_iter()
            .map(|(y, _, _)| y)
            .collect();
        assert_eq!(years, vec![2026, 2027, 2028, 2029]);
    }

    #[test]
    fn sparse_daily_rule_reaches_its_count() {
        // Leap days only: four years between matches must not end the series.
        let origin = at(2026, 1, 10, 9, 0, Tz::UTC);
        let r = rule("FREQ=DAILY;BYMONTH=2;BYMONTHDAY=29;COUNT=5");
        let days = local_days(expand(Some(&r), origin, H, Tz::UTC, None, Window::open_ended(origin)).unwrap());
        assert_eq!(
            days,
            vec![(2026, 1, 10), (2028, 2, 29), (2032, 2, 29), (2036, 2, 29), (2040, 2, 29)]
        );
    }

    #[test]
    fn impossible_rule_terminates() {
        let origin = at(2026, 1, 1, 0, 0, Tz::UTC);
        let r = rule("FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=30");
        let result: Result<Vec<Span>, _> = expand(Some(&r), origin, H, Tz::UTC, None, Window::new(origin + DAY, i64::MAX / 2))
            .unwrap()
            .collect();
        match result {
            Ok(got) => assert!(got.is_empty()),
            Err(e) => assert!(matches!(e, EngineError::ExpansionOverflow)),
        }
    }

    #[test]
    fn iterator_is_restartable() {
        let r = rule("FREQ=DAILY;INTERVAL=2");
        let mut it = expand(Some(&r), 0, H, Tz::UTC, None, Window::new(0, 10 * DAY)).unwrap();
        it.next();
        let fork = it.clone();
        let rest = spans(it);
        assert_eq!(rest, spans(fork));
        assert_eq!(rest.len(), 4);
    }

    #[test]
    fn blocking_rule_validation() {
        use crate::model::{BlockingKind, EntityRef, NewBlocking};
        use ulid::Ulid;

        let entity = EntityRef::Building(Ulid::new());
        let mut b = NewBlocking::once(BlockingKind::Holiday, Span::new(0, DAY)).into_rule(Ulid::new(), entity);
        b.recurrence_rule = Some("FREQ=YEARLY".into());
        assert!(matches!(
            expand_blocking(&b, Tz::UTC, Window::new(0, DAY)),
            Err(EngineError::InvalidRecurrenceRule(RuleError::Unexpected))
        ));

        b.is_recurring = true;
        b.recurrence_rule = None;
        assert!(matches!(
            expand_blocking(&b, Tz::UTC, Window::new(0, DAY)),
            Err(EngineError::InvalidRecurrenceRule(RuleError::Missing))
        ));

        b.recurrence_rule = Some("FREQ=DAILY".into());
        b.recurrence_duration = Some(H);
        let got = spans(expand_blocking(&b, Tz::UTC, Window::new(0, 2 * DAY)).unwrap());
        assert_eq!(got, vec![Span::new(0, H), Span::new(DAY, DAY + H)]);
    }
}
