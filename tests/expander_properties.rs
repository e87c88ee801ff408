//! Property-based tests for recurrence expansion.

use chrono::NaiveDate;
use chrono_tz::Tz;
use proptest::prelude::*;
use roomy::calendar::resolve_local;
use roomy::model::{Ms, Span, Window};
use roomy::recurrence::{RecurrenceRule, expand};

const M: Ms = 60_000;
const DAY: Ms = 24 * 60 * M;

fn arb_freq() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("DAILY"), Just("WEEKLY"), Just("MONTHLY"), Just("YEARLY")]
}

fn arb_timezone() -> impl Strategy<Value = Tz> {
    prop_oneof![
        Just(Tz::UTC),
        Just(chrono_tz::America::New_York),
        Just(chrono_tz::Europe::Berlin),
        Just(chrono_tz::Australia::Sydney),
        Just(chrono_tz::Asia::Tokyo),
    ]
}

/// Origin instant in 2025-2027, day capped at 28 so every month has it.
fn arb_origin() -> impl Strategy<Value = (i32, u32, u32, u32, u32)> {
    (2025i32..=2027, 1u32..=12, 1u32..=28, 0u32..=23, 0u32..=59)
}

fn origin_ms((y, m, d, h, min): (i32, u32, u32, u32, u32), tz: Tz) -> Ms {
    let naive = NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(h, min, 0))
        .unwrap();
    resolve_local(naive, tz)
}

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    }
}

proptest! {
    #![proptest_config(config())]

    /// Weekly rule with no end over a 90-day window: only occurrences that
    /// touch the window, never more than 90/7 + 1 of them.
    #[test]
    fn weekly_ninety_day_window_is_bounded(
        origin in arb_origin(),
        tz in arb_timezone(),
        offset_days in 0i64..400,
        minutes in 15i64..=120,
    ) {
        let start = origin_ms(origin, tz);
        let rule = RecurrenceRule::parse("FREQ=WEEKLY").unwrap();
        let window_start = start + offset_days * DAY;
        let window = Window::new(window_start, window_start + 90 * DAY);
        let spans: Vec<Span> = expand(Some(&rule), start, minutes * M, tz, None, window)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        prop_assert!(spans.len() <= 90 / 7 + 1, "got {} occurrences", spans.len());
        prop_assert!(spans.len() >= 12);
        for span in &spans {
            prop_assert!(span.end > window_start && span.start < window_start + 90 * DAY);
        }
    }

    #[test]
    fn expansion_is_strictly_ascending(
        freq in arb_freq(),
        interval in 1u32..=4,
        count in 1u32..=40,
        origin in arb_origin(),
        tz in arb_timezone(),
    ) {
        let start = origin_ms(origin, tz);
        let rule = RecurrenceRule::parse(&format!("FREQ={freq};INTERVAL={interval};COUNT={count}")).unwrap();
        let spans: Vec<Span> = expand(Some(&rule), start, 30 * M, tz, None, Window::open_ended(start))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].start < pair[1].start, "{:?} !< {:?}", pair[0], pair[1]);
        }
    }

    /// COUNT includes the origin and is met exactly for simple rules.
    #[test]
    fn count_respected_and_origin_first(
        freq in arb_freq(),
        count in 1u32..=40,
        origin in arb_origin(),
        tz in arb_timezone(),
        minutes in 15i64..=120,
    ) {
        let start = origin_ms(origin, tz);
        let rule = RecurrenceRule::parse(&format!("FREQ={freq};COUNT={count}")).unwrap();
        let spans: Vec<Span> = expand(Some(&rule), start, minutes * M, tz, None, Window::open_ended(start))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        prop_assert_eq!(spans.len(), count as usize);
        prop_assert_eq!(spans[0].start, start);
        for span in &spans {
            prop_assert_eq!(span.end - span.start, minutes * M);
        }
    }

    /// A clone taken mid-iteration yields the same remainder.
    #[test]
    fn clones_resume_at_the_same_position(
        freq in arb_freq(),
        origin in arb_origin(),
        tz in arb_timezone(),
        taken in 0usize..10,
    ) {
        let start = origin_ms(origin, tz);
        let rule = RecurrenceRule::parse(&format!("FREQ={freq};COUNT=20")).unwrap();
        let mut occurrences = expand(Some(&rule), start, 60 * M, tz, None, Window::open_ended(start)).unwrap();
        for _ in 0..taken {
            occurrences.next();
        }
        let copy = occurrences.clone();
        let rest: Vec<Span> = occurrences.collect::<Result<_, _>>().unwrap();
        let resumed: Vec<Span> = copy.collect::<Result<_, _>>().unwrap();
        prop_assert_eq!(rest, resumed);
    }
}
