use chrono_tz::Tz;

use crate::model::*;
use crate::recurrence::expand_blocking;

use super::EngineError;

/// Busy intervals produced by a node's own blocking rules within `window`,
/// with their true bounds.
pub(super) fn blocking_busy(
    node: &NodeState,
    tz: Tz,
    window: Span,
    out: &mut Vec<BusyInterval>,
) -> Result<(), EngineError> {
    // Blockings are sorted by first occurrence; none after window.end can reach in.
    for rule in node.blockings.iter().take_while(|b| b.span.start < window.end) {
        for span in expand_blocking(rule, tz, window.into())? {
            let span = span?;
            out.push(BusyInterval {
                span,
                origin: BusyOrigin::Blocking(rule.id),
                level: node.kind,
            });
        }
    }
    Ok(())
}

/// Reservations of a place that still occupy time within `window`.
pub(super) fn reservation_busy(place: &PlaceState, window: Span, out: &mut Vec<BusyInterval>) {
    out.extend(place.occupying(&window).map(|r| BusyInterval {
        span: r.span,
        origin: BusyOrigin::Reservation(r.id),
        level: EntityKind::Place,
    }));
}

/// Everything that makes a place busy within `window`: blockings at every
/// level (additive inheritance) plus the place's own reservations.
/// `nodes` runs from the place up to its building.
pub(super) fn place_busy(nodes: &[&NodeState], tz: Tz, window: Span) -> Result<Vec<BusyInterval>, EngineError> {
    let mut out = Vec::new();
    for node in nodes {
        blocking_busy(node, tz, window, &mut out)?;
        if let Some(place) = &node.place {
            reservation_busy(place, window, &mut out);
        }
    }
    Ok(out)
}

/// The busy interval that overlaps `span` and starts first (ties by origin).
pub(super) fn first_conflict(busy: &[BusyInterval], span: &Span) -> Option<BusyInterval> {
    busy.iter()
        .filter(|b| b.span.overlaps(span))
        .min_by_key(|b| (b.span.start, b.origin))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const DAY: Ms = 24 * H;

    #[test]
    fn recurring_and_one_off_blockings() {
        let building = Ulid::new();
        let mut node = NodeState::building(building, None);
        let entity = node.entity();
        let nightly = NewBlocking::recurring(BlockingKind::ClosedHours, Span::new(18 * H, 32 * H), "FREQ=DAILY")
            .into_rule(Ulid::new(), entity);
        let future = NewBlocking::once(BlockingKind::Event, Span::new(10 * DAY, 11 * DAY))
            .into_rule(Ulid::new(), entity);
        node.insert_blocking(nightly.clone());
        node.insert_blocking(future);

        let mut out = Vec::new();
        blocking_busy(&node, Tz::UTC, Span::new(DAY, 2 * DAY), &mut out).unwrap();
        // Day 0 closing runs into the window; day 1 closing starts in it.
        let spans: Vec<Span> = out.iter().map(|b| b.span).collect();
        assert_eq!(spans, vec![Span::new(18 * H, 32 * H), Span::new(DAY + 18 * H, DAY + 32 * H)]);
        assert!(out.iter().all(|b| b.origin == BusyOrigin::Blocking(nightly.id)));
        assert!(out.iter().all(|b| b.level == EntityKind::Building));
    }

    #[test]
    fn cancelled_reservations_are_free() {
        let place_id = Ulid::new();
        let mut node = NodeState::place(place_id, Ulid::new(), None, PlaceSettings::default());
        let place = node.place.as_mut().unwrap();
        for (start, status) in [(0, ReservationStatus::Cancelled), (2 * H, ReservationStatus::Confirmed)] {
            place.insert_reservation(Reservation {
                id: Ulid::new(),
                place_id,
                user_id: Ulid::new(),
                span: Span::new(start, start + H),
                status,
                check_in_time: None,
                cancel_reason: None,
                cancel_time: None,
                is_recurring: false,
                recurring_group_id: None,
                created_at: 0,
            });
        }
        let busy = place_busy(&[&node], Tz::UTC, Span::new(0, DAY)).unwrap();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].span, Span::new(2 * H, 3 * H));
        assert!(first_conflict(&busy, &Span::new(0, H)).is_none());
        assert!(first_conflict(&busy, &Span::new(2 * H + 1, 4 * H)).is_some());
    }
}
