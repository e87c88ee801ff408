use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::now_ms;
use crate::limits::{MAX_SERIES_HORIZON_MS, MAX_SERIES_OCCURRENCES};
use crate::model::*;
use crate::observability::{ADMISSION_DURATION_SECONDS, SERIES_ADMISSIONS_TOTAL};
use crate::recurrence::{RecurrenceRule, Termination, expand};

use super::admission::{Prepared, outcome_label, validate_span};
use super::busy::first_conflict;
use super::{Engine, EngineError};

/// Expand a recurring request into `(index, span)` pairs, index counted from
/// the origin occurrence. Skipped indices keep their numbering.
pub(super) fn plan_occurrences(
    origin: Span,
    recurrence: &RecurrenceRequest,
    tz: chrono_tz::Tz,
) -> Result<Vec<(u32, Span)>, EngineError> {
    let mut rule = RecurrenceRule::parse(&recurrence.rule)?;
    if let (Termination::Never, Some(n)) = (rule.termination, recurrence.count) {
        rule.termination = Termination::Count(n);
    }
    let occurrences = expand(
        Some(&rule),
        origin.start,
        origin.duration_ms(),
        tz,
        recurrence.until,
        Window::open_ended(origin.start),
    )?;
    let take = recurrence.count.map_or(usize::MAX, |n| n as usize);
    let horizon = origin.start + MAX_SERIES_HORIZON_MS;
    let skip: HashSet<u32> = recurrence.skip.iter().copied().collect();

    let mut planned = Vec::new();
    for (index, span) in occurrences.take(take).enumerate() {
        let span = span?;
        if index >= MAX_SERIES_OCCURRENCES {
            return Err(EngineError::LimitExceeded("too many occurrences in series"));
        }
        if span.start >= horizon {
            return Err(EngineError::LimitExceeded("series horizon too long"));
        }
        let index = index as u32;
        if skip.contains(&index) {
            continue;
        }
        validate_span(&span)?;
        planned.push((index, span));
    }
    if planned.is_empty() {
        return Err(EngineError::InvalidSpan("series has no occurrences to book"));
    }
    Ok(planned)
}

/// Check every planned occurrence against the busy set and against the
/// occurrences before it.
pub(super) fn series_conflicts(planned: &[(u32, Span)], busy: &[BusyInterval]) -> Vec<OccurrenceConflict> {
    let mut conflicts = Vec::new();
    for (pos, &(index, span)) in planned.iter().enumerate() {
        let external = first_conflict(busy, &span).map(|b| (b.span.start, b.origin));
        let internal = planned[..pos]
            .iter()
            .find(|(_, earlier)| earlier.overlaps(&span))
            .map(|&(i, earlier)| (earlier.start, BusyOrigin::Occurrence(i)));
        let hit = match (external, internal) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some((_, origin)) = hit {
            conflicts.push(OccurrenceConflict { index, span, origin });
        }
    }
    conflicts
}

impl Engine {
    /// Validate and commit a whole recurring series atomically: every
    /// occurrence or none. On conflict nothing is written and each
    /// conflicting occurrence index is reported.
    pub async fn admit_series(
        &self,
        place_id: Ulid,
        user_id: Ulid,
        origin: Span,
        recurrence: RecurrenceRequest,
    ) -> Result<(Ulid, Vec<Reservation>), EngineError> {
        let started = Instant::now();
        let result = match self.prepare_series(place_id, user_id, origin, recurrence).await {
            Ok(prepared) => prepared.commit(&self.committer).await,
            Err(e) => Err(e),
        };
        if let Ok((group_id, reservations)) = &result {
            info!(place = %place_id, group = %group_id, occurrences = reservations.len(), "series admitted");
        }
        metrics::counter!(SERIES_ADMISSIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        metrics::histogram!(ADMISSION_DURATION_SECONDS, "kind" => "series")
            .record(started.elapsed().as_secs_f64());
        result
    }

    pub(super) async fn prepare_series(
        &self,
        place_id: Ulid,
        user_id: Ulid,
        origin: Span,
        recurrence: RecurrenceRequest,
    ) -> Result<Prepared<(Ulid, Vec<Reservation>)>, EngineError> {
        validate_span(&origin)?;
        let planned = plan_occurrences(origin, &recurrence, self.tz)?;
        let hierarchy = self.resolve(place_id)?;

        // One critical section from the checks through the commit.
        let locks = self.lock_place(&hierarchy).await?;
        locks.check_bookable(planned.len(), now_ms())?;

        let (first, last) = match (planned.first(), planned.last()) {
            (Some(first), Some(last)) => (first.1, last.1),
            _ => return Err(EngineError::InvalidSpan("series has no occurrences to book")),
        };
        let end = planned.iter().map(|(_, s)| s.end).max().unwrap_or(last.end);
        let busy = locks.busy(self.tz, Span { start: first.start, end })?;

        let conflicts = series_conflicts(&planned, &busy);
        if !conflicts.is_empty() {
            debug!(
                place = %place_id,
                occurrences = planned.len(),
                conflicts = conflicts.len(),
                "series rejected"
            );
            return Err(EngineError::PartialConflict { conflicts });
        }

        let group_id = Ulid::new();
        let created_at = now_ms();
        let reservations: Vec<Reservation> = planned
            .iter()
            .map(|&(_, span)| Reservation {
                id: Ulid::new(),
                place_id,
                user_id,
                span,
                status: ReservationStatus::Pending,
                check_in_time: None,
                cancel_reason: None,
                cancel_time: None,
                is_recurring: true,
                recurring_group_id: Some(group_id),
                created_at,
            })
            .collect();
        let event = Event::SeriesAdmitted {
            group_id,
            place_id,
            reservations: reservations.clone(),
        };
        Ok(Prepared::new(locks, event, (group_id, reservations)))
    }
}
