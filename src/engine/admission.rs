use std::time::Instant;

use chrono_tz::Tz;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::debug;
use ulid::Ulid;

use crate::calendar::now_ms;
use crate::limits::*;
use crate::model::*;
use crate::observability::{ADMISSION_DURATION_SECONDS, ADMISSIONS_TOTAL, SERIES_ADMISSIONS_TOTAL};

use super::busy::{first_conflict, place_busy};
use super::{Committer, Engine, EngineError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(super) fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(EngineError::Conflict { .. }) => "conflict",
        Err(EngineError::PartialConflict { .. }) => "partial_conflict",
        Err(EngineError::Cancelled) => "cancelled",
        Err(_) => "rejected",
    }
}

/// Exclusive lock on a place with shared locks on its area and building,
/// acquired deepest first. Holding it makes check-then-insert atomic per place.
pub(super) struct PlaceLocks {
    pub place: OwnedRwLockWriteGuard<NodeState>,
    pub ancestors: [OwnedRwLockReadGuard<NodeState>; 2],
}

impl PlaceLocks {
    pub fn state(&self) -> Result<&PlaceState, EngineError> {
        self.place.place.as_ref().ok_or(EngineError::DataIntegrity {
            node: self.place.id,
            detail: "place node without booking state",
        })
    }

    /// Reject bookings on disabled or non-bookable places, and full books.
    /// Only reservations still holding time from `now` on fill the book.
    pub fn check_bookable(&self, extra: usize, now: Ms) -> Result<(), EngineError> {
        let state = self.state()?;
        if !state.settings.accepts_bookings() {
            return Err(EngineError::NotBookable(self.place.id));
        }
        if state.upcoming_count(now) + extra > MAX_RESERVATIONS_PER_PLACE {
            return Err(EngineError::LimitExceeded("too many reservations on place"));
        }
        Ok(())
    }

    pub fn busy(&self, tz: Tz, window: Span) -> Result<Vec<BusyInterval>, EngineError> {
        place_busy(&[&*self.place, &*self.ancestors[0], &*self.ancestors[1]], tz, window)
    }
}

/// An admission that passed every check and still holds its place locks.
/// Nothing is written until `commit`.
pub(super) struct Prepared<T> {
    locks: PlaceLocks,
    event: Event,
    outcome: T,
}

impl<T> Prepared<T> {
    pub fn new(locks: PlaceLocks, event: Event, outcome: T) -> Self {
        Self { locks, event, outcome }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Prepared<U> {
        Prepared {
            locks: self.locks,
            event: self.event,
            outcome: f(self.outcome),
        }
    }

    /// Journal and apply the event. Runs to completion once started, even if
    /// the caller stops waiting.
    pub async fn commit(self, committer: &Committer) -> Result<T, EngineError> {
        let PlaceLocks { place, ancestors } = self.locks;
        committer.apply(place, self.event, ancestors).await?;
        Ok(self.outcome)
    }
}

impl Engine {
    pub(super) async fn lock_place(&self, hierarchy: &Hierarchy) -> Result<PlaceLocks, EngineError> {
        let place = self.store.write(hierarchy.place).await?;
        let area = self.store.read(hierarchy.area).await?;
        let building = self.store.read(hierarchy.building).await?;
        Ok(PlaceLocks {
            place,
            ancestors: [area, building],
        })
    }

    /// Admit one reservation as `Pending`, or fail with the earliest conflict.
    pub async fn admit(&self, request: ReservationRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = match self.prepare_single(request).await {
            Ok(prepared) => prepared.commit(&self.committer).await,
            Err(e) => Err(e),
        };
        if let Ok(reservation) = &result {
            debug!(place = %reservation.place_id, id = %reservation.id, "reservation admitted");
        }
        metrics::counter!(ADMISSIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        metrics::histogram!(ADMISSION_DURATION_SECONDS, "kind" => "single")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn prepare_single(&self, request: ReservationRequest) -> Result<Prepared<Reservation>, EngineError> {
        validate_span(&request.span)?;
        let hierarchy = self.resolve(request.place_id)?;
        let locks = self.lock_place(&hierarchy).await?;
        locks.check_bookable(1, now_ms())?;

        let busy = locks.busy(self.tz, request.span)?;
        if let Some(hit) = first_conflict(&busy, &request.span) {
            debug!(
                place = %request.place_id,
                start = request.span.start,
                end = request.span.end,
                origin = %hit.origin,
                "admission rejected"
            );
            return Err(EngineError::Conflict {
                origin: hit.origin,
                span: hit.span,
            });
        }

        let reservation = Reservation {
            id: Ulid::new(),
            place_id: request.place_id,
            user_id: request.user_id,
            span: request.span,
            status: ReservationStatus::Pending,
            check_in_time: None,
            cancel_reason: None,
            cancel_time: None,
            is_recurring: false,
            recurring_group_id: None,
            created_at: now_ms(),
        };
        let event = Event::ReservationAdmitted {
            reservation: reservation.clone(),
        };
        Ok(Prepared::new(locks, event, reservation))
    }

    /// Book a single span or a recurring series.
    pub async fn create_reservation(&self, request: CreateReservation) -> Result<Booked, EngineError> {
        let CreateReservation {
            place_id,
            user_id,
            span,
            recurrence,
        } = request;
        match recurrence {
            None => self
                .admit(ReservationRequest {
                    place_id,
                    user_id,
                    span,
                })
                .await
                .map(Booked::Single),
            Some(recurrence) => {
                let (group_id, reservations) = self.admit_series(place_id, user_id, span, recurrence).await?;
                Ok(Booked::Series {
                    group_id,
                    reservations,
                })
            }
        }
    }

    /// `create_reservation` with a deadline on the checking phase. Expiry
    /// while resolving, locking or checking for conflicts leaves nothing
    /// behind and reports `Cancelled`. Once the commit starts the call waits
    /// for it and returns its real outcome.
    pub async fn create_reservation_within(
        &self,
        request: CreateReservation,
        timeout: std::time::Duration,
    ) -> Result<Booked, EngineError> {
        let kind = if request.recurrence.is_some() { "series" } else { "single" };
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.prepare_booking(request)).await {
            Err(_) => Err(EngineError::Cancelled),
            Ok(Err(e)) => Err(e),
            Ok(Ok(prepared)) => prepared.commit(&self.committer).await,
        };
        let counter = if kind == "series" { SERIES_ADMISSIONS_TOTAL } else { ADMISSIONS_TOTAL };
        metrics::counter!(counter, "outcome" => outcome_label(&result)).increment(1);
        metrics::histogram!(ADMISSION_DURATION_SECONDS, "kind" => kind).record(started.elapsed().as_secs_f64());
        result
    }

    async fn prepare_booking(&self, request: CreateReservation) -> Result<Prepared<Booked>, EngineError> {
        let CreateReservation {
            place_id,
            user_id,
            span,
            recurrence,
        } = request;
        match recurrence {
            None => Ok(self
                .prepare_single(ReservationRequest {
                    place_id,
                    user_id,
                    span,
                })
                .await?
                .map(Booked::Single)),
            Some(recurrence) => Ok(self
                .prepare_series(place_id, user_id, span, recurrence)
                .await?
                .map(|(group_id, reservations)| Booked::Series {
                    group_id,
                    reservations,
                })),
        }
    }
}
