use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::now_ms;
use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::{NO_SHOWS_TOTAL, TRANSITIONS_TOTAL};

use super::{Engine, EngineError};

pub const NO_SHOW_REASON: &str = "no-show";

fn check_reason(reason: &Option<String>) -> Result<(), EngineError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(EngineError::LimitExceeded("cancel reason too long")),
        _ => Ok(()),
    }
}

fn find(node: &NodeState, id: Ulid) -> Result<&Reservation, EngineError> {
    node.place
        .as_ref()
        .and_then(|p| p.reservation(id))
        .ok_or(EngineError::NotFound(id))
}

fn transition(name: &'static str) {
    metrics::counter!(TRANSITIONS_TOTAL, "transition" => name).increment(1);
}

impl Engine {
    /// Write-lock the place that owns a reservation.
    async fn lock_reservation(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<NodeState>, EngineError> {
        let place_id = self.store.place_of_reservation(&id).ok_or(EngineError::NotFound(id))?;
        self.store.write(place_id).await
    }

    /// Pending → confirmed. Confirming a confirmed reservation is a no-op.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let guard = self.lock_reservation(id).await?;
        let current = find(&guard, id)?;
        match current.status {
            ReservationStatus::Pending => {}
            ReservationStatus::Confirmed => return Ok(current.clone()),
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    action: "confirm",
                });
            }
        }
        let mut updated = current.clone();
        updated.status = ReservationStatus::Confirmed;
        let event = Event::ReservationConfirmed {
            id,
            place_id: updated.place_id,
        };
        self.committer.apply(guard, event, ()).await?;
        transition("confirm");
        debug!(%id, "reservation confirmed");
        Ok(updated)
    }

    pub async fn check_in(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.check_in_at(id, now_ms()).await
    }

    /// Confirmed → checked-in, only inside the place's check-in window
    /// `[start - earliest_offset, start + timeout]`. Repeating it is a no-op.
    pub async fn check_in_at(&self, id: Ulid, at: Ms) -> Result<Reservation, EngineError> {
        let guard = self.lock_reservation(id).await?;
        let current = find(&guard, id)?;
        match current.status {
            ReservationStatus::Confirmed => {}
            ReservationStatus::CheckedIn => return Ok(current.clone()),
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    action: "check in",
                });
            }
        }
        let policy = guard
            .place
            .as_ref()
            .map(|p| p.settings.check_in)
            .unwrap_or_default();
        let (opens, closes) = policy.window(current.span.start);
        if at < opens || at > closes {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
                action: "check in outside the check-in window",
            });
        }

        let mut updated = current.clone();
        updated.status = ReservationStatus::CheckedIn;
        updated.check_in_time = Some(at);
        let event = Event::ReservationCheckedIn {
            id,
            place_id: updated.place_id,
            at,
        };
        self.committer.apply(guard, event, ()).await?;
        transition("check_in");
        debug!(%id, at, "reservation checked in");
        Ok(updated)
    }

    pub async fn cancel_reservation(&self, id: Ulid, reason: Option<String>) -> Result<Reservation, EngineError> {
        self.cancel_at(id, reason, now_ms()).await
    }

    /// Pending or confirmed → cancelled. Cancelling twice is a no-op; a
    /// checked-in reservation cannot be cancelled.
    pub async fn cancel_at(&self, id: Ulid, reason: Option<String>, at: Ms) -> Result<Reservation, EngineError> {
        check_reason(&reason)?;
        let guard = self.lock_reservation(id).await?;
        let current = find(&guard, id)?;
        match current.status {
            ReservationStatus::Pending | ReservationStatus::Confirmed => {}
            ReservationStatus::Cancelled => return Ok(current.clone()),
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    action: "cancel",
                });
            }
        }
        let mut updated = current.clone();
        updated.status = ReservationStatus::Cancelled;
        updated.cancel_reason = reason.clone();
        updated.cancel_time = Some(at);
        let event = Event::ReservationsCancelled {
            place_id: updated.place_id,
            ids: vec![id],
            reason,
            at,
        };
        self.committer.apply(guard, event, ()).await?;
        transition("cancel");
        debug!(%id, "reservation cancelled");
        Ok(updated)
    }

    /// Cancel every still-cancellable member of a series in one journal
    /// record. Checked-in and already cancelled members are left alone.
    /// Returns the members this call cancelled.
    pub async fn cancel_series(&self, group_id: Ulid, reason: Option<String>) -> Result<Vec<Reservation>, EngineError> {
        check_reason(&reason)?;
        let (place_id, members) = self.store.group(&group_id).ok_or(EngineError::NotFound(group_id))?;
        let guard = self.store.write(place_id).await?;
        let at = now_ms();

        let mut cancelled = Vec::new();
        for id in members {
            let current = find(&guard, id)?;
            if matches!(
                current.status,
                ReservationStatus::Pending | ReservationStatus::Confirmed
            ) {
                let mut updated = current.clone();
                updated.status = ReservationStatus::Cancelled;
                updated.cancel_reason = reason.clone();
                updated.cancel_time = Some(at);
                cancelled.push(updated);
            }
        }
        if cancelled.is_empty() {
            return Ok(cancelled);
        }

        let event = Event::ReservationsCancelled {
            place_id,
            ids: cancelled.iter().map(|r| r.id).collect(),
            reason,
            at,
        };
        self.committer.apply(guard, event, ()).await?;
        metrics::counter!(TRANSITIONS_TOTAL, "transition" => "cancel").increment(cancelled.len() as u64);
        info!(group = %group_id, cancelled = cancelled.len(), "series cancelled");
        Ok(cancelled)
    }

    /// Confirmed reservations at check-in places whose check-in window closed
    /// before `now`. Places currently locked are skipped until the next sweep.
    pub fn collect_no_shows(&self, now: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for id in self.store.node_ids() {
            let Some(node) = self.store.node(&id) else { continue };
            let Ok(guard) = node.try_read() else { continue };
            let Some(place) = &guard.place else { continue };
            let policy = place.settings.check_in;
            if !policy.required {
                continue;
            }
            expired.extend(
                place
                    .reservations
                    .iter()
                    .filter(|r| r.status == ReservationStatus::Confirmed && policy.closes(r.span.start) < now)
                    .map(|r| r.id),
            );
        }
        expired
    }

    /// Cancel one no-show, re-checking under the lock. Returns whether it was cancelled.
    pub async fn expire_no_show(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let guard = self.lock_reservation(id).await?;
        let current = find(&guard, id)?;
        let policy = guard
            .place
            .as_ref()
            .map(|p| p.settings.check_in)
            .unwrap_or_default();
        let overdue = current.status == ReservationStatus::Confirmed
            && policy.required
            && policy.closes(current.span.start) < now;
        if !overdue {
            return Ok(false);
        }
        let event = Event::ReservationsCancelled {
            place_id: current.place_id,
            ids: vec![id],
            reason: Some(NO_SHOW_REASON.to_string()),
            at: now,
        };
        self.committer.apply(guard, event, ()).await?;
        metrics::counter!(NO_SHOWS_TOTAL).increment(1);
        info!(%id, "no-show cancelled");
        Ok(true)
    }
}
