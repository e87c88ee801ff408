use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::calendar::now_ms;
use crate::engine::{Engine, EngineError};
use crate::model::Ms;

/// One no-show sweep at `now`. Returns how many reservations were cancelled.
pub async fn reap_no_shows(engine: &Engine, now: Ms) -> usize {
    let mut cancelled = 0;
    for id in engine.collect_no_shows(now) {
        match engine.expire_no_show(id, now).await {
            Ok(true) => cancelled += 1,
            Ok(false) => {}
            // Checked in, cancelled or deleted since the sweep looked.
            Err(EngineError::NotFound(_)) => debug!(%id, "no-show vanished before expiry"),
            Err(e) => warn!(%id, "no-show expiry failed: {e}"),
        }
    }
    if cancelled > 0 {
        info!(cancelled, "no-show sweep finished");
    }
    cancelled
}

/// Periodically cancel confirmed reservations that missed their check-in.
/// Runs until the task is aborted.
pub async fn run_no_show_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        reap_no_shows(&engine, now_ms()).await;
    }
}

/// Compact the journal whenever `threshold` appends have piled up since the
/// last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if engine.journal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_journal().await {
            warn!("journal compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const MIN: Ms = 60_000;
    const H: Ms = 60 * MIN;

    fn journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomy_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn place(engine: &Engine, required: bool) -> Ulid {
        let (b, a, p) = (Ulid::new(), Ulid::new(), Ulid::new());
        engine.create_building(b, None).await.unwrap();
        engine.create_area(a, b, None).await.unwrap();
        let settings = PlaceSettings {
            check_in: CheckInPolicy {
                required,
                ..CheckInPolicy::default()
            },
            ..PlaceSettings::default()
        };
        engine.create_place(p, a, None, settings).await.unwrap();
        p
    }

    async fn confirmed(engine: &Engine, place_id: Ulid, start: Ms) -> Ulid {
        let r = engine
            .admit(ReservationRequest {
                place_id,
                user_id: Ulid::new(),
                span: Span::new(start, start + H),
            })
            .await
            .unwrap();
        engine.confirm_reservation(r.id).await.unwrap();
        r.id
    }

    #[tokio::test]
    async fn cancels_overdue_confirmed_reservations() {
        let engine = Engine::new(&journal_path("overdue.wal"), chrono_tz::Tz::UTC, Arc::new(NotifyHub::new())).unwrap();
        let strict = place(&engine, true).await;
        let relaxed = place(&engine, false).await;

        let start = 10 * H;
        let overdue = confirmed(&engine, strict, start).await;
        let later = confirmed(&engine, strict, start + 2 * H).await;
        let unchecked = confirmed(&engine, relaxed, start).await;

        let now = start + 20 * MIN;
        assert_eq!(engine.collect_no_shows(now), vec![overdue]);
        assert_eq!(reap_no_shows(&engine, now).await, 1);

        let r = engine.get_reservation(overdue).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert_eq!(r.cancel_reason.as_deref(), Some("no-show"));
        assert_eq!(r.cancel_time, Some(now));
        assert_eq!(engine.get_reservation(later).await.unwrap().status, ReservationStatus::Confirmed);
        assert_eq!(engine.get_reservation(unchecked).await.unwrap().status, ReservationStatus::Confirmed);

        // A second sweep finds nothing.
        assert_eq!(reap_no_shows(&engine, now).await, 0);
    }

    #[tokio::test]
    async fn checked_in_reservations_are_kept() {
        let engine = Engine::new(&journal_path("checked_in.wal"), chrono_tz::Tz::UTC, Arc::new(NotifyHub::new())).unwrap();
        let strict = place(&engine, true).await;
        let start = 10 * H;
        let id = confirmed(&engine, strict, start).await;
        engine.check_in_at(id, start + 5 * MIN).await.unwrap();

        assert!(engine.collect_no_shows(start + H).is_empty());
        assert!(!engine.expire_no_show(id, start + H).await.unwrap());
    }
}
