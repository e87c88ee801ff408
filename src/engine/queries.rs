use std::time::Instant;

use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;
use crate::observability::AVAILABILITY_DURATION_SECONDS;

use super::availability::{clip_to, free_windows, merge};
use super::busy::place_busy;
use super::hierarchy::chain;
use super::slots::slots;
use super::{Engine, EngineError};

impl Engine {
    /// Read-lock `entity` and its ancestors, deepest first.
    async fn read_chain(&self, entity: EntityRef) -> Result<Vec<OwnedRwLockReadGuard<NodeState>>, EngineError> {
        let ids = chain(&self.store, entity)?;
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.store.read(id).await?);
        }
        Ok(guards)
    }

    async fn read_place(&self, place_id: Ulid) -> Result<OwnedRwLockReadGuard<NodeState>, EngineError> {
        if self.kind_of(place_id) != Some(EntityKind::Place) {
            return Err(EngineError::NotFound(place_id));
        }
        self.store.read(place_id).await
    }

    /// Free windows, attributed busy blocks and (for places with a slot grid)
    /// bookable slots of any node within a bounded window.
    ///
    /// Blockings of every ancestor apply. Areas and buildings have no
    /// reservations of their own, so their busy set is blocking-derived.
    pub async fn get_availability(&self, entity: EntityRef, window: Window) -> Result<Availability, EngineError> {
        let started = Instant::now();
        let end = window.end.ok_or(EngineError::UnboundedQuery)?;
        if window.start >= end {
            return Err(EngineError::InvalidSpan("window start must be before end"));
        }
        if end - window.start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let bounds = Span {
            start: window.start,
            end,
        };

        let guards = self.read_chain(entity).await?;
        let nodes: Vec<&NodeState> = guards.iter().map(|g| &**g).collect();
        let busy = merge(&clip_to(&bounds, place_busy(&nodes, self.tz, bounds)?));

        let (bookable, free, grid) = match nodes.first().and_then(|n| n.place.as_ref()) {
            Some(place) if !place.settings.accepts_bookings() => {
                (false, Vec::new(), place.settings.slots.as_ref().map(|_| Vec::new()))
            }
            Some(place) => {
                let free = free_windows(bounds, &busy);
                let grid = match &place.settings.slots {
                    Some(config) => Some(slots(&free, config, window, self.tz)?.collect()),
                    None => None,
                };
                (true, free, grid)
            }
            None => (true, free_windows(bounds, &busy), None),
        };
        drop(nodes);
        drop(guards);

        metrics::histogram!(AVAILABILITY_DURATION_SECONDS, "entity" => entity.kind().to_string())
            .record(started.elapsed().as_secs_f64());
        Ok(Availability {
            entity,
            window: bounds,
            bookable,
            busy,
            free,
            slots: grid,
        })
    }

    /// Blocking rules of a node, optionally followed by those it inherits
    /// from its ancestors (nearest first).
    pub async fn get_blocking(&self, entity: EntityRef, include_inherited: bool) -> Result<Vec<BlockingView>, EngineError> {
        let guards = self.read_chain(entity).await?;
        let mut views = Vec::new();
        for (depth, guard) in guards.iter().enumerate() {
            if depth > 0 && !include_inherited {
                break;
            }
            let source = if depth == 0 {
                BlockingSource::Own
            } else {
                BlockingSource::Inherited
            };
            views.extend(guard.blockings.iter().map(|rule| BlockingView {
                rule: rule.clone(),
                source,
            }));
        }
        Ok(views)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let place_id = self.store.place_of_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let guard = self.store.read(place_id).await?;
        guard
            .place
            .as_ref()
            .and_then(|p| p.reservation(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Reservations of a place in start order, any status. With `span`, only
    /// those overlapping it.
    pub async fn list_reservations(&self, place_id: Ulid, span: Option<Span>) -> Result<Vec<Reservation>, EngineError> {
        let guard = self.read_place(place_id).await?;
        let Some(place) = &guard.place else {
            return Err(EngineError::DataIntegrity {
                node: place_id,
                detail: "place node without booking state",
            });
        };
        Ok(match span {
            Some(span) => place.overlapping(&span).cloned().collect(),
            None => place.reservations.clone(),
        })
    }

    /// Members of a recurring series in occurrence order.
    pub async fn series(&self, group_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let (place_id, members) = self.store.group(&group_id).ok_or(EngineError::NotFound(group_id))?;
        let guard = self.store.read(place_id).await?;
        let place = guard.place.as_ref().ok_or(EngineError::NotFound(group_id))?;
        members
            .iter()
            .map(|id| place.reservation(*id).cloned().ok_or(EngineError::NotFound(*id)))
            .collect()
    }

    pub async fn place_settings(&self, place_id: Ulid) -> Result<PlaceSettings, EngineError> {
        let guard = self.read_place(place_id).await?;
        guard
            .place
            .as_ref()
            .map(|p| p.settings.clone())
            .ok_or(EngineError::NotFound(place_id))
    }
}
