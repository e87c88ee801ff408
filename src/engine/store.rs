use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedNode = Arc<RwLock<NodeState>>;

/// Kind and parent of a node. Fixed at creation, so readable without the node lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub kind: EntityKind,
    pub parent: Option<Ulid>,
}

/// Node table plus the lookup indexes derived from it.
pub struct InMemoryStore {
    nodes: DashMap<Ulid, SharedNode>,
    links: DashMap<Ulid, Link>,
    children: DashMap<Ulid, Vec<Ulid>>,
    /// Reservation id → place id.
    reservation_to_place: DashMap<Ulid, Ulid>,
    /// Recurring group id → (place id, reservation ids in occurrence order).
    groups: DashMap<Ulid, (Ulid, Vec<Ulid>)>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            links: DashMap::new(),
            children: DashMap::new(),
            reservation_to_place: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    // ── Nodes ────────────────────────────────────────────────

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &Ulid) -> Option<SharedNode> {
        self.nodes.get(id).map(|e| e.value().clone())
    }

    pub fn link(&self, id: &Ulid) -> Option<Link> {
        self.links.get(id).map(|e| *e.value())
    }

    pub fn node_ids(&self) -> Vec<Ulid> {
        self.nodes.iter().map(|e| *e.key()).collect()
    }

    pub fn insert_node(&self, node: NodeState) {
        let id = node.id;
        self.links.insert(
            id,
            Link {
                kind: node.kind,
                parent: node.parent_id,
            },
        );
        if let Some(parent) = node.parent_id {
            self.children.entry(parent).or_default().push(id);
        }
        self.nodes.insert(id, Arc::new(RwLock::new(node)));
    }

    /// Drop a node and every index entry pointing into it. The caller holds
    /// the node's write lock, so later lockers see it gone.
    pub fn remove_node(&self, node: &NodeState) {
        if let Some(place) = &node.place {
            for r in &place.reservations {
                self.reservation_to_place.remove(&r.id);
                if let Some(group) = r.recurring_group_id {
                    self.groups.remove(&group);
                }
            }
        }
        if let Some(parent) = node.parent_id
            && let Some(mut kids) = self.children.get_mut(&parent)
        {
            kids.retain(|c| c != &node.id);
        }
        self.children.remove(&node.id);
        self.links.remove(&node.id);
        self.nodes.remove(&node.id);
    }

    /// Write-lock a node, failing if it was removed while we waited.
    pub async fn write(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<NodeState>, EngineError> {
        let node = self.node(&id).ok_or(EngineError::NotFound(id))?;
        let guard = node.write_owned().await;
        if !self.contains(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    pub async fn read(&self, id: Ulid) -> Result<OwnedRwLockReadGuard<NodeState>, EngineError> {
        let node = self.node(&id).ok_or(EngineError::NotFound(id))?;
        let guard = node.read_owned().await;
        if !self.contains(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    // ── Hierarchy index ──────────────────────────────────────

    pub fn children(&self, parent_id: &Ulid) -> Vec<Ulid> {
        self.children
            .get(parent_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// The root and all descendants, deepest level first, by id within a level.
    pub fn subtree(&self, root: Ulid) -> Vec<Ulid> {
        let mut all = vec![root];
        let mut frontier = vec![root];
        while let Some(id) = frontier.pop() {
            let kids = self.children(&id);
            frontier.extend(kids.iter().copied());
            all.extend(kids);
        }
        all.sort_by_key(|id| {
            let depth = self.link(id).map_or(0, |l| l.kind.depth());
            (std::cmp::Reverse(depth), *id)
        });
        all.dedup();
        all
    }

    // ── Reservation index ────────────────────────────────────

    pub fn place_of_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_place.get(reservation_id).map(|e| *e.value())
    }

    pub fn group(&self, group_id: &Ulid) -> Option<(Ulid, Vec<Ulid>)> {
        self.groups.get(group_id).map(|e| e.value().clone())
    }

    // ── Event application ────────────────────────────────────

    /// Apply a node-local event to a node the caller has write-locked.
    /// Creation and deletion are handled by `insert_node` / `remove_node`.
    pub fn apply_event(&self, node: &mut NodeState, event: &Event) {
        match event {
            Event::PlaceSettingsUpdated { settings, .. } => {
                if let Some(place) = node.place.as_mut() {
                    place.settings = settings.clone();
                }
            }
            Event::NodeRenamed { name, .. } => {
                node.name = name.clone();
            }
            Event::BlockingsAdded { rules, .. } => {
                for rule in rules {
                    node.insert_blocking(rule.clone());
                }
            }
            Event::BlockingsReplaced { rules, .. } => {
                node.blockings.clear();
                for rule in rules {
                    node.insert_blocking(rule.clone());
                }
            }
            Event::BlockingsRemoved { ids, .. } => {
                for id in ids {
                    node.remove_blocking(*id);
                }
            }
            Event::ReservationAdmitted { reservation } => {
                if let Some(place) = node.place.as_mut() {
                    self.reservation_to_place.insert(reservation.id, node.id);
                    place.insert_reservation(reservation.clone());
                }
            }
            Event::SeriesAdmitted {
                group_id,
                reservations,
                ..
            } => {
                if let Some(place) = node.place.as_mut() {
                    for r in reservations {
                        self.reservation_to_place.insert(r.id, node.id);
                        place.insert_reservation(r.clone());
                    }
                    let ids = reservations.iter().map(|r| r.id).collect();
                    self.groups.insert(*group_id, (node.id, ids));
                }
            }
            Event::ReservationConfirmed { id, .. } => {
                if let Some(r) = node.place.as_mut().and_then(|p| p.reservation_mut(*id)) {
                    r.status = ReservationStatus::Confirmed;
                }
            }
            Event::ReservationCheckedIn { id, at, .. } => {
                if let Some(r) = node.place.as_mut().and_then(|p| p.reservation_mut(*id)) {
                    r.status = ReservationStatus::CheckedIn;
                    r.check_in_time = Some(*at);
                }
            }
            Event::ReservationsCancelled { ids, reason, at, .. } => {
                if let Some(place) = node.place.as_mut() {
                    for id in ids {
                        if let Some(r) = place.reservation_mut(*id) {
                            r.status = ReservationStatus::Cancelled;
                            r.cancel_reason = reason.clone();
                            r.cancel_time = Some(*at);
                        }
                    }
                }
            }
            Event::BuildingCreated { .. }
            | Event::AreaCreated { .. }
            | Event::PlaceCreated { .. }
            | Event::SubtreeDeleted { .. } => {}
        }
    }

    /// Apply any event during startup replay. Nothing else holds a lock yet,
    /// so `try_write` never waits.
    pub fn replay_event(&self, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::BuildingCreated { id, name } => {
                self.insert_node(NodeState::building(*id, name.clone()));
            }
            Event::AreaCreated { id, building_id, name } => {
                self.insert_node(NodeState::area(*id, *building_id, name.clone()));
            }
            Event::PlaceCreated {
                id,
                area_id,
                name,
                settings,
            } => {
                self.insert_node(NodeState::place(*id, *area_id, name.clone(), settings.clone()));
            }
            Event::SubtreeDeleted { ids, .. } => {
                for id in ids {
                    if let Some(node) = self.node(id) {
                        let guard = node.try_read().map_err(|_| EngineError::DataIntegrity {
                            node: *id,
                            detail: "node locked during replay",
                        })?;
                        self.remove_node(&guard);
                    }
                }
            }
            other => {
                let id = other.node_id();
                let node = self.node(&id).ok_or(EngineError::DataIntegrity {
                    node: id,
                    detail: "journal event for unknown node",
                })?;
                let mut guard = node.try_write().map_err(|_| EngineError::DataIntegrity {
                    node: id,
                    detail: "node locked during replay",
                })?;
                self.apply_event(&mut guard, other);
            }
        }
        Ok(())
    }
}

impl InMemoryStore {
    /// Minimal event list that rebuilds the current state: parents before
    /// children, each node followed by its blockings and reservations.
    /// Only called on a store nobody else is locking.
    pub fn snapshot_events(&self) -> Result<Vec<Event>, EngineError> {
        let mut ids = self.node_ids();
        ids.sort_by_key(|id| (self.link(id).map_or(0, |l| l.kind.depth()), *id));

        let mut events = Vec::new();
        for id in ids {
            let Some(node) = self.node(&id) else { continue };
            let guard = node.try_read().map_err(|_| EngineError::DataIntegrity {
                node: id,
                detail: "node locked during snapshot",
            })?;
            events.push(match (guard.kind, guard.parent_id, &guard.place) {
                (EntityKind::Building, _, _) => Event::BuildingCreated {
                    id,
                    name: guard.name.clone(),
                },
                (EntityKind::Area, Some(building_id), _) => Event::AreaCreated {
                    id,
                    building_id,
                    name: guard.name.clone(),
                },
                (EntityKind::Place, Some(area_id), Some(place)) => Event::PlaceCreated {
                    id,
                    area_id,
                    name: guard.name.clone(),
                    settings: place.settings.clone(),
                },
                _ => {
                    return Err(EngineError::DataIntegrity {
                        node: id,
                        detail: "node shape does not match its kind",
                    });
                }
            });
            if !guard.blockings.is_empty() {
                events.push(Event::BlockingsAdded {
                    entity: guard.entity(),
                    rules: guard.blockings.clone(),
                });
            }
            let Some(place) = &guard.place else { continue };

            let mut series: Vec<(Ulid, Vec<Reservation>)> = Vec::new();
            for r in &place.reservations {
                match r.recurring_group_id {
                    None => events.push(Event::ReservationAdmitted {
                        reservation: r.clone(),
                    }),
                    Some(group_id) => match series.iter_mut().find(|(g, _)| *g == group_id) {
                        Some((_, members)) => members.push(r.clone()),
                        None => series.push((group_id, vec![r.clone()])),
                    },
                }
            }
            for (group_id, reservations) in series {
                events.push(Event::SeriesAdmitted {
                    group_id,
                    place_id: id,
                    reservations,
                });
            }
        }
        Ok(events)
    }
}
