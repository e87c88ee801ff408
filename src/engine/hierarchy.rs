use ulid::Ulid;

use crate::model::{EntityKind, EntityRef, Hierarchy};

use super::{Engine, EngineError, InMemoryStore};

fn integrity(node: Ulid, detail: &'static str) -> EngineError {
    tracing::warn!(%node, detail, "hierarchy integrity violation");
    EngineError::DataIntegrity { node, detail }
}

/// Ids from `entity` up to its building, deepest first. Each step is checked
/// against the fixed building → area → place shape.
pub(super) fn chain(store: &InMemoryStore, entity: EntityRef) -> Result<Vec<Ulid>, EngineError> {
    let id = entity.id();
    let mut link = store
        .link(&id)
        .filter(|l| l.kind == entity.kind())
        .ok_or(EngineError::NotFound(id))?;
    let mut current = id;
    let mut ids = vec![id];
    loop {
        match (link.kind.parent_kind(), link.parent) {
            (None, None) => return Ok(ids),
            (None, Some(_)) => return Err(integrity(current, "building has a parent")),
            (Some(_), None) => return Err(integrity(current, "missing parent reference")),
            (Some(expected), Some(parent)) => {
                let parent_link = store
                    .link(&parent)
                    .ok_or_else(|| integrity(parent, "parent node missing"))?;
                if parent_link.kind != expected {
                    return Err(integrity(parent, "parent has the wrong kind"));
                }
                ids.push(parent);
                current = parent;
                link = parent_link;
            }
        }
    }
}

/// Resolve a place to its area and building. No locks taken.
pub(super) fn resolve(store: &InMemoryStore, place_id: Ulid) -> Result<Hierarchy, EngineError> {
    match chain(store, EntityRef::Place(place_id))?.as_slice() {
        [place, area, building] => Ok(Hierarchy {
            place: *place,
            area: *area,
            building: *building,
        }),
        _ => Err(integrity(place_id, "place is not three levels deep")),
    }
}

/// The entity reference for a node id, whatever its kind.
pub(super) fn entity_of(store: &InMemoryStore, id: Ulid) -> Result<EntityRef, EngineError> {
    store
        .link(&id)
        .map(|l| EntityRef::new(l.kind, id))
        .ok_or(EngineError::NotFound(id))
}

impl Engine {
    pub fn resolve(&self, place_id: Ulid) -> Result<Hierarchy, EngineError> {
        resolve(&self.store, place_id)
    }

    pub fn entity(&self, id: Ulid) -> Result<EntityRef, EngineError> {
        entity_of(&self.store, id)
    }

    /// Kind of a node, if it exists.
    pub fn kind_of(&self, id: Ulid) -> Option<EntityKind> {
        self.store.link(&id).map(|l| l.kind)
    }

    pub fn children(&self, id: Ulid) -> Vec<Ulid> {
        self.store.children(&id)
    }
}
