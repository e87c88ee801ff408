use std::collections::HashSet;

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::recurrence::parse_blocking_rule;

use super::admission::validate_span;
use super::{Engine, EngineError};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

pub(super) fn validate_settings(settings: &PlaceSettings) -> Result<(), EngineError> {
    if let Some(slots) = &settings.slots {
        if slots.interval_minutes == 0 {
            return Err(EngineError::InvalidSpan("slot interval must be positive"));
        }
        if slots.interval_minutes > 24 * 60 {
            return Err(EngineError::LimitExceeded("slot interval longer than a day"));
        }
        if let (Some(open), Some(close)) = (slots.earliest_start, slots.latest_end)
            && open >= close
        {
            return Err(EngineError::InvalidSpan("earliest start must be before latest end"));
        }
    }
    let check_in = &settings.check_in;
    if check_in.earliest_offset < 0 || check_in.timeout < 0 {
        return Err(EngineError::InvalidSpan("check-in offsets must not be negative"));
    }
    if check_in.earliest_offset > MAX_SPAN_DURATION_MS || check_in.timeout > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("check-in offset too long"));
    }
    Ok(())
}

/// Validate a blocking entry as it will be stored.
pub(super) fn validate_blocking(rule: &BlockingRule) -> Result<(), EngineError> {
    validate_span(&rule.span)?;
    check_name(&rule.name)?;
    if rule.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("blocking reason too long"));
    }
    if let Some(duration) = rule.recurrence_duration {
        if duration <= 0 {
            return Err(EngineError::InvalidSpan("occurrence duration must be positive"));
        }
        if duration > MAX_SPAN_DURATION_MS {
            return Err(EngineError::LimitExceeded("occurrence duration too long"));
        }
    }
    if let Some(end) = rule.recurrence_end
        && end <= rule.span.start
    {
        return Err(EngineError::InvalidSpan("recurrence end must be after the first occurrence"));
    }
    parse_blocking_rule(rule)?;
    Ok(())
}

impl Engine {
    // ── Location nodes ───────────────────────────────────────

    fn check_new_node(&self, id: Ulid, name: &Option<String>) -> Result<(), EngineError> {
        check_name(name)?;
        if self.store.node_count() >= MAX_NODES {
            return Err(EngineError::LimitExceeded("too many location nodes"));
        }
        if self.store.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(())
    }

    /// Read-lock the parent of a new node, checking it has the expected kind.
    async fn lock_parent(
        &self,
        child: EntityKind,
        parent: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<NodeState>, EngineError> {
        let link = self.store.link(&parent).ok_or(EngineError::NotFound(parent))?;
        if Some(link.kind) != child.parent_kind() {
            return Err(EngineError::InvalidParent {
                child,
                parent,
                expected: child.parent_kind().unwrap_or(EntityKind::Building),
            });
        }
        self.store.read(parent).await
    }

    pub async fn create_building(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        let creation = self.creation.clone().lock_owned().await;
        self.check_new_node(id, &name)?;
        let event = Event::BuildingCreated { id, name: name.clone() };
        self.committer
            .insert(NodeState::building(id, name), event, creation)
            .await?;
        info!(%id, "building created");
        Ok(())
    }

    pub async fn create_area(&self, id: Ulid, building_id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        let creation = self.creation.clone().lock_owned().await;
        self.check_new_node(id, &name)?;
        let parent = self.lock_parent(EntityKind::Area, building_id).await?;
        let event = Event::AreaCreated {
            id,
            building_id,
            name: name.clone(),
        };
        self.committer
            .insert(NodeState::area(id, building_id, name), event, (parent, creation))
            .await?;
        info!(%id, building = %building_id, "area created");
        Ok(())
    }

    pub async fn create_place(
        &self,
        id: Ulid,
        area_id: Ulid,
        name: Option<String>,
        settings: PlaceSettings,
    ) -> Result<(), EngineError> {
        validate_settings(&settings)?;
        let creation = self.creation.clone().lock_owned().await;
        self.check_new_node(id, &name)?;
        let parent = self.lock_parent(EntityKind::Place, area_id).await?;
        let event = Event::PlaceCreated {
            id,
            area_id,
            name: name.clone(),
            settings: settings.clone(),
        };
        self.committer
            .insert(NodeState::place(id, area_id, name, settings), event, (parent, creation))
            .await?;
        info!(%id, area = %area_id, "place created");
        Ok(())
    }

    /// Replace a place's settings. Existing reservations are kept as they are.
    pub async fn update_place_settings(&self, id: Ulid, settings: PlaceSettings) -> Result<(), EngineError> {
        validate_settings(&settings)?;
        if self.kind_of(id) != Some(EntityKind::Place) {
            return Err(EngineError::NotFound(id));
        }
        let guard = self.store.write(id).await?;
        let event = Event::PlaceSettingsUpdated { id, settings };
        self.committer.apply(guard, event, ()).await?;
        debug!(%id, "place settings updated");
        Ok(())
    }

    pub async fn rename_node(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        check_name(&name)?;
        let guard = self.store.write(id).await?;
        self.committer.apply(guard, Event::NodeRenamed { id, name }, ()).await
    }

    /// Delete a node with all its descendants, their blockings and
    /// reservations. Returns the removed ids, deepest first.
    pub async fn delete_node(&self, id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        'retry: loop {
            if !self.store.contains(&id) {
                return Err(EngineError::NotFound(id));
            }
            let ids = self.store.subtree(id);
            let mut guards: Vec<OwnedRwLockWriteGuard<NodeState>> = Vec::with_capacity(ids.len());
            for node_id in &ids {
                match self.store.write(*node_id).await {
                    Ok(guard) => guards.push(guard),
                    // A descendant deleted concurrently; take a fresh look.
                    Err(EngineError::NotFound(_)) if *node_id != id => continue 'retry,
                    Err(e) => return Err(e),
                }
            }
            // A child may have been created before its parent lock was taken.
            if self.store.subtree(id) != ids {
                drop(guards);
                continue;
            }
            let event = Event::SubtreeDeleted {
                root: id,
                ids: ids.clone(),
            };
            self.committer.remove(guards, event).await?;
            info!(%id, removed = ids.len(), "subtree deleted");
            return Ok(ids);
        }
    }

    // ── Blocking rules ───────────────────────────────────────

    /// Write-lock the node an entity reference points at.
    async fn lock_entity(&self, entity: EntityRef) -> Result<OwnedRwLockWriteGuard<NodeState>, EngineError> {
        let id = entity.id();
        match self.kind_of(id) {
            Some(kind) if kind == entity.kind() => self.store.write(id).await,
            _ => Err(EngineError::NotFound(id)),
        }
    }

    fn build_rules(entity: EntityRef, entries: Vec<NewBlocking>) -> Result<Vec<BlockingRule>, EngineError> {
        let rules: Vec<BlockingRule> = entries
            .into_iter()
            .map(|entry| entry.into_rule(Ulid::new(), entity))
            .collect();
        for rule in &rules {
            validate_blocking(rule)?;
        }
        Ok(rules)
    }

    /// Replace every blocking rule of a node with `entries`.
    pub async fn replace_blocking(
        &self,
        entity: EntityRef,
        entries: Vec<NewBlocking>,
    ) -> Result<Vec<BlockingRule>, EngineError> {
        if entries.len() > MAX_BLOCKINGS_PER_NODE {
            return Err(EngineError::LimitExceeded("too many blockings on node"));
        }
        let rules = Self::build_rules(entity, entries)?;
        let guard = self.lock_entity(entity).await?;
        let event = Event::BlockingsReplaced {
            entity,
            rules: rules.clone(),
        };
        self.committer.apply(guard, event, ()).await?;
        debug!(%entity, count = rules.len(), "blockings replaced");
        Ok(rules)
    }

    /// Append blocking rules to a node, keeping the existing ones.
    pub async fn add_blocking(
        &self,
        entity: EntityRef,
        entries: Vec<NewBlocking>,
    ) -> Result<Vec<BlockingRule>, EngineError> {
        let rules = Self::build_rules(entity, entries)?;
        let guard = self.lock_entity(entity).await?;
        if rules.is_empty() {
            return Ok(rules);
        }
        if guard.blockings.len() + rules.len() > MAX_BLOCKINGS_PER_NODE {
            return Err(EngineError::LimitExceeded("too many blockings on node"));
        }
        let event = Event::BlockingsAdded {
            entity,
            rules: rules.clone(),
        };
        self.committer.apply(guard, event, ()).await?;
        debug!(%entity, count = rules.len(), "blockings added");
        Ok(rules)
    }

    /// Remove the given blocking rules, or all of them when `ids` is `None`.
    /// Returns the removed ids.
    pub async fn remove_blocking(&self, entity: EntityRef, ids: Option<Vec<Ulid>>) -> Result<Vec<Ulid>, EngineError> {
        let guard = self.lock_entity(entity).await?;
        let ids = match ids {
            None => guard.blockings.iter().map(|b| b.id).collect(),
            Some(ids) => {
                let existing: HashSet<Ulid> = guard.blockings.iter().map(|b| b.id).collect();
                if let Some(missing) = ids.iter().find(|id| !existing.contains(id)) {
                    return Err(EngineError::NotFound(*missing));
                }
                let mut ids = ids;
                ids.sort();
                ids.dedup();
                ids
            }
        };
        if ids.is_empty() {
            return Ok(ids);
        }
        let event = Event::BlockingsRemoved {
            entity,
            ids: ids.clone(),
        };
        self.committer.apply(guard, event, ()).await?;
        debug!(%entity, count = ids.len(), "blockings removed");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn settings_validation() {
        assert!(validate_settings(&PlaceSettings::default()).is_ok());
        let mut settings = PlaceSettings {
            slots: Some(TimeSlotConfig::every(0)),
            ..PlaceSettings::default()
        };
        assert!(matches!(validate_settings(&settings), Err(EngineError::InvalidSpan(_))));

        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        settings.slots = Some(TimeSlotConfig::between(30, nine, nine));
        assert!(matches!(validate_settings(&settings), Err(EngineError::InvalidSpan(_))));
    }

    #[test]
    fn check_in_offsets_are_bounded() {
        let mut settings = PlaceSettings::default();
        settings.check_in.timeout = MAX_SPAN_DURATION_MS;
        settings.check_in.earliest_offset = MAX_SPAN_DURATION_MS;
        assert!(validate_settings(&settings).is_ok());

        settings.check_in.timeout = i64::MAX;
        assert!(matches!(validate_settings(&settings), Err(EngineError::LimitExceeded(_))));

        settings.check_in.timeout = 0;
        settings.check_in.earliest_offset = i64::MAX;
        assert!(matches!(validate_settings(&settings), Err(EngineError::LimitExceeded(_))));

        settings.check_in.earliest_offset = -1;
        assert!(matches!(validate_settings(&settings), Err(EngineError::InvalidSpan(_))));
    }

    #[test]
    fn blocking_validation() {
        let entity = EntityRef::Area(Ulid::new());
        let ok = NewBlocking::recurring(BlockingKind::Weekend, Span::new(0, 1_000), "FREQ=WEEKLY;BYDAY=SA,SU")
            .into_rule(Ulid::new(), entity);
        assert!(validate_blocking(&ok).is_ok());

        let mut missing_rule = ok.clone();
        missing_rule.recurrence_rule = None;
        assert!(matches!(
            validate_blocking(&missing_rule),
            Err(EngineError::InvalidRecurrenceRule(_))
        ));

        let mut rule_on_one_off = ok.clone();
        rule_on_one_off.is_recurring = false;
        assert!(matches!(
            validate_blocking(&rule_on_one_off),
            Err(EngineError::InvalidRecurrenceRule(_))
        ));

        let ended_early = NewBlocking::recurring(BlockingKind::Holiday, Span::new(5_000, 6_000), "FREQ=DAILY")
            .with_end(5_000)
            .into_rule(Ulid::new(), entity);
        assert!(matches!(validate_blocking(&ended_early), Err(EngineError::InvalidSpan(_))));
    }
}
