use std::fmt;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The part of `self` inside `window`, if any.
    pub fn intersection(&self, window: &Span) -> Option<Span> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then_some(Span { start, end })
    }
}

/// Query range whose end may be missing. Only bounded windows can be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Ms,
    pub end: Option<Ms>,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end: Some(end) }
    }

    pub fn open_ended(start: Ms) -> Self {
        Self { start, end: None }
    }
}

impl From<Span> for Window {
    fn from(span: Span) -> Self {
        Self::new(span.start, span.end)
    }
}

// ── Location hierarchy ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Building,
    Area,
    Place,
}

impl EntityKind {
    /// Distance from the root of the hierarchy.
    pub fn depth(self) -> usize {
        match self {
            EntityKind::Building => 0,
            EntityKind::Area => 1,
            EntityKind::Place => 2,
        }
    }

    pub fn parent_kind(self) -> Option<EntityKind> {
        match self {
            EntityKind::Building => None,
            EntityKind::Area => Some(EntityKind::Building),
            EntityKind::Place => Some(EntityKind::Area),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Building => "building",
            EntityKind::Area => "area",
            EntityKind::Place => "place",
        })
    }
}

/// Reference to one node of the hierarchy. Blocking rules attach through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Building(Ulid),
    Area(Ulid),
    Place(Ulid),
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: Ulid) -> Self {
        match kind {
            EntityKind::Building => EntityRef::Building(id),
            EntityKind::Area => EntityRef::Area(id),
            EntityKind::Place => EntityRef::Place(id),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Building(_) => EntityKind::Building,
            EntityRef::Area(_) => EntityKind::Area,
            EntityRef::Place(_) => EntityKind::Place,
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            EntityRef::Building(id) | EntityRef::Area(id) | EntityRef::Place(id) => *id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

// ── Blocking rules ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockingKind {
    ClosedHours,
    Weekend,
    Holiday,
    Maintenance,
    Event,
    Disabled,
    Custom,
}

/// A persisted declaration that a node is unavailable, once or on a cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingRule {
    pub id: Ulid,
    pub entity: EntityRef,
    pub kind: BlockingKind,
    pub name: Option<String>,
    pub reason: Option<String>,
    /// The one-off interval, or the first occurrence of a recurring rule.
    pub span: Span,
    pub is_recurring: bool,
    /// RRULE text, e.g. `FREQ=WEEKLY;BYDAY=SA,SU`.
    pub recurrence_rule: Option<String>,
    /// Length of each occurrence. Takes precedence over `span` when set.
    pub recurrence_duration: Option<Ms>,
    /// No occurrence starts at or after this instant.
    pub recurrence_end: Option<Ms>,
}

impl BlockingRule {
    pub fn occurrence_duration(&self) -> Ms {
        self.recurrence_duration.unwrap_or_else(|| self.span.duration_ms())
    }
}

/// A blocking rule as submitted, before it has an id and an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlocking {
    pub kind: BlockingKind,
    pub name: Option<String>,
    pub reason: Option<String>,
    pub span: Span,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
    pub recurrence_duration: Option<Ms>,
    pub recurrence_end: Option<Ms>,
}

impl NewBlocking {
    pub fn once(kind: BlockingKind, span: Span) -> Self {
        Self {
            kind,
            name: None,
            reason: None,
            span,
            is_recurring: false,
            recurrence_rule: None,
            recurrence_duration: None,
            recurrence_end: None,
        }
    }

    pub fn recurring(kind: BlockingKind, first: Span, rule: impl Into<String>) -> Self {
        Self {
            is_recurring: true,
            recurrence_rule: Some(rule.into()),
            ..Self::once(kind, first)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_end(mut self, recurrence_end: Ms) -> Self {
        self.recurrence_end = Some(recurrence_end);
        self
    }

    pub fn into_rule(self, id: Ulid, entity: EntityRef) -> BlockingRule {
        BlockingRule {
            id,
            entity,
            kind: self.kind,
            name: self.name,
            reason: self.reason,
            span: self.span,
            is_recurring: self.is_recurring,
            recurrence_rule: self.recurrence_rule,
            recurrence_duration: self.recurrence_duration,
            recurrence_end: self.recurrence_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingSource {
    Own,
    Inherited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingView {
    pub rule: BlockingRule,
    pub source: BlockingSource,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    CheckedIn,
    Cancelled,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::CheckedIn | ReservationStatus::Cancelled)
    }

    /// Whether a reservation in this status occupies its span.
    pub fn holds_time(self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::CheckedIn => "checked-in",
            ReservationStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub place_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub check_in_time: Option<Ms>,
    pub cancel_reason: Option<String>,
    pub cancel_time: Option<Ms>,
    pub is_recurring: bool,
    pub recurring_group_id: Option<Ulid>,
    pub created_at: Ms,
}

/// A single reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub place_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
}

/// How a reservation repeats. `count`/`until` bound the series when the rule
/// itself carries no COUNT or UNTIL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecurrenceRequest {
    pub rule: String,
    pub count: Option<u32>,
    pub until: Option<Ms>,
    /// Occurrence indices the caller chose to leave out after a partial conflict.
    pub skip: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReservation {
    pub place_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub recurrence: Option<RecurrenceRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Booked {
    Single(Reservation),
    Series { group_id: Ulid, reservations: Vec<Reservation> },
}

// ── Place configuration ──────────────────────────────────────────

/// Booking grid of a place. Times of day are local wall-clock times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlotConfig {
    pub interval_minutes: u32,
    pub earliest_start: Option<NaiveTime>,
    pub latest_end: Option<NaiveTime>,
}

impl TimeSlotConfig {
    pub fn every(interval_minutes: u32) -> Self {
        Self {
            interval_minutes,
            earliest_start: None,
            latest_end: None,
        }
    }

    pub fn between(interval_minutes: u32, earliest_start: NaiveTime, latest_end: NaiveTime) -> Self {
        Self {
            interval_minutes,
            earliest_start: Some(earliest_start),
            latest_end: Some(latest_end),
        }
    }

    pub fn interval_ms(&self) -> Ms {
        Ms::from(self.interval_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInPolicy {
    pub required: bool,
    /// How long before the start check-in opens.
    pub earliest_offset: Ms,
    /// How long after the start check-in stays open.
    pub timeout: Ms,
}

impl CheckInPolicy {
    /// Check-in window `[start - earliest_offset, start + timeout]`, clamped to
    /// the representable range.
    pub fn window(&self, start: Ms) -> (Ms, Ms) {
        (start.saturating_sub(self.earliest_offset), self.closes(start))
    }

    pub fn closes(&self, start: Ms) -> Ms {
        start.saturating_add(self.timeout)
    }
}

impl Default for CheckInPolicy {
    fn default() -> Self {
        Self {
            required: false,
            earliest_offset: 15 * MINUTE_MS,
            timeout: 15 * MINUTE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceSettings {
    pub is_bookable: bool,
    pub is_disabled: bool,
    pub slots: Option<TimeSlotConfig>,
    pub check_in: CheckInPolicy,
}

impl Default for PlaceSettings {
    fn default() -> Self {
        Self {
            is_bookable: true,
            is_disabled: false,
            slots: None,
            check_in: CheckInPolicy::default(),
        }
    }
}

impl PlaceSettings {
    pub fn accepts_bookings(&self) -> bool {
        self.is_bookable && !self.is_disabled
    }
}

// ── Node state ───────────────────────────────────────────────────

/// Reservation book of a place, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct PlaceState {
    pub settings: PlaceSettings,
    pub reservations: Vec<Reservation>,
}

impl PlaceState {
    pub fn new(settings: PlaceSettings) -> Self {
        Self {
            settings,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Reservations that still hold time at or after `now`. Cancelled and
    /// finished entries are history and do not count against capacity.
    pub fn upcoming_count(&self, now: Ms) -> usize {
        self.reservations
            .iter()
            .filter(|r| r.status.holds_time() && r.span.end > now)
            .count()
    }

    /// Overlapping reservations that still occupy time.
    pub fn occupying(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.status.holds_time())
    }
}

/// In-memory state of one building, area, or place.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: Ulid,
    pub kind: EntityKind,
    pub parent_id: Option<Ulid>,
    pub name: Option<String>,
    /// Sorted by `span.start`.
    pub blockings: Vec<BlockingRule>,
    /// Present exactly when `kind` is `Place`.
    pub place: Option<PlaceState>,
}

impl NodeState {
    pub fn building(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            kind: EntityKind::Building,
            parent_id: None,
            name,
            blockings: Vec::new(),
            place: None,
        }
    }

    pub fn area(id: Ulid, building_id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            kind: EntityKind::Area,
            parent_id: Some(building_id),
            name,
            blockings: Vec::new(),
            place: None,
        }
    }

    pub fn place(id: Ulid, area_id: Ulid, name: Option<String>, settings: PlaceSettings) -> Self {
        Self {
            id,
            kind: EntityKind::Place,
            parent_id: Some(area_id),
            name,
            blockings: Vec::new(),
            place: Some(PlaceState::new(settings)),
        }
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id)
    }

    pub fn insert_blocking(&mut self, rule: BlockingRule) {
        let pos = self
            .blockings
            .partition_point(|b| b.span.start <= rule.span.start);
        self.blockings.insert(pos, rule);
    }

    pub fn remove_blocking(&mut self, id: Ulid) -> Option<BlockingRule> {
        let pos = self.blockings.iter().position(|b| b.id == id)?;
        Some(self.blockings.remove(pos))
    }
}

// ── Busy set ─────────────────────────────────────────────────────

/// Why a stretch of time is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BusyOrigin {
    Blocking(Ulid),
    Reservation(Ulid),
    /// Another occurrence of the series being admitted.
    Occurrence(u32),
}

impl fmt::Display for BusyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusyOrigin::Blocking(id) => write!(f, "blocking {id}"),
            BusyOrigin::Reservation(id) => write!(f, "reservation {id}"),
            BusyOrigin::Occurrence(i) => write!(f, "occurrence {i} of the same series"),
        }
    }
}

/// A derived, never persisted busy span with its origin and hierarchy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyInterval {
    pub span: Span,
    pub origin: BusyOrigin,
    pub level: EntityKind,
}

/// Disjoint busy span after merging, with every origin that contributed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyBlock {
    pub span: Span,
    pub sources: Vec<(BusyOrigin, EntityKind)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceConflict {
    /// Zero-based position of the occurrence in the expanded series.
    pub index: u32,
    pub span: Span,
    pub origin: BusyOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub entity: EntityRef,
    pub window: Span,
    /// False for disabled or non-bookable places.
    pub bookable: bool,
    pub busy: Vec<BusyBlock>,
    pub free: Vec<Span>,
    /// Bookable slots, for places with a slot grid.
    pub slots: Option<Vec<Span>>,
}

/// Ids of a place and its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hierarchy {
    pub place: Ulid,
    pub area: Ulid,
    pub building: Ulid,
}

// ── Journal records ──────────────────────────────────────────────

/// Journal record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BuildingCreated {
        id: Ulid,
        name: Option<String>,
    },
    AreaCreated {
        id: Ulid,
        building_id: Ulid,
        name: Option<String>,
    },
    PlaceCreated {
        id: Ulid,
        area_id: Ulid,
        name: Option<String>,
        settings: PlaceSettings,
    },
    PlaceSettingsUpdated {
        id: Ulid,
        settings: PlaceSettings,
    },
    NodeRenamed {
        id: Ulid,
        name: Option<String>,
    },
    /// `ids` lists the root and every descendant, deepest first.
    SubtreeDeleted {
        root: Ulid,
        ids: Vec<Ulid>,
    },
    BlockingsAdded {
        entity: EntityRef,
        rules: Vec<BlockingRule>,
    },
    BlockingsReplaced {
        entity: EntityRef,
        rules: Vec<BlockingRule>,
    },
    BlockingsRemoved {
        entity: EntityRef,
        ids: Vec<Ulid>,
    },
    ReservationAdmitted {
        reservation: Reservation,
    },
    SeriesAdmitted {
        group_id: Ulid,
        place_id: Ulid,
        reservations: Vec<Reservation>,
    },
    ReservationConfirmed {
        id: Ulid,
        place_id: Ulid,
    },
    ReservationCheckedIn {
        id: Ulid,
        place_id: Ulid,
        at: Ms,
    },
    ReservationsCancelled {
        place_id: Ulid,
        ids: Vec<Ulid>,
        reason: Option<String>,
        at: Ms,
    },
}

impl Event {
    /// The node whose state the event changes.
    pub fn node_id(&self) -> Ulid {
        match self {
            Event::BuildingCreated { id, .. }
            | Event::AreaCreated { id, .. }
            | Event::PlaceCreated { id, .. }
            | Event::PlaceSettingsUpdated { id, .. }
            | Event::NodeRenamed { id, .. } => *id,
            Event::SubtreeDeleted { root, .. } => *root,
            Event::BlockingsAdded { entity, .. }
            | Event::BlockingsReplaced { entity, .. }
            | Event::BlockingsRemoved { entity, .. } => entity.id(),
            Event::ReservationAdmitted { reservation } => reservation.place_id,
            Event::SeriesAdmitted { place_id, .. }
            | Event::ReservationConfirmed { place_id, .. }
            | Event::ReservationCheckedIn { place_id, .. }
            | Event::ReservationsCancelled { place_id, .. } => *place_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Event::BuildingCreated { .. } => "building_created",
            Event::AreaCreated { .. } => "area_created",
            Event::PlaceCreated { .. } => "place_created",
            Event::PlaceSettingsUpdated { .. } => "place_settings_updated",
            Event::NodeRenamed { .. } => "node_renamed",
            Event::SubtreeDeleted { .. } => "subtree_deleted",
            Event::BlockingsAdded { .. } => "blockings_added",
            Event::BlockingsReplaced { .. } => "blockings_replaced",
            Event::BlockingsRemoved { .. } => "blockings_removed",
            Event::ReservationAdmitted { .. } => "reservation_admitted",
            Event::SeriesAdmitted { .. } => "series_admitted",
            Event::ReservationConfirmed { .. } => "reservation_confirmed",
            Event::ReservationCheckedIn { .. } => "reservation_checked_in",
            Event::ReservationsCancelled { .. } => "reservations_cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            place_id: Ulid::new(),
            user_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            check_in_time: None,
            cancel_reason: None,
            cancel_time: None,
            is_recurring: false,
            recurring_group_id: None,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_intersection() {
        let window = Span::new(100, 200);
        assert_eq!(Span::new(50, 150).intersection(&window), Some(Span::new(100, 150)));
        assert_eq!(Span::new(120, 130).intersection(&window), Some(Span::new(120, 130)));
        assert_eq!(Span::new(200, 300).intersection(&window), None);
        assert!(Span::new(0, 1000).contains_span(&window));
    }

    #[test]
    fn reservations_stay_sorted() {
        let mut place = PlaceState::default();
        place.insert_reservation(reservation(300, 400, ReservationStatus::Pending));
        place.insert_reservation(reservation(100, 200, ReservationStatus::Pending));
        place.insert_reservation(reservation(200, 300, ReservationStatus::Confirmed));
        let starts: Vec<Ms> = place.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut place = PlaceState::default();
        place.insert_reservation(reservation(100, 200, ReservationStatus::Pending));
        place.insert_reservation(reservation(450, 600, ReservationStatus::Pending));
        place.insert_reservation(reservation(1000, 1100, ReservationStatus::Pending));

        let hits: Vec<_> = place.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut place = PlaceState::default();
        place.insert_reservation(reservation(100, 200, ReservationStatus::Pending));
        assert_eq!(place.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn cancelled_reservations_do_not_occupy() {
        let mut place = PlaceState::default();
        place.insert_reservation(reservation(100, 200, ReservationStatus::Cancelled));
        place.insert_reservation(reservation(150, 250, ReservationStatus::CheckedIn));
        let query = Span::new(0, 1000);
        assert_eq!(place.overlapping(&query).count(), 2);
        let occupying: Vec<_> = place.occupying(&query).collect();
        assert_eq!(occupying.len(), 1);
        assert_eq!(occupying[0].status, ReservationStatus::CheckedIn);
    }

    #[test]
    fn check_in_window_saturates() {
        let policy = CheckInPolicy {
            required: true,
            earliest_offset: i64::MAX,
            timeout: i64::MAX,
        };
        assert_eq!(policy.window(1_000), (i64::MIN + 1_001, i64::MAX));
        assert_eq!(CheckInPolicy::default().window(0), (-15 * MINUTE_MS, 15 * MINUTE_MS));
    }

    #[test]
    fn history_does_not_count_as_upcoming() {
        let mut place = PlaceState::default();
        place.insert_reservation(reservation(100, 200, ReservationStatus::CheckedIn));
        place.insert_reservation(reservation(300, 400, ReservationStatus::Cancelled));
        place.insert_reservation(reservation(300, 400, ReservationStatus::Confirmed));
        place.insert_reservation(reservation(500, 600, ReservationStatus::Pending));
        place.insert_reservation(reservation(700, 800, ReservationStatus::Cancelled));
        assert_eq!(place.upcoming_count(0), 3);
        assert_eq!(place.upcoming_count(250), 2);
        assert_eq!(place.upcoming_count(550), 1);
        assert_eq!(place.upcoming_count(800), 0);
    }

    #[test]
    fn status_terminality() {
        assert!(!ReservationStatus::Pending.is_terminal());
        assert!(!ReservationStatus::Confirmed.is_terminal());
        assert!(ReservationStatus::CheckedIn.is_terminal());
        assert!(ReservationStatus::Cancelled.is_terminal());
        assert!(ReservationStatus::CheckedIn.holds_time());
        assert!(!ReservationStatus::Cancelled.holds_time());
    }

    #[test]
    fn entity_ref_dispatch() {
        let id = Ulid::new();
        let e = EntityRef::new(EntityKind::Area, id);
        assert_eq!(e, EntityRef::Area(id));
        assert_eq!(e.kind(), EntityKind::Area);
        assert_eq!(e.id(), id);
        assert_eq!(EntityKind::Place.parent_kind(), Some(EntityKind::Area));
        assert_eq!(EntityKind::Building.parent_kind(), None);
    }

    #[test]
    fn blocking_duration_prefers_explicit() {
        let mut rule = NewBlocking::recurring(
            BlockingKind::ClosedHours,
            Span::new(0, 3_600_000),
            "FREQ=DAILY",
        )
        .into_rule(Ulid::new(), EntityRef::Building(Ulid::new()));
        assert_eq!(rule.occurrence_duration(), 3_600_000);
        rule.recurrence_duration = Some(1_800_000);
        assert_eq!(rule.occurrence_duration(), 1_800_000);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::PlaceCreated {
            id: Ulid::new(),
            area_id: Ulid::new(),
            name: Some("Desk 4".into()),
            settings: PlaceSettings {
                slots: Some(TimeSlotConfig::between(
                    30,
                    NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                )),
                ..PlaceSettings::default()
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
