use thiserror::Error;
use ulid::Ulid;

use crate::model::{BusyOrigin, EntityKind, OccurrenceConflict, ReservationStatus, Span};
use crate::recurrence::RuleError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("{child} cannot be placed under {parent}: expected a {expected} parent")]
    InvalidParent {
        child: EntityKind,
        parent: Ulid,
        expected: EntityKind,
    },
    #[error("data integrity violation at {node}: {detail}")]
    DataIntegrity { node: Ulid, detail: &'static str },
    #[error("invalid recurrence rule: {0}")]
    InvalidRecurrenceRule(#[from] RuleError),
    #[error("recurrence has no end and the window is unbounded")]
    ExpansionOverflow,
    #[error("query window has no end")]
    UnboundedQuery,
    #[error("invalid span: {0}")]
    InvalidSpan(&'static str),
    #[error("[{}, {}) conflicts with {origin}", span.start, span.end)]
    Conflict { origin: BusyOrigin, span: Span },
    #[error("{} occurrence(s) conflict", conflicts.len())]
    PartialConflict { conflicts: Vec<OccurrenceConflict> },
    #[error("reservation {id} is {status}; cannot {action}")]
    InvalidState {
        id: Ulid,
        status: ReservationStatus,
        action: &'static str,
    },
    #[error("place {0} does not accept reservations")]
    NotBookable(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("journal error: {0}")]
    Journal(String),
    #[error("request cancelled before commit")]
    Cancelled,
}
