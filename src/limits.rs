use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 1970-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single reservation or blocking occurrence.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Widest availability query.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
/// Widest horizon a recurring reservation may cover.
pub const MAX_SERIES_HORIZON_MS: Ms = 2 * 366 * DAY_MS;

pub const MAX_SERIES_OCCURRENCES: usize = 500;
pub const MAX_BLOCKINGS_PER_NODE: usize = 1_000;
pub const MAX_RESERVATIONS_PER_PLACE: usize = 100_000;
pub const MAX_NODES: usize = 100_000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 4_096;
pub const MAX_RULE_LEN: usize = 512;

/// Largest COUNT a recurrence rule may carry.
pub const MAX_RULE_COUNT: u32 = 10_000;
pub const MAX_RULE_INTERVAL: u32 = 1_000;
