//! Availability and booking-conflict engine for building → area → place
//! hierarchies with recurring blockings, slot grids and recurring series.

pub mod calendar;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod recurrence;
pub mod wal;

pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineError};
pub use notify::{Notification, NotifyHub};
