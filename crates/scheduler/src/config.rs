//! Scheduler configuration.
//!
//! Parsed from TOML, then overridden from the environment (`TASKHUB_<KEY>`,
//! profile-aware through `TASKHUB_PROFILE`), then validated.

mod loading;
mod types;
mod validation;


pub use types::SchedulerConfig;
