pub mod config;
pub mod manifest;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use manifest::{DependencySpec, Manifest, TaskSpec};
pub use scheduler::{
    FailurePenalty, SchedulerMetrics, SchedulerStatus, TaskHandle, TaskRecord, TaskScheduler,
    TaskState, ENGINE_ID_PROPERTY,
};
