pub mod clock;
pub mod config;
pub mod dependency;
pub mod error;
pub mod ids;
pub mod sync;
pub mod task;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dependency::{Constraint, Dependency, Operator};
pub use error::*;
pub use ids::*;
pub use task::{RecoveryMode, Task, TaskBuilder};
pub use value::*;
