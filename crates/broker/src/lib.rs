//! Pending-result broker.
//!
//! Maps opaque [`ResultHandle`]s to in-flight or completed asynchronous
//! results, scoped per client, with one retrieval call that either waits for
//! the result or returns immediately.
//!
//! [`ResultHandle`]: taskhub_core::ResultHandle

pub mod broker;

pub use broker::{ClientSummary, PendingResultBroker};
