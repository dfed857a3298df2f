//! Core run engine.
//!
//! This module contains:
//! - EventLog: Append-only, per-run event persistence
//! - Broadcast: Live fan-out of appended events
//! - Registry: In-memory index of active runs
//! - Executor: Runs agents and records what they emit
//! - Gateway: Replay + live streams for subscribers
//! - Engine: Wires it all together

pub mod artifacts;
pub mod broadcast;
pub mod controller;
pub mod engine;
pub mod event_log;
pub mod executor;
pub mod gateway;
pub mod registry;
pub mod run_store;
pub mod safety;

// Re-export commonly used types
pub use artifacts::ArtifactStore;
pub use broadcast::{BroadcastChannel, Subscription};
pub use controller::RunController;
pub use engine::{Engine, INTERRUPTED_MESSAGE};
pub use event_log::{EventLog, JsonlEventLog};
pub use executor::{Executor, RunSink, MISSING_TERMINAL_MESSAGE};
pub use gateway::{EventStream, StreamGateway};
pub use registry::{RunHandle, RunRegistry};
pub use run_store::RunStore;
pub use safety::{InputLimits, SafetyViolation};
