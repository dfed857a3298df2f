//! agentkit - Event-sourced run engine for agent UIs
//!
//! Triggers runs of an agent, records everything the agent emits as an
//! ordered, durable event log, and fans events out live to any number of
//! subscribers that can join late or reconnect without gaps or duplicates.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every emission is appended to the run's log before anyone sees it
//! - Subscribers replay the log, then follow the live broadcast
//! - Run status is derived from the log's terminal event
//!
//! # Modules
//!
//! - `adapters`: Agent and event sink interfaces (plus the echo agent)
//! - `core`: Engine components (EventLog, Broadcast, Registry, Executor, Gateway)
//! - `domain`: Data structures (Event, RunRecord, ArtifactRef)
//! - `server`: HTTP + SSE adapter
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Serve over HTTP
//! agentkit serve --port 8080
//!
//! # Trigger a run and follow its events
//! agentkit trigger -i task="2+2" --follow
//!
//! # Replay a run's log
//! agentkit logs <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod server;

// Re-export main types at crate root for convenience
pub use adapters::{Agent, EchoAgent, EventSink, RunContext};
pub use config::Config;
pub use core::{Engine, EventStream};
pub use domain::{ArtifactRef, Event, EventKind, FileRef, InputValue, RunInputs, RunRecord, RunStatus};
pub use error::{EngineError, Result, StorageError};
