//! Domain types for the run engine.
//!
//! This module contains the core data structures:
//! - Events: Immutable, sequenced records of what a run did
//! - Run: Run metadata, inputs and lifecycle status
//! - Artifact: References to stored files

pub mod artifact;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use artifact::{ArtifactRef, FileRef};
pub use events::{Event, EventKind};
pub use run::{terminal_outcome, InputValue, RunInputs, RunRecord, RunStatus};
