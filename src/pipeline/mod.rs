//! Pipeline layer of the redaction application
//!
//! Separates concerns between:
//! - Topology: stages, bins, ports and links ([`graph`], [`deferred`])
//! - Control: state machine and lifecycle ([`state`], [`controller`])
//! - Messaging: end of stream, errors and state changes ([`bus`])
//! - Data transport: the streaming thread carrying buffers through stages
//! - Health monitoring of the running pipeline ([`health`])
//!
//! # Architecture
//!
//! [`build`] assembles the input branch, the processing bin and the output
//! branch from a [`RunConfig`](crate::config::RunConfig). Stages are created
//! through an [`ElementFactory`], so the same topology runs on any backend.
//! The returned [`Pipeline`] is driven to `Playing` by [`Pipeline::run`],
//! which consumes bus messages until end of stream or the first error.

pub mod builder;
pub mod bus;
pub mod controller;
pub mod deferred;
pub mod graph;
pub mod health;
pub mod stage;
pub mod state;
mod streaming;
pub mod types;

pub use builder::build;
pub use bus::{BusMessage, RunOutcome};
pub use controller::{Pipeline, RunReport};
pub use graph::{PadProbe, ProbeReturn, StageGraph};
pub use health::{HealthSummary, PipelineHealth};
pub use stage::{Element, ElementFactory, StageKind};
pub use state::State;
pub use types::{Buffer, Caps, MediaKind, Timestamp};
