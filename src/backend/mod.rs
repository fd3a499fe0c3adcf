//! Stage implementations
//!
//! The pipeline only talks to stages through [`ElementFactory`]. Native
//! decode, inference and render bindings plug in there; [`replay`] is the
//! in-process implementation that replays detector output recorded as JSON
//! lines.
//!
//! [`ElementFactory`]: crate::pipeline::stage::ElementFactory

pub mod replay;

pub use replay::{FrameRecord, ReplayFactory, StreamHeader};
