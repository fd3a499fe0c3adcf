//! Video redaction pipeline
//!
//! Hides faces and license plates reported by an object detector by turning
//! their boxes into opaque patches before the frame is rendered or encoded,
//! and optionally writes one bounding-box annotation file per frame.

pub mod annotation;
pub mod backend;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod probe;
pub mod redaction;
