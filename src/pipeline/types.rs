//! Core types for the pipeline system

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::metadata::BatchMeta;

/// Timestamp representation for media buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    /// Microseconds since the start of the stream
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from milliseconds, `None` if it does not fit
    pub fn checked_from_millis(millis: i64) -> Option<Self> {
        millis.checked_mul(1000).map(Self::from_micros)
    }

    /// Calculate the difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        Duration::from_micros(self.micros.abs_diff(other.micros))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Kind of media carried by a port
///
/// Closed set: deferred links match on it instead of inspecting media type
/// strings at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Video frames, raw or encoded
    Video,
    /// Audio samples, raw or encoded
    Audio,
    /// Anything else: containers, subtitles, unknown streams
    Other,
}

impl MediaKind {
    /// Classify a media type name such as `video/x-raw`
    pub fn from_media_type(media_type: &str) -> Self {
        if media_type.starts_with("video/") {
            MediaKind::Video
        } else if media_type.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
            MediaKind::Other => write!(f, "Other"),
        }
    }
}

/// Rational number, used for frame rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Media type accepted or produced by a port
///
/// The `ANY` media type matches everything. Optional fields only constrain a
/// match when both sides set them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    #[serde(rename = "media")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<Fraction>,
}

impl Caps {
    pub const ANY: &'static str = "ANY";

    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            format: None,
            width: None,
            height: None,
            framerate: None,
        }
    }

    pub fn any() -> Self {
        Self::new(Self::ANY)
    }

    /// Raw video frames
    pub fn raw_video() -> Self {
        Self::new("video/x-raw")
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_framerate(mut self, framerate: Fraction) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn is_any(&self) -> bool {
        self.media_type == Self::ANY
    }

    pub fn kind(&self) -> MediaKind {
        MediaKind::from_media_type(&self.media_type)
    }

    /// Whether a stream could satisfy both caps at once
    pub fn can_intersect(&self, other: &Caps) -> bool {
        if self.is_any() || other.is_any() {
            return true;
        }

        fn agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        self.media_type == other.media_type
            && agree(&self.format, &other.format)
            && agree(&self.width, &other.width)
            && agree(&self.height, &other.height)
            && agree(&self.framerate, &other.framerate)
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.media_type)?;
        if let Some(format) = &self.format {
            write!(f, ", format={}", format)?;
        }
        if let Some(width) = self.width {
            write!(f, ", width={}", width)?;
        }
        if let Some(height) = self.height {
            write!(f, ", height={}", height)?;
        }
        if let Some(framerate) = self.framerate {
            write!(f, ", framerate={}", framerate)?;
        }
        Ok(())
    }
}

/// A unit of media flowing between stages
///
/// Stages may rewrite the payload and attach or mutate metadata, but a buffer
/// reaching a probe is always forwarded as a whole.
#[derive(Clone, Default)]
pub struct Buffer {
    /// Presentation timestamp
    pub pts: Timestamp,
    pub duration: Option<Duration>,
    /// Encoded or raw media data
    pub payload: Bytes,
    /// Frame number stamped by the muxer
    pub frame_num: u64,
    /// Source stream index stamped by the muxer
    pub source_id: u32,
    /// Detection metadata attached by the inference stage
    pub meta: Option<BatchMeta>,
}

impl Buffer {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_pts(mut self, pts: Timestamp) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_meta(mut self, meta: BatchMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn batch_meta(&self) -> Option<&BatchMeta> {
        self.meta.as_ref()
    }

    pub fn batch_meta_mut(&mut self) -> Option<&mut BatchMeta> {
        self.meta.as_mut()
    }

    /// Get the size of the payload in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("pts", &self.pts)
            .field("frame_num", &self.frame_num)
            .field("source_id", &self.source_id)
            .field("size", &self.size())
            .field("frames", &self.meta.as_ref().map(|m| m.num_frames()))
            .finish()
    }
}
