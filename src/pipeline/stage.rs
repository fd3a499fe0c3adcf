//! Pipeline stage kinds, their port contracts and the element trait
//!
//! A stage is described by a [`StageKind`] (what it is and how it is
//! configured) and implemented by an [`Element`] created through an
//! [`ElementFactory`]. The factory is the seam to the native decode,
//! inference and render implementations.

use std::path::PathBuf;
use thiserror::Error;

use super::types::{Buffer, Caps};
use crate::config::MuxConfig;

/// Kind and configuration of a stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    /// Reads the input file
    FileSource { location: PathBuf },
    /// Demuxes and decodes, exposing one output port per discovered stream
    Decoder,
    /// Live capture device with a fixed output format
    CaptureSource { device: String },
    /// Color space / memory conversion
    Convert,
    /// Resolution scaling
    Scale,
    /// Restricts the format flowing through it
    CapsFilter { caps: Caps },
    /// Thread boundary between two stages
    Queue,
    /// Batches frames of one or more inputs for inference
    StreamMux(MuxConfig),
    /// Object detection, configured by the detector config file
    Inference { config_path: PathBuf },
    /// Draws boxes and labels from the attached metadata
    OnScreenDisplay,
    Encoder { bitrate: u32 },
    ContainerMux,
    FileSink { location: PathBuf },
    /// EGL transform required before the display sink on embedded targets
    EglTransform,
    /// Live display
    DisplaySink { sync: bool },
}

impl StageKind {
    /// Name of the element implementing this kind
    pub fn factory_name(&self) -> &'static str {
        match self {
            StageKind::FileSource { .. } => "filesrc",
            StageKind::Decoder => "decodebin",
            StageKind::CaptureSource { .. } => "v4l2src",
            StageKind::Convert => "videoconvert",
            StageKind::Scale => "videoscale",
            StageKind::CapsFilter { .. } => "capsfilter",
            StageKind::Queue => "queue",
            StageKind::StreamMux(_) => "streammux",
            StageKind::Inference { .. } => "infer",
            StageKind::OnScreenDisplay => "osd",
            StageKind::Encoder { .. } => "mpeg4enc",
            StageKind::ContainerMux => "qtmux",
            StageKind::FileSink { .. } => "filesink",
            StageKind::EglTransform => "egltransform",
            StageKind::DisplaySink { .. } => "eglglessink",
        }
    }

    /// Port templates: which ports the stage has and what they carry
    pub fn templates(&self) -> Vec<PortTemplate> {
        use PortTemplate as T;

        let raw = Caps::raw_video;
        match self {
            StageKind::FileSource { .. } => vec![T::src(Caps::any())],
            StageKind::Decoder => vec![
                T::sink(Caps::any()),
                T::new("src_%u", Direction::Src, Presence::Sometimes, Caps::any()),
            ],
            StageKind::CaptureSource { .. } => vec![T::src(raw())],
            StageKind::Convert | StageKind::Scale | StageKind::Queue => {
                vec![T::sink(Caps::any()), T::src(Caps::any())]
            }
            StageKind::CapsFilter { caps } => vec![T::sink(caps.clone()), T::src(caps.clone())],
            StageKind::StreamMux(_) => vec![
                T::new("sink_%u", Direction::Sink, Presence::Request, raw()),
                T::src(raw()),
            ],
            StageKind::Inference { .. } | StageKind::OnScreenDisplay | StageKind::EglTransform => {
                vec![T::sink(raw()), T::src(raw())]
            }
            StageKind::Encoder { .. } => vec![T::sink(raw()), T::src(Caps::new("video/mpeg"))],
            StageKind::ContainerMux => vec![
                T::sink(Caps::new("video/mpeg")),
                T::src(Caps::new("video/quicktime")),
            ],
            StageKind::FileSink { .. } => vec![T::sink(Caps::any())],
            StageKind::DisplaySink { .. } => vec![T::sink(raw())],
        }
    }
}

/// Direction of data through a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Data enters the stage
    Sink,
    /// Data leaves the stage
    Src,
}

/// When a port exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Created with the stage
    Always,
    /// Announced by the stage at runtime, once it knows what it produces
    Sometimes,
    /// Created on demand by whoever links to the stage
    Request,
}

/// Template of a port of a stage kind
#[derive(Debug, Clone, PartialEq)]
pub struct PortTemplate {
    /// Port name, or a pattern with `%u` for sometimes/request ports
    pub name: &'static str,
    pub direction: Direction,
    pub presence: Presence,
    pub caps: Caps,
}

impl PortTemplate {
    pub fn new(name: &'static str, direction: Direction, presence: Presence, caps: Caps) -> Self {
        Self {
            name,
            direction,
            presence,
            caps,
        }
    }

    pub fn sink(caps: Caps) -> Self {
        Self::new("sink", Direction::Sink, Presence::Always, caps)
    }

    pub fn src(caps: Caps) -> Self {
        Self::new("src", Direction::Src, Presence::Always, caps)
    }

    /// Whether a concrete port name is an instance of this template
    pub fn matches(&self, port: &str) -> bool {
        match self.name.strip_suffix("%u") {
            Some(prefix) => port
                .strip_prefix(prefix)
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())),
            None => self.name == port,
        }
    }
}

/// Error raised while a buffer moves through the stages
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    /// The buffer was pushed on a port without a peer
    #[error("internal data stream error: port {0} is not linked")]
    NotLinked(String),
    /// A stage failed to process the buffer
    #[error("{message}")]
    Failed {
        message: String,
        debug: Option<String>,
    },
}

impl FlowError {
    pub fn failed(message: impl Into<String>, debug: Option<String>) -> Self {
        FlowError::Failed {
            message: message.into(),
            debug,
        }
    }

    pub fn debug(&self) -> Option<&str> {
        match self {
            FlowError::Failed { debug, .. } => debug.as_deref(),
            FlowError::NotLinked(_) => None,
        }
    }
}

/// A new output port announced by a stage at runtime
#[derive(Debug, Clone, PartialEq)]
pub struct PadAnnouncement {
    pub port: String,
    pub caps: Caps,
}

/// Collects what a stage produced while handling one call
#[derive(Debug, Default)]
pub struct Emitter {
    pub(crate) announced: Vec<PadAnnouncement>,
    pub(crate) pushed: Vec<(String, Buffer)>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a buffer out of the given source port
    pub fn push(&mut self, port: impl Into<String>, buffer: Buffer) {
        self.pushed.push((port.into(), buffer));
    }

    /// Push a buffer out of the `src` port
    pub fn push_src(&mut self, buffer: Buffer) {
        self.push("src", buffer);
    }

    /// Announce a new output port carrying `caps`
    pub fn announce(&mut self, port: impl Into<String>, caps: Caps) {
        self.announced.push(PadAnnouncement {
            port: port.into(),
            caps,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.announced.is_empty() && self.pushed.is_empty()
    }
}

/// Behaviour of a stage
///
/// Called only from the thread driving the pipeline state or from the
/// streaming thread, never from both at once.
pub trait Element: Send {
    /// Acquire resources (NULL -> READY)
    fn start(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Release resources (READY -> NULL)
    fn stop(&mut self) {}

    /// Produce the next buffer. Sources only; `Ok(false)` means end of stream.
    fn pull(&mut self, _out: &mut Emitter) -> Result<bool, FlowError> {
        Ok(false)
    }

    /// Handle a buffer arriving on one of the sink ports
    fn chain(&mut self, port: &str, buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError>;

    /// End of stream reached this stage: flush pending output
    fn drain(&mut self, _out: &mut Emitter) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Creates the element implementing a stage kind
pub trait ElementFactory: Send + Sync {
    /// Fails when the implementation is not available on this system
    fn make(&self, kind: &StageKind, name: &str) -> Result<Box<dyn Element>, String>;
}
