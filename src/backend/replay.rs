//! Replay backend
//!
//! Stages that run in-process on recorded detector output. Input files are
//! JSON lines: a container file starts with a [`StreamHeader`] naming the
//! streams the decoder will expose, every other line is a [`FrameRecord`].
//! A capture device yields frame records only, its format being fixed.
//!
//! The inference stage attaches the recorded objects as batch metadata, the
//! on-screen display turns the (redacted) metadata into a draw list and the
//! file output writes one JSON line per frame.

use bytes::Bytes;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::MuxConfig;
use crate::metadata::{BatchMeta, ColorParams, FrameMeta, ObjectMeta};
use crate::pipeline::stage::{Element, ElementFactory, Emitter, FlowError, StageKind};
use crate::pipeline::types::{Buffer, Caps, Timestamp};

/// Longest a display sink waits for a frame to become due
const MAX_RENDER_WAIT: Duration = Duration::from_secs(1);

/// First line of a container file: the streams it holds, in port order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub streams: Vec<Caps>,
}

/// One decoded frame and what the detector reported for it
///
/// `objects: null` (or a missing field) means the detector attached no
/// metadata to the frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(default)]
    pub stream: u32,
    #[serde(default)]
    pub pts_ms: i64,
    #[serde(default)]
    pub objects: Option<Vec<ObjectMeta>>,
}

impl FrameRecord {
    fn parse(payload: &[u8]) -> Result<Self, FlowError> {
        serde_json::from_slice(payload).map_err(|e| {
            FlowError::failed(
                "could not decode frame",
                Some(format!("{}: {}", e, String::from_utf8_lossy(payload))),
            )
        })
    }

    fn pts(&self) -> Result<Timestamp, FlowError> {
        Timestamp::checked_from_millis(self.pts_ms).ok_or_else(|| {
            FlowError::failed(
                "could not decode frame",
                Some(format!("pts {} ms out of range", self.pts_ms)),
            )
        })
    }
}

/// Shape drawn by the on-screen display for one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawBox {
    pub class_id: i32,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub border_width: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<ColorParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl DrawBox {
    fn from_object(object: &ObjectMeta) -> Self {
        let rect = &object.rect_params;
        let text = &object.text_params;
        Self {
            class_id: object.class_id,
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
            border_width: rect.border_width,
            fill: rect.has_bg_color.then_some(rect.bg_color),
            label: text
                .display_text
                .clone()
                .filter(|_| text.font_params.font_size > 0),
        }
    }
}

/// Rendered frame as produced by the on-screen display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawList {
    pub frame: u64,
    pub source: u32,
    pub pts_ms: i64,
    pub boxes: Vec<DrawBox>,
}

fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, FlowError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| FlowError::failed("could not encode frame", Some(e.to_string())))
}

/// Creates the replay implementation of every stage kind
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayFactory;

impl ElementFactory for ReplayFactory {
    fn make(&self, kind: &StageKind, name: &str) -> Result<Box<dyn Element>, String> {
        trace!("Creating replay {} for {}", kind.factory_name(), name);
        Ok(match kind {
            StageKind::FileSource { location } => Box::new(LineSource::new(location, false)),
            StageKind::CaptureSource { device } => Box::new(LineSource::new(device, true)),
            StageKind::Decoder => Box::new(Decoder::default()),
            StageKind::Convert
            | StageKind::Scale
            | StageKind::CapsFilter { .. }
            | StageKind::Queue
            | StageKind::EglTransform => Box::new(Passthrough),
            StageKind::StreamMux(config) => Box::new(StreamMux::new(config.clone())),
            StageKind::Inference { config_path } => Box::new(Inference::new(config_path.clone())),
            StageKind::OnScreenDisplay => Box::new(Overlay),
            StageKind::Encoder { bitrate } => Box::new(Encoder { bitrate: *bitrate }),
            StageKind::ContainerMux => Box::new(ContainerMux::default()),
            StageKind::FileSink { location } => Box::new(FileSink::new(location.clone())),
            StageKind::DisplaySink { sync } => Box::new(DisplaySink::new(*sync)),
        })
    }
}

/// Reads a file line by line
///
/// A capture device is a stream of frame records and stamps their pts; a
/// container file is handed to the decoder untouched.
struct LineSource {
    location: PathBuf,
    live: bool,
    reader: Option<BufReader<File>>,
}

impl LineSource {
    fn new(location: impl AsRef<Path>, live: bool) -> Self {
        Self {
            location: location.as_ref().to_path_buf(),
            live,
            reader: None,
        }
    }
}

impl Element for LineSource {
    fn start(&mut self) -> Result<(), String> {
        let file = File::open(&self.location)
            .map_err(|e| format!("could not open {}: {}", self.location.display(), e))?;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn stop(&mut self) {
        self.reader = None;
    }

    fn pull(&mut self, out: &mut Emitter) -> Result<bool, FlowError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| FlowError::failed("source is not started", None))?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).map_err(|e| {
                FlowError::failed(
                    "could not read from resource",
                    Some(format!("{}: {}", self.location.display(), e)),
                )
            })?;
            if read == 0 {
                return Ok(false);
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let payload = Bytes::from(line.trim_end().to_string());
        let mut buffer = Buffer::new(payload);
        if self.live {
            buffer.pts = FrameRecord::parse(&buffer.payload)?.pts()?;
        }
        out.push_src(buffer);
        Ok(true)
    }

    fn chain(&mut self, port: &str, _buffer: Buffer, _out: &mut Emitter) -> Result<(), FlowError> {
        Err(FlowError::failed(format!("source has no input port {}", port), None))
    }
}

/// Exposes one port per stream listed in the header, then routes records
#[derive(Default)]
struct Decoder {
    streams: Option<Vec<Caps>>,
}

impl Element for Decoder {
    fn stop(&mut self) {
        self.streams = None;
    }

    fn chain(&mut self, _port: &str, buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
        if self.streams.is_none() {
            let header: StreamHeader = serde_json::from_slice(&buffer.payload).map_err(|e| {
                FlowError::failed("stream type not found", Some(format!("invalid header: {}", e)))
            })?;
            debug!("Container holds {} streams", header.streams.len());
            for (index, caps) in header.streams.iter().enumerate() {
                out.announce(format!("src_{}", index), caps.clone());
            }
            self.streams = Some(header.streams);
            return Ok(());
        }

        let known = self.streams.as_ref().map_or(0, Vec::len);
        let record = FrameRecord::parse(&buffer.payload)?;
        if record.stream as usize >= known {
            return Err(FlowError::failed(
                "could not decode frame",
                Some(format!("record for unknown stream {}", record.stream)),
            ));
        }

        let port = format!("src_{}", record.stream);
        let pts = record.pts()?;
        out.push(port, buffer.with_pts(pts));
        Ok(())
    }
}

struct Passthrough;

impl Element for Passthrough {
    fn chain(&mut self, _port: &str, buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
        out.push_src(buffer);
        Ok(())
    }
}

/// Numbers frames per input and tags them with their source
///
/// Single input frames are pushed straight away as a partial batch, so the
/// push timeout never comes into play here.
struct StreamMux {
    config: MuxConfig,
    next_frame: Vec<u64>,
}

impl StreamMux {
    fn new(config: MuxConfig) -> Self {
        Self {
            config,
            next_frame: Vec::new(),
        }
    }
}

impl Element for StreamMux {
    fn start(&mut self) -> Result<(), String> {
        info!(
            "Muxer output {}x{}, batch size {}, push timeout {} us",
            self.config.width,
            self.config.height,
            self.config.batch_size,
            self.config.batched_push_timeout.as_micros()
        );
        self.next_frame.clear();
        Ok(())
    }

    fn chain(&mut self, port: &str, mut buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
        let source = port
            .strip_prefix("sink_")
            .and_then(|index| index.parse::<usize>().ok())
            .ok_or_else(|| FlowError::failed(format!("no such input {}", port), None))?;

        if self.next_frame.len() <= source {
            self.next_frame.resize(source + 1, 0);
        }
        buffer.frame_num = self.next_frame[source];
        buffer.source_id = source as u32;
        self.next_frame[source] += 1;

        out.push_src(buffer);
        Ok(())
    }
}

/// Attaches the recorded detections as batch metadata
struct Inference {
    config_path: PathBuf,
}

impl Inference {
    fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }
}

impl Element for Inference {
    fn start(&mut self) -> Result<(), String> {
        File::open(&self.config_path).map_err(|e| {
            format!(
                "could not read detector config {}: {}",
                self.config_path.display(),
                e
            )
        })?;
        debug!("Detector config {}", self.config_path.display());
        Ok(())
    }

    fn chain(&mut self, _port: &str, mut buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
        let record = FrameRecord::parse(&buffer.payload)?;
        if let Some(objects) = record.objects {
            let frame = FrameMeta::new(buffer.frame_num, buffer.source_id, objects);
            buffer = buffer.with_meta(BatchMeta::single(frame));
        }
        out.push_src(buffer);
        Ok(())
    }
}

/// Renders metadata into a draw list
struct Overlay;

impl Element for Overlay {
    fn chain(&mut self, _port: &str, mut buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
        let boxes = buffer
            .batch_meta()
            .map(|batch| {
                batch
                    .frames()
                    .flat_map(|frame| frame.objects())
                    .map(DrawBox::from_object)
                    .collect()
            })
            .unwrap_or_default();

        let drawn = DrawList {
            frame: buffer.frame_num,
            source: buffer.source_id,
            pts_ms: buffer.pts.micros / 1000,
            boxes,
        };
        buffer.payload = encode_json(&drawn)?;
        out.push_src(buffer);
        Ok(())
    }
}

#[derive(Serialize)]
struct EncodedFrame {
    frame: u64,
    pts_ms: i64,
    bitrate: u32,
    picture: serde_json::Value,
}

struct Encoder {
    bitrate: u32,
}

impl Element for Encoder {
    fn chain(&mut self, _port: &str, mut buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
        let picture = serde_json::from_slice(&buffer.payload)
            .map_err(|e| FlowError::failed("could not encode frame", Some(e.to_string())))?;
        let encoded = EncodedFrame {
            frame: buffer.frame_num,
            pts_ms: buffer.pts.micros / 1000,
            bitrate: self.bitrate,
            picture,
        };
        buffer.payload = encode_json(&encoded)?;
        out.push_src(buffer);
        Ok(())
    }
}

/// Wraps encoded frames between a header and a trailer line
#[derive(Default)]
struct ContainerMux {
    frames: u64,
}

impl Element for ContainerMux {
    fn start(&mut self) -> Result<(), String> {
        self.frames = 0;
        Ok(())
    }

    fn chain(&mut self, _port: &str, buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
        if self.frames == 0 {
            let header = serde_json::json!({ "container": "video/quicktime", "codec": "video/mpeg" });
            out.push_src(Buffer::new(encode_json(&header)?).with_pts(buffer.pts));
        }
        self.frames += 1;
        out.push_src(buffer);
        Ok(())
    }

    fn drain(&mut self, out: &mut Emitter) -> Result<(), FlowError> {
        let trailer = serde_json::json!({ "frames": self.frames });
        out.push_src(Buffer::new(encode_json(&trailer)?));
        Ok(())
    }
}

/// Writes every buffer as one line
struct FileSink {
    location: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    fn new(location: PathBuf) -> Self {
        Self {
            location,
            writer: None,
        }
    }
}

impl Element for FileSink {
    fn start(&mut self) -> Result<(), String> {
        let file = File::create(&self.location)
            .map_err(|e| format!("could not open {} for writing: {}", self.location.display(), e))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                log::warn!("Failed to flush {}: {}", self.location.display(), e);
            }
        }
    }

    fn chain(&mut self, _port: &str, buffer: Buffer, _out: &mut Emitter) -> Result<(), FlowError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FlowError::failed("sink is not started", None))?;
        writer
            .write_all(&buffer.payload)
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(|e| {
                FlowError::failed(
                    "could not write to resource",
                    Some(format!("{}: {}", self.location.display(), e)),
                )
            })
    }

    fn drain(&mut self, _out: &mut Emitter) -> Result<(), FlowError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| {
                FlowError::failed(
                    "could not write to resource",
                    Some(format!("{}: {}", self.location.display(), e)),
                )
            })?;
        }
        Ok(())
    }
}

/// Logs rendered frames, optionally paced by their timestamps
struct DisplaySink {
    sync: bool,
    /// Wall clock and pts of the first rendered frame
    base: Option<(Instant, Timestamp)>,
    rendered: u64,
}

impl DisplaySink {
    fn new(sync: bool) -> Self {
        Self {
            sync,
            base: None,
            rendered: 0,
        }
    }

    fn wait_until_due(&mut self, pts: Timestamp) {
        let (started, first) = *self.base.get_or_insert((Instant::now(), pts));
        if pts < first {
            return;
        }
        let wait = pts.diff(first).saturating_sub(started.elapsed());
        if !wait.is_zero() {
            std::thread::sleep(wait.min(MAX_RENDER_WAIT));
        }
    }
}

impl Element for DisplaySink {
    fn start(&mut self) -> Result<(), String> {
        self.base = None;
        self.rendered = 0;
        Ok(())
    }

    fn stop(&mut self) {
        if self.rendered > 0 {
            info!("Rendered {} frames", self.rendered);
        }
    }

    fn chain(&mut self, _port: &str, buffer: Buffer, _out: &mut Emitter) -> Result<(), FlowError> {
        if self.sync {
            self.wait_until_due(buffer.pts);
        }
        self.rendered += 1;
        trace!("Rendered frame {} at {}", buffer.frame_num, buffer.pts);
        Ok(())
    }
}
