//! Run configuration and command line interface
//!
//! [`RunConfig`] is everything `pipeline::build` needs: detector config,
//! input, output, annotation directory and muxer batching. It is read from
//! the command line through [`command`] and [`RunConfig::from_matches`].

use anyhow::{Result, bail};
use clap::{Arg, ArgMatches, Command, value_parser};
use log::warn;
use std::path::PathBuf;
use std::time::Duration;

use crate::annotation::AnnotationWriter;
use crate::pipeline::types::{Caps, Fraction};

pub const DEFAULT_DETECTOR_CONFIG: &str = "pgie_config_fd_lpd.txt";
pub const DEFAULT_CAPTURE_DEVICE: &str = "/dev/video0";
pub const DEFAULT_ENCODER_BITRATE: u32 = 1_000_000;

/// Fixed format produced by the live capture branch
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFormat {
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            pixel_format: "NV12".to_string(),
            width: 1280,
            height: 720,
            framerate: Fraction::new(30, 1),
        }
    }
}

impl CaptureFormat {
    pub fn caps(&self) -> Caps {
        Caps::raw_video()
            .with_format(self.pixel_format.clone())
            .with_size(self.width, self.height)
            .with_framerate(self.framerate)
    }
}

/// Where frames come from
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// Container file, demuxed and decoded at runtime
    File(PathBuf),
    /// Live capture device
    Capture { device: String, format: CaptureFormat },
}

impl InputSource {
    pub fn capture(device: impl Into<String>) -> Self {
        InputSource::Capture {
            device: device.into(),
            format: CaptureFormat::default(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, InputSource::Capture { .. })
    }
}

/// Where redacted frames go
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSink {
    /// Encoded into a container file
    File(PathBuf),
    /// Rendered on screen
    Display,
}

/// Batching parameters of the stream muxer
///
/// Handed to the muxer stage as is. The replay backend muxes a single input
/// and pushes every frame at once, so it never waits for the timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxConfig {
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    /// How long the muxer waits before pushing an incomplete batch
    pub batched_push_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            batch_size: 1,
            batched_push_timeout: Duration::from_micros(40_000),
        }
    }
}

/// Everything needed to build a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Handed to the inference stage as is
    pub detector_config: PathBuf,
    pub input: InputSource,
    pub output: OutputSink,
    pub annotation_dir: Option<PathBuf>,
    pub mux: MuxConfig,
    pub encoder_bitrate: u32,
}

impl RunConfig {
    pub fn new(detector_config: impl Into<PathBuf>, input: InputSource) -> Self {
        Self {
            detector_config: detector_config.into(),
            input,
            output: OutputSink::Display,
            annotation_dir: None,
            mux: MuxConfig::default(),
            encoder_bitrate: DEFAULT_ENCODER_BITRATE,
        }
    }

    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn with_annotation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.annotation_dir = Some(dir.into());
        self
    }

    /// Read the configuration from parsed command line arguments
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let detector_config = matches
            .get_one::<String>("detector-config")
            .map(String::as_str)
            .unwrap_or_default();
        if detector_config.trim().is_empty() {
            bail!("a detector config file is required");
        }

        let input = match matches.get_one::<PathBuf>("input") {
            Some(path) => InputSource::File(path.clone()),
            None => InputSource::capture(
                matches
                    .get_one::<String>("device")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_CAPTURE_DEVICE),
            ),
        };

        let output = match matches.get_one::<PathBuf>("output") {
            Some(path) => OutputSink::File(path.clone()),
            None => OutputSink::Display,
        };

        let mut config = RunConfig::new(detector_config, input).with_output(output);
        config.annotation_dir = matches.get_one::<PathBuf>("annotation-dir").cloned();
        if let Some(size) = matches.get_one::<u32>("batch-size") {
            config.mux.batch_size = *size;
        }
        if let Some(timeout) = matches.get_one::<u64>("batched-push-timeout") {
            config.mux.batched_push_timeout = Duration::from_micros(*timeout);
        }
        if let Some(bitrate) = matches.get_one::<u32>("bitrate") {
            config.encoder_bitrate = *bitrate;
        }

        if config.mux.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        Ok(config)
    }

    /// Annotation output, if configured and the directory exists
    pub fn annotation_writer(&self) -> Option<AnnotationWriter> {
        let dir = self.annotation_dir.as_ref()?;
        if !dir.is_dir() {
            warn!(
                "Annotation directory {} does not exist, annotation output disabled",
                dir.display()
            );
            return None;
        }
        Some(AnnotationWriter::new(dir))
    }
}

/// Command line interface of the application
pub fn command() -> Command {
    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("detector-config")
                .short('c')
                .long("detector-config")
                .value_name("FILE")
                .help("Detector (primary inference) config file.")
                .default_value(DEFAULT_DETECTOR_CONFIG),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("FILE")
                .help("Input video file. Reads from the capture device when omitted.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output video file. Renders on screen when omitted.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("annotation-dir")
                .short('k')
                .long("annotation-dir")
                .value_name("DIR")
                .help("Existing directory receiving one bounding box file per frame.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("DEVICE")
                .help("Capture device used when no input file is given.")
                .default_value(DEFAULT_CAPTURE_DEVICE),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .value_name("FRAMES")
                .help("Frames per inference batch.")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("batched-push-timeout")
                .long("batched-push-timeout")
                .value_name("MICROSECONDS")
                .help("Wait before pushing an incomplete batch.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("bitrate")
                .long("bitrate")
                .value_name("BPS")
                .help("Encoder bitrate for file output.")
                .value_parser(value_parser!(u32)),
        )
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
