//! Builds the redaction pipeline from a run configuration
//!
//! ```text
//! file:  file-source -> decoder ~> [video-process-bin]
//! live:  camera-source -> capture-convert -> capture-scale -> capture-filter -> [video-process-bin]
//!
//! video-process-bin:
//!   stream-muxer -> infer-queue -> primary-inference -> overlay-convert -> on-screen-display -> output
//!
//! output (file):    sink-queue -> sink-convert -> sink-filter -> videoconverter -> encoder
//!                   -> container-muxer -> file-sink
//! output (display): [egl-transform ->] video-renderer
//! ```
//!
//! `~>` is the deferred link resolved once the decoder announces a video port.
//! The frame probe sits on the input of `on-screen-display`.

use log::info;
use std::sync::Arc;

use super::controller::Pipeline;
use super::deferred::DeferredLink;
use super::graph::{BinId, Parent, PortRef, StageGraph, StageId};
use super::health::PipelineHealth;
use super::stage::{ElementFactory, StageKind};
use super::types::Caps;
use crate::config::{InputSource, OutputSink, RunConfig};
use crate::error::PipelineError;
use crate::probe::FrameProbe;

pub const PIPELINE_NAME: &str = "redaction-pipeline";
pub const PROCESS_BIN: &str = "video-process-bin";
/// Stage whose input carries the frame probe
pub const PROBED_STAGE: &str = "on-screen-display";

/// Format the encoder branch converts to
const ENCODER_INPUT_FORMAT: &str = "I420";

/// Input branch, and how it reaches the processing bin
enum InputBranch {
    /// Terminal stage is linked to the bin right away
    Static { source: StageId, tail: StageId },
    /// The decoder's output port is only known at runtime
    Deferred { source: StageId, decoder: StageId },
}

/// Build the pipeline described by `config` with stages made by `factory`
///
/// Stops at the first stage that cannot be created or linked; the error names
/// it. Nothing is started: the returned pipeline is in the `Null` state.
pub fn build(config: &RunConfig, factory: &dyn ElementFactory) -> Result<Pipeline, PipelineError> {
    let mut graph = StageGraph::new(PIPELINE_NAME);

    let input = build_input(&mut graph, config, factory)?;
    let (bin, mux, osd) = build_process_bin(&mut graph, config, factory)?;
    build_output(&mut graph, config, factory, Parent::Bin(bin), osd)?;

    let mux_input = graph
        .request_port(mux, "sink_0")
        .map_err(|e| PipelineError::link(PROCESS_BIN, "stream-muxer:sink_0", e))?;
    graph
        .add_ghost_port(bin, "sink", mux_input)
        .map_err(|e| PipelineError::link(PROCESS_BIN, "stream-muxer:sink_0", e))?;

    let source = match input {
        InputBranch::Static { source, tail } => {
            graph.link_stage_to_ghost(tail, bin)?;
            source
        }
        InputBranch::Deferred { source, decoder } => {
            graph.add_deferred_link(DeferredLink::new(decoder, bin));
            source
        }
    };

    let health = Arc::new(PipelineHealth::new());
    let probe = FrameProbe::new(config.annotation_writer(), Arc::clone(&health));
    if let Some(writer) = probe.annotations() {
        info!("Writing annotations to {}", writer.dir().display());
    }
    let probed = PortRef::new(osd, "sink");
    graph
        .add_probe(&probed, Arc::new(probe))
        .map_err(|e| PipelineError::link(graph.describe(&probed), "frame probe", e))?;

    info!(
        "Built {} with {} stages",
        PIPELINE_NAME,
        graph.stages().count()
    );
    Ok(Pipeline::new(graph, source, health))
}

fn build_input(
    graph: &mut StageGraph,
    config: &RunConfig,
    factory: &dyn ElementFactory,
) -> Result<InputBranch, PipelineError> {
    match &config.input {
        InputSource::File(location) => {
            info!("Reading from file {}", location.display());
            let source = graph.add_stage(
                "file-source",
                StageKind::FileSource {
                    location: location.clone(),
                },
                Parent::Top,
                factory,
            )?;
            let decoder = graph.add_stage("decoder", StageKind::Decoder, Parent::Top, factory)?;
            graph.link(source, decoder)?;
            Ok(InputBranch::Deferred { source, decoder })
        }
        InputSource::Capture { device, format } => {
            info!("Capturing from {} ({}x{} {} @ {})", device, format.width, format.height, format.pixel_format, format.framerate);
            let source = graph.add_stage(
                "camera-source",
                StageKind::CaptureSource {
                    device: device.clone(),
                },
                Parent::Top,
                factory,
            )?;
            let convert = graph.add_stage("capture-convert", StageKind::Convert, Parent::Top, factory)?;
            let scale = graph.add_stage("capture-scale", StageKind::Scale, Parent::Top, factory)?;
            let filter = graph.add_stage(
                "capture-filter",
                StageKind::CapsFilter {
                    caps: format.caps(),
                },
                Parent::Top,
                factory,
            )?;
            graph.link_many(&[source, convert, scale, filter])?;
            Ok(InputBranch::Static {
                source,
                tail: filter,
            })
        }
    }
}

/// Returns the bin, its muxer and its on-screen display stage
fn build_process_bin(
    graph: &mut StageGraph,
    config: &RunConfig,
    factory: &dyn ElementFactory,
) -> Result<(BinId, StageId, StageId), PipelineError> {
    let bin = graph.add_bin(PROCESS_BIN, Parent::Top)?;
    let inside = Parent::Bin(bin);

    let mux = graph.add_stage("stream-muxer", StageKind::StreamMux(config.mux.clone()), inside, factory)?;
    let queue = graph.add_stage("infer-queue", StageKind::Queue, inside, factory)?;
    let infer = graph.add_stage(
        "primary-inference",
        StageKind::Inference {
            config_path: config.detector_config.clone(),
        },
        inside,
        factory,
    )?;
    let convert = graph.add_stage("overlay-convert", StageKind::Convert, inside, factory)?;
    let osd = graph.add_stage(PROBED_STAGE, StageKind::OnScreenDisplay, inside, factory)?;

    graph.link_many(&[mux, queue, infer, convert, osd])?;
    Ok((bin, mux, osd))
}

fn build_output(
    graph: &mut StageGraph,
    config: &RunConfig,
    factory: &dyn ElementFactory,
    parent: Parent,
    osd: StageId,
) -> Result<(), PipelineError> {
    let mut chain = vec![osd];

    match &config.output {
        OutputSink::File(location) => {
            info!("Writing to file {}", location.display());
            chain.push(graph.add_stage("sink-queue", StageKind::Queue, parent, factory)?);
            chain.push(graph.add_stage("sink-convert", StageKind::Convert, parent, factory)?);
            chain.push(graph.add_stage(
                "sink-filter",
                StageKind::CapsFilter {
                    caps: Caps::raw_video().with_format(ENCODER_INPUT_FORMAT),
                },
                parent,
                factory,
            )?);
            chain.push(graph.add_stage("videoconverter", StageKind::Convert, parent, factory)?);
            chain.push(graph.add_stage(
                "encoder",
                StageKind::Encoder {
                    bitrate: config.encoder_bitrate,
                },
                parent,
                factory,
            )?);
            chain.push(graph.add_stage("container-muxer", StageKind::ContainerMux, parent, factory)?);
            chain.push(graph.add_stage(
                "file-sink",
                StageKind::FileSink {
                    location: location.clone(),
                },
                parent,
                factory,
            )?);
        }
        OutputSink::Display => {
            if cfg!(target_arch = "aarch64") {
                chain.push(graph.add_stage("egl-transform", StageKind::EglTransform, parent, factory)?);
            }
            // live input renders as fast as it arrives, file input at its own rate
            let sync = !config.input.is_live();
            chain.push(graph.add_stage("video-renderer", StageKind::DisplaySink { sync }, parent, factory)?);
        }
    }

    graph.link_many(&chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::pipeline::graph::tests::TestFactory;
    use crate::pipeline::types::Buffer;
    use std::path::PathBuf;

    const FACTORY: TestFactory = TestFactory { refuse: None };

    fn names(pipeline: &Pipeline) -> Vec<String> {
        pipeline
            .graph()
            .stages()
            .map(|(_, s)| s.name().to_string())
            .collect()
    }

    fn file_config() -> RunConfig {
        RunConfig::new("detector.txt", InputSource::File(PathBuf::from("in.mp4")))
            .with_output(OutputSink::File(PathBuf::from("out.mp4")))
    }

    #[test]
    fn test_file_to_file_layout() {
        let pipeline = build(&file_config(), &FACTORY).unwrap();
        assert_eq!(
            names(&pipeline),
            vec![
                "file-source", "decoder", "stream-muxer", "infer-queue", "primary-inference",
                "overlay-convert", "on-screen-display", "sink-queue", "sink-convert", "sink-filter",
                "videoconverter", "encoder", "container-muxer", "file-sink",
            ]
        );

        let graph = pipeline.graph();
        let bin = graph.bin_by_name(PROCESS_BIN).unwrap();
        let ghost = graph.bin(bin).ghost().unwrap();
        assert_eq!(graph.describe(&ghost.target), "stream-muxer:sink_0");
        assert!(!ghost.is_linked());

        let decoder = graph.stage_by_name("decoder").unwrap();
        assert_eq!(graph.deferred_links_for(decoder).count(), 1);

        let osd = graph.stage_by_name(PROBED_STAGE).unwrap();
        let file_sink = graph.stage_by_name("file-sink").unwrap();
        assert_eq!(graph.stage(osd).parent(), Parent::Bin(bin));
        assert_eq!(graph.stage(file_sink).parent(), Parent::Bin(bin));
    }

    #[test]
    fn test_live_to_display_layout() {
        let config = RunConfig::new("detector.txt", InputSource::capture("/dev/video1"));
        let pipeline = build(&config, &FACTORY).unwrap();
        let graph = pipeline.graph();

        let filter = graph.stage_by_name("capture-filter").unwrap();
        let bin = graph.bin_by_name(PROCESS_BIN).unwrap();
        assert!(graph.ghost_is_linked(bin));
        assert_eq!(
            graph.peer_of(&PortRef::new(filter, "src")).map(|p| graph.describe(p)),
            Some("stream-muxer:sink_0".to_string())
        );

        let renderer = graph.stage_by_name("video-renderer").unwrap();
        assert_eq!(graph.stage(renderer).kind(), &StageKind::DisplaySink { sync: false });
        assert!(graph.stage_by_name("file-sink").is_none());
        assert_eq!(
            graph.stage_by_name("egl-transform").is_some(),
            cfg!(target_arch = "aarch64")
        );
    }

    #[test]
    fn test_file_display_syncs() {
        let config = RunConfig::new("detector.txt", InputSource::File(PathBuf::from("in.mp4")));
        let pipeline = build(&config, &FACTORY).unwrap();
        let graph = pipeline.graph();
        let renderer = graph.stage_by_name("video-renderer").unwrap();
        assert_eq!(graph.stage(renderer).kind(), &StageKind::DisplaySink { sync: true });
    }

    #[test]
    fn test_missing_stage_names_component() {
        let factory = TestFactory { refuse: Some("infer") };
        let err = build(&file_config(), &factory).unwrap_err();
        match err {
            PipelineError::Build { stage, reason } => {
                assert_eq!(stage, "primary-inference");
                assert!(reason.contains("infer"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_probe_installed_on_osd_input() {
        let pipeline = build(&file_config(), &FACTORY).unwrap();
        let graph = pipeline.graph();
        let osd = graph.stage_by_name(PROBED_STAGE).unwrap();

        let before = pipeline.health().frames_processed();
        let mut buffer = Buffer::default();
        graph.run_probes(&PortRef::new(osd, "sink"), &mut buffer);
        assert_eq!(pipeline.health().frames_processed(), before + 1);
        assert_eq!(pipeline.health().frames_without_meta(), 1);
    }

    #[test]
    fn test_deferred_link_rejects_second_video_port() {
        let pipeline = build(&file_config(), &FACTORY).unwrap();
        let graph = pipeline.graph();
        let decoder = graph.stage_by_name("decoder").unwrap();
        let bin = graph.bin_by_name(PROCESS_BIN).unwrap();

        let video = Caps::raw_video();
        graph.link_to_ghost(&PortRef::new(decoder, "src_0"), &video, bin).unwrap();
        assert!(matches!(
            graph.link_to_ghost(&PortRef::new(decoder, "src_1"), &video, bin),
            Err(LinkError::AlreadyLinked(_))
        ));
    }
}
