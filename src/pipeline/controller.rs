//! Pipeline controller
//!
//! Owns the built stage graph, walks it through its lifecycle states and
//! runs the controlling loop that waits on the bus for a terminal message.

use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::{self, Bus, BusAction, BusMessage, BusReceiver, EventBus, RunOutcome};
use super::graph::{PadProbe, PortRef, StageGraph, StageId};
use super::health::{HealthSummary, PipelineHealth};
use super::state::{State, StateChange};
use super::streaming::StreamingEngine;
use crate::error::PipelineError;

/// How often the health summary is logged while playing
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// No frame reaching the probe for this long is reported as a stall
const STALL_THRESHOLD: Duration = Duration::from_secs(10);

/// Streaming thread of a playing pipeline
struct Streaming {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|reason| reason.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Wall-clock time since the pipeline reached `Playing`
    pub elapsed: Duration,
    /// Buffers seen by the frame probe
    pub frames: u64,
    pub summary: HealthSummary,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Turn a failed outcome into the runtime error it reported
    pub fn into_result(self) -> Result<RunReport, PipelineError> {
        match self.outcome {
            RunOutcome::Completed => Ok(self),
            RunOutcome::Failed {
                origin,
                message,
                debug,
            } => Err(PipelineError::Runtime {
                origin,
                message,
                debug,
            }),
        }
    }
}

/// A built pipeline
///
/// Stages are released when the pipeline returns to `Null`, which `run`
/// always does before returning. Dropping a pipeline in any other state stops
/// streaming and releases the stages as well.
pub struct Pipeline {
    name: String,
    graph: Arc<StageGraph>,
    source: StageId,
    state: State,
    bus: Bus,
    messages: BusReceiver,
    health: Arc<PipelineHealth>,
    eos: CancellationToken,
    streaming: Option<Streaming>,
}

impl Pipeline {
    pub fn new(graph: StageGraph, source: StageId, health: Arc<PipelineHealth>) -> Self {
        let (bus, messages) = bus::channel();
        Self {
            name: graph.name().to_string(),
            graph: Arc::new(graph),
            source,
            state: State::Null,
            bus,
            messages,
            health,
            eos: CancellationToken::new(),
            streaming: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Get the pipeline health metrics
    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// Cancelling the returned token ends the stream gracefully: the source
    /// stops, every stage drains and `EndOfStream` is posted
    pub fn eos_handle(&self) -> CancellationToken {
        self.eos.clone()
    }

    /// Install a probe on `stage:port`
    pub fn add_probe(&self, stage: &str, port: &str, probe: Arc<dyn PadProbe>) -> Result<(), PipelineError> {
        let id = self
            .graph
            .stage_by_name(stage)
            .ok_or_else(|| PipelineError::build(stage, "no such stage"))?;
        let target = PortRef::new(id, port);
        self.graph
            .add_probe(&target, probe)
            .map_err(|e| PipelineError::link(self.graph.describe(&target), "probe", e))
    }

    /// Move to `target` one adjacent state at a time
    ///
    /// Every completed step is posted on the bus as `StateChanged`. A failing
    /// step leaves the pipeline in the last state it reached.
    pub async fn set_state(&mut self, target: State) -> Result<(), PipelineError> {
        let steps = self.state.steps_to(target);
        let count = steps.len();

        for (index, step) in steps.into_iter().enumerate() {
            self.change_state(step).await?;
            self.state = step.to;
            self.bus.post(BusMessage::StateChanged {
                origin: self.name.clone(),
                old: step.from,
                new: step.to,
                pending: (index + 1 < count).then_some(target),
            });
        }
        Ok(())
    }

    async fn change_state(&mut self, step: StateChange) -> Result<(), PipelineError> {
        debug!("{}: {}", self.name, step);
        match (step.from, step.to) {
            (State::Null, State::Ready) => self.start_stages(step),
            (State::Paused, State::Playing) => {
                self.start_streaming();
                Ok(())
            }
            (State::Playing, State::Paused) => {
                self.stop_streaming().await;
                Ok(())
            }
            (State::Ready, State::Null) => {
                self.stop_stages();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn start_stages(&self, step: StateChange) -> Result<(), PipelineError> {
        let mut started: Vec<StageId> = Vec::new();

        for (id, stage) in self.graph.stages() {
            if let Err(reason) = stage.element().start() {
                self.bus.post(BusMessage::error(
                    stage.name(),
                    format!("failed to change state {}", step),
                    Some(reason.clone()),
                ));
                for id in started.iter().rev() {
                    self.graph.stage(*id).element().stop();
                }
                return Err(PipelineError::StateChange {
                    stage: stage.name().to_string(),
                    from: step.from,
                    to: step.to,
                    reason,
                });
            }
            started.push(id);
        }
        Ok(())
    }

    fn stop_stages(&self) {
        for (_, stage) in self.graph.stages() {
            stage.element().stop();
        }
        debug!("{}: released {} stages", self.name, self.graph.stages().count());
    }

    fn start_streaming(&mut self) {
        let cancel = CancellationToken::new();
        let engine = StreamingEngine::new(Arc::clone(&self.graph), self.bus.clone());
        let (source, stop, eos) = (self.source, cancel.clone(), self.eos.clone());
        let (bus, name) = (self.bus.clone(), self.name.clone());

        // a panic in a stage ends the run like any stage error
        let handle = tokio::task::spawn_blocking(move || {
            let run = panic::catch_unwind(AssertUnwindSafe(|| engine.run(source, stop, eos)));
            if let Err(payload) = run {
                let reason = panic_reason(payload.as_ref());
                error!("{}: streaming thread panicked: {}", name, reason);
                bus.post(BusMessage::error(name, "streaming thread panicked", Some(reason)));
            }
        });
        self.streaming = Some(Streaming { cancel, handle });
    }

    async fn stop_streaming(&mut self) {
        if let Some(streaming) = self.streaming.take() {
            streaming.cancel.cancel();
            if let Err(e) = streaming.handle.await {
                error!("Streaming thread ended abnormally: {}", e);
            }
        }
    }

    fn spawn_health_logger(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let health = Arc::clone(&self.health);
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        info!("{}: {}", name, health.summary());
                        if health.is_stalled(STALL_THRESHOLD) {
                            let since = health
                                .last_frame_at()
                                .map(|at| at.format("%H:%M:%S").to_string())
                                .unwrap_or_default();
                            warn!("{}: no frame processed since {}", name, since);
                        }
                    }
                }
            }
        });
        token
    }

    /// Play until end of stream or error, then tear down to `Null`
    ///
    /// Build and state change failures are returned as errors. A run that
    /// reached `Playing` always returns a report; a runtime error is reported
    /// through [`RunReport::outcome`].
    pub async fn run(mut self) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let mut dispatcher = EventBus::new(self.name.clone());
        let health_logger = self.spawn_health_logger();

        info!("Now playing...");
        if let Err(err) = self.set_state(State::Playing).await {
            health_logger.cancel();
            self.set_state(State::Null).await?;
            self.drain_messages(&mut dispatcher);
            return Err(err);
        }

        let outcome = loop {
            let Some(message) = self.messages.next().await else {
                break RunOutcome::Failed {
                    origin: self.name.clone(),
                    message: "bus closed".to_string(),
                    debug: None,
                };
            };
            if let BusAction::Quit(outcome) = dispatcher.dispatch(&message) {
                break outcome;
            }
        };

        health_logger.cancel();
        self.set_state(State::Null).await?;
        self.drain_messages(&mut dispatcher);

        let elapsed = dispatcher
            .elapsed()
            .or_else(|| dispatcher.playing_since().map(|since| since.elapsed()))
            .unwrap_or_else(|| started.elapsed());
        info!(
            "Returned, stopping playback, time to execute: {} ms",
            elapsed.as_millis()
        );

        Ok(RunReport {
            outcome,
            elapsed,
            frames: self.health.frames_processed(),
            summary: self.health.summary(),
        })
    }

    /// Log what is left on the bus after teardown
    fn drain_messages(&mut self, dispatcher: &mut EventBus) {
        while let Some(message) = self.messages.try_next() {
            match message {
                BusMessage::StateChanged { .. } => {
                    dispatcher.dispatch(&message);
                }
                other => debug!("{}: ignoring {:?} after teardown", self.name, other),
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(streaming) = self.streaming.take() {
            streaming.cancel.cancel();
        }
        if self.state.is_active() {
            self.stop_stages();
            self.state = State::Null;
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("graph", &self.graph)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::{Parent, ProbeReturn};
    use crate::pipeline::graph::tests::TestFactory;
    use crate::pipeline::stage::{Direction, Element, ElementFactory, Emitter, FlowError, StageKind};
    use crate::pipeline::types::Buffer;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Journal of element lifecycle calls, shared by all elements of a test
    type Journal = Arc<Mutex<Vec<String>>>;

    struct Counting {
        name: String,
        remaining: u64,
        fail_start: bool,
        fail_chain: bool,
        panic_chain: bool,
        forward: bool,
        journal: Journal,
    }

    impl Element for Counting {
        fn start(&mut self) -> Result<(), String> {
            if self.fail_start {
                return Err("resource busy".to_string());
            }
            self.journal.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        fn stop(&mut self) {
            self.journal.lock().unwrap().push(format!("stop {}", self.name));
        }

        fn pull(&mut self, out: &mut Emitter) -> Result<bool, FlowError> {
            if self.remaining == 0 {
                return Ok(false);
            }
            self.remaining -= 1;
            out.push_src(Buffer::new(vec![0u8]));
            Ok(true)
        }

        fn chain(&mut self, _port: &str, buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
            if self.fail_chain {
                return Err(FlowError::failed("write failed", None));
            }
            if self.panic_chain {
                panic!("corrupt frame in {}", self.name);
            }
            if self.forward {
                out.push_src(buffer);
            }
            Ok(())
        }
    }

    struct Factory {
        frames: u64,
        fail_start: Option<&'static str>,
        fail_chain: Option<&'static str>,
        panic_chain: Option<&'static str>,
        journal: Journal,
    }

    impl Factory {
        fn new(frames: u64) -> Self {
            Self {
                frames,
                fail_start: None,
                fail_chain: None,
                panic_chain: None,
                journal: Arc::default(),
            }
        }
    }

    impl ElementFactory for Factory {
        fn make(&self, kind: &StageKind, name: &str) -> Result<Box<dyn Element>, String> {
            Ok(Box::new(Counting {
                name: name.to_string(),
                remaining: self.frames,
                fail_start: self.fail_start == Some(name),
                fail_chain: self.fail_chain == Some(name),
                panic_chain: self.panic_chain == Some(name),
                forward: kind.templates().iter().any(|t| t.direction == Direction::Src),
                journal: self.journal.clone(),
            }))
        }
    }

    fn pipeline(factory: &dyn ElementFactory) -> Pipeline {
        let mut graph = StageGraph::new("test-pipeline");
        let src = graph
            .add_stage("src", StageKind::FileSource { location: PathBuf::from("in") }, Parent::Top, factory)
            .unwrap();
        let osd = graph.add_stage("osd", StageKind::OnScreenDisplay, Parent::Top, factory).unwrap();
        let sink = graph
            .add_stage("sink", StageKind::FileSink { location: PathBuf::from("out") }, Parent::Top, factory)
            .unwrap();
        graph.link_many(&[src, osd, sink]).unwrap();
        Pipeline::new(graph, src, Arc::new(PipelineHealth::new()))
    }

    fn counter(pipeline: &Pipeline) -> Arc<AtomicU64> {
        let seen = Arc::new(AtomicU64::new(0));
        let probe_seen = seen.clone();
        pipeline
            .add_probe(
                "osd",
                "sink",
                Arc::new(move |_: &mut Buffer| {
                    probe_seen.fetch_add(1, Ordering::SeqCst);
                    ProbeReturn::Continue
                }),
            )
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn test_eos_completes_and_releases() {
        let factory = Factory::new(5);
        let pipeline = pipeline(&factory);
        let seen = counter(&pipeline);

        let report = pipeline.run().await.unwrap();
        assert!(report.is_success());
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        let journal = factory.journal.lock().unwrap();
        assert_eq!(journal.iter().filter(|e| e.starts_with("start")).count(), 3);
        assert_eq!(journal.iter().filter(|e| e.starts_with("stop")).count(), 3);
    }

    #[tokio::test]
    async fn test_runtime_error_fails_run() {
        let mut factory = Factory::new(5);
        factory.fail_chain = Some("sink");
        let pipeline = pipeline(&factory);

        let report = pipeline.run().await.unwrap();
        assert!(!report.is_success());
        match report.clone().into_result() {
            Err(PipelineError::Runtime { origin, message, .. }) => {
                assert_eq!(origin, "sink");
                assert_eq!(message, "write failed");
            }
            other => panic!("unexpected {:?}", other.map(|r| r.outcome)),
        }
        let journal = factory.journal.lock().unwrap();
        assert_eq!(journal.iter().filter(|e| e.starts_with("stop")).count(), 3);
    }

    #[tokio::test]
    async fn test_stage_panic_fails_run() {
        let mut factory = Factory::new(5);
        factory.panic_chain = Some("osd");
        let pipeline = pipeline(&factory);

        let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run())
            .await
            .expect("run must return after a stage panic")
            .unwrap();
        match &report.outcome {
            RunOutcome::Failed { origin, message, debug } => {
                assert_eq!(origin, "test-pipeline");
                assert_eq!(message, "streaming thread panicked");
                assert_eq!(debug.as_deref(), Some("corrupt frame in osd"));
            }
            RunOutcome::Completed => panic!("a panicking stage must fail the run"),
        }
        let journal = factory.journal.lock().unwrap();
        assert_eq!(journal.iter().filter(|e| e.starts_with("stop")).count(), 3);
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        let mut factory = Factory::new(1);
        factory.fail_start = Some("osd");
        let pipeline = pipeline(&factory);

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StateChange { ref stage, from: State::Null, to: State::Ready, .. } if stage == "osd"
        ));
        assert_eq!(
            *factory.journal.lock().unwrap(),
            vec!["start src".to_string(), "stop src".to_string()]
        );
    }

    #[tokio::test]
    async fn test_state_changes_are_posted() {
        let factory = TestFactory { refuse: None };
        let mut pipeline = pipeline(&factory);

        pipeline.set_state(State::Paused).await.unwrap();
        assert_eq!(pipeline.state(), State::Paused);

        let mut changes = Vec::new();
        while let Some(message) = pipeline.messages.try_next() {
            if let BusMessage::StateChanged { old, new, pending, .. } = message {
                changes.push((old, new, pending));
            }
        }
        assert_eq!(
            changes,
            vec![
                (State::Null, State::Ready, Some(State::Paused)),
                (State::Ready, State::Paused, None),
            ]
        );

        pipeline.set_state(State::Null).await.unwrap();
        assert_eq!(pipeline.state(), State::Null);
    }

    #[tokio::test]
    async fn test_eos_handle_stops_endless_source() {
        let factory = Factory::new(u64::MAX);
        let pipeline = pipeline(&factory);
        let seen = counter(&pipeline);
        let eos = pipeline.eos_handle();

        let stopper = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while seen.load(Ordering::SeqCst) < 10 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                eos.cancel();
            })
        };

        let report = pipeline.run().await.unwrap();
        stopper.await.unwrap();
        assert!(report.is_success());
        assert!(seen.load(Ordering::SeqCst) >= 10);
    }

    #[tokio::test]
    async fn test_unknown_probe_target() {
        let factory = TestFactory { refuse: None };
        let pipeline = pipeline(&factory);
        assert!(pipeline
            .add_probe("missing", "sink", Arc::new(|_: &mut Buffer| ProbeReturn::Continue))
            .is_err());
    }
}
