//! Streaming thread: pulls buffers from the source and pushes them downstream
//!
//! Each buffer is carried synchronously through every linked stage before the
//! next one is pulled, so frame order is preserved end to end. Runtime
//! failures are posted on the bus and stop the thread; they never unwind into
//! the controlling loop.

use log::{debug, info, trace};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::bus::{Bus, BusMessage};
use super::deferred::LinkDecision;
use super::graph::{PortRef, ProbeReturn, StageGraph, StageId};
use super::stage::{Direction, Emitter, FlowError};
use super::types::Buffer;

/// A stage failed while handling data
#[derive(Debug)]
struct StageFailure {
    stage: StageId,
    error: FlowError,
}

type Flow = Result<(), StageFailure>;

fn failed_at(stage: StageId) -> impl FnOnce(FlowError) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// Drives data through a shared stage graph
pub(crate) struct StreamingEngine {
    graph: Arc<StageGraph>,
    bus: Bus,
    /// Ports announced at runtime, per stage
    announced: HashMap<StageId, Vec<String>>,
}

impl StreamingEngine {
    pub(crate) fn new(graph: Arc<StageGraph>, bus: Bus) -> Self {
        Self {
            graph,
            bus,
            announced: HashMap::new(),
        }
    }

    /// Run until the source is exhausted, `eos` is requested or `cancel` fires
    ///
    /// End of stream drains every stage and posts [`BusMessage::EndOfStream`].
    /// Cancellation stops without draining or posting anything.
    pub(crate) fn run(mut self, source: StageId, cancel: CancellationToken, eos: CancellationToken) {
        let graph = Arc::clone(&self.graph);
        info!("Streaming from {}", graph.stage(source).name());

        let mut pulled = 0u64;
        loop {
            if cancel.is_cancelled() {
                debug!("Streaming stopped after {} buffers", pulled);
                return;
            }
            if eos.is_cancelled() {
                info!("End of stream requested");
                break;
            }

            let mut out = Emitter::new();
            let more = graph.stage(source).element().pull(&mut out);
            let more = match more {
                Ok(more) => more,
                Err(error) => return self.fail(StageFailure { stage: source, error }),
            };

            pulled += 1;
            if let Err(failure) = self.dispatch(source, out) {
                return self.fail(failure);
            }
            if !more {
                break;
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        let mut drained = HashSet::new();
        match self.finish(source, &mut drained) {
            Ok(()) => {
                debug!("Drained {} stages", drained.len());
                self.bus.post(BusMessage::EndOfStream);
            }
            Err(failure) => self.fail(failure),
        }
    }

    fn fail(&self, failure: StageFailure) {
        let origin = self.graph.stage(failure.stage).name();
        self.bus.post(BusMessage::from_flow(origin, &failure.error));
    }

    /// Handle what a stage emitted: resolve announced ports, then forward buffers
    fn dispatch(&mut self, stage: StageId, out: Emitter) -> Flow {
        let graph = Arc::clone(&self.graph);

        for announcement in &out.announced {
            self.announced
                .entry(stage)
                .or_default()
                .push(announcement.port.clone());

            for link in graph.deferred_links_for(stage) {
                match link.on_pad_added(&graph, announcement) {
                    Ok(LinkDecision::Linked) | Ok(LinkDecision::AlreadyLinked) => {}
                    Ok(LinkDecision::Ignored(kind)) => {
                        debug!("Leaving {} port {} unlinked", kind, announcement.port)
                    }
                    Err(err) => {
                        return Err(StageFailure {
                            stage,
                            error: FlowError::failed(
                                format!(
                                    "failed to link {}:{} to {}",
                                    graph.stage(stage).name(),
                                    announcement.port,
                                    graph.bin(link.bin()).name()
                                ),
                                Some(err.to_string()),
                            ),
                        });
                    }
                }
            }
        }

        for (port, buffer) in out.pushed {
            self.push(PortRef::new(stage, port), buffer)?;
        }
        Ok(())
    }

    /// Deliver a buffer pushed on `src` to its peer
    fn push(&mut self, src: PortRef, mut buffer: Buffer) -> Flow {
        let graph = Arc::clone(&self.graph);

        let Some(sink) = graph.peer_of(&src) else {
            if self.tolerates_unlinked(&src) {
                trace!("Discarding buffer on unlinked {}", graph.describe(&src));
                return Ok(());
            }
            return Err(StageFailure {
                stage: src.stage,
                error: FlowError::NotLinked(graph.describe(&src)),
            });
        };

        if graph.run_probes(sink, &mut buffer) == ProbeReturn::Drop {
            trace!("Probe dropped buffer at {}", graph.describe(sink));
            return Ok(());
        }

        let mut out = Emitter::new();
        graph
            .stage(sink.stage)
            .element()
            .chain(&sink.port, buffer, &mut out)
            .map_err(failed_at(sink.stage))?;

        self.dispatch(sink.stage, out)
    }

    /// Runtime ports left unlinked are fine as long as a sibling port of the
    /// same stage carries the stream (e.g. the audio track of a decoder whose
    /// video track is linked)
    fn tolerates_unlinked(&self, src: &PortRef) -> bool {
        let Some(ports) = self.announced.get(&src.stage) else {
            return false;
        };
        ports.contains(&src.port)
            && ports.iter().any(|port| {
                *port != src.port && self.graph.peer_of(&PortRef::new(src.stage, port.clone())).is_some()
            })
    }

    /// Drain `stage` and then everything downstream of it
    fn finish(&mut self, stage: StageId, drained: &mut HashSet<StageId>) -> Flow {
        if !drained.insert(stage) {
            return Ok(());
        }
        let graph = Arc::clone(&self.graph);

        let mut out = Emitter::new();
        graph
            .stage(stage)
            .element()
            .drain(&mut out)
            .map_err(failed_at(stage))?;
        self.dispatch(stage, out)?;

        let mut ports: Vec<String> = graph
            .stage(stage)
            .ports()
            .iter()
            .filter(|port| port.direction == Direction::Src)
            .map(|port| port.name.clone())
            .collect();
        if let Some(announced) = self.announced.get(&stage) {
            ports.extend(announced.iter().cloned());
        }

        for port in ports {
            if let Some(peer) = graph.peer_of(&PortRef::new(stage, port)) {
                self.finish(peer.stage, drained)?;
            }
        }
        Ok(())
    }
}
