//! Stage graph: stages, bins, ports and the links between them
//!
//! The graph is built single-threaded and then shared with the streaming
//! thread. After that point the only link that may still be made is the one
//! into a bin's ghost port, which is how a decoder's runtime-discovered output
//! gets connected. The ghost port peer is a write-once cell so that link
//! happens at most once no matter how many times it is attempted.

use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

use super::deferred::DeferredLink;
use super::stage::{Direction, Element, ElementFactory, Presence, StageKind};
use super::types::{Buffer, Caps};
use crate::error::{LinkError, PipelineError};

/// Index of a stage in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(usize);

/// Index of a bin in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinId(usize);

/// Container a stage or bin belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    Top,
    Bin(BinId),
}

/// A named port of a stage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    pub stage: StageId,
    pub port: String,
}

impl PortRef {
    pub fn new(stage: StageId, port: impl Into<String>) -> Self {
        Self {
            stage,
            port: port.into(),
        }
    }
}

/// What a probe wants done with the buffer it inspected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReturn {
    /// Forward the buffer to the stage
    Continue,
    /// Discard the buffer
    Drop,
}

/// Callback run on every buffer entering a port
///
/// Runs synchronously on the streaming thread and must not block.
pub trait PadProbe: Send + Sync {
    fn on_buffer(&self, buffer: &mut Buffer) -> ProbeReturn;
}

impl<F> PadProbe for F
where
    F: Fn(&mut Buffer) -> ProbeReturn + Send + Sync,
{
    fn on_buffer(&self, buffer: &mut Buffer) -> ProbeReturn {
        self(buffer)
    }
}

/// Port instance of a stage
#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub direction: Direction,
    pub caps: Caps,
}

/// A named processing node
pub struct Stage {
    name: String,
    kind: StageKind,
    parent: Parent,
    ports: Vec<Port>,
    element: Mutex<Box<dyn Element>>,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn parent(&self) -> Parent {
        self.parent
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Lock the element for a call into it
    ///
    /// A panic inside an element poisons the lock; the element is still handed
    /// out so teardown can release it.
    pub fn element(&self) -> MutexGuard<'_, Box<dyn Element>> {
        self.element
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a runtime-announced port name fits one of the sometimes templates
    pub fn accepts_sometimes_port(&self, name: &str) -> bool {
        self.kind
            .templates()
            .iter()
            .any(|t| t.presence == Presence::Sometimes && t.direction == Direction::Src && t.matches(name))
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind.factory_name())
            .field("parent", &self.parent)
            .field("ports", &self.ports)
            .finish()
    }
}

/// Sub-graph exposed through a single ghost port
#[derive(Debug)]
pub struct Bin {
    name: String,
    parent: Parent,
    ghost: Option<GhostPort>,
}

impl Bin {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ghost(&self) -> Option<&GhostPort> {
        self.ghost.as_ref()
    }
}

/// External port of a bin forwarding to a sink port inside it
#[derive(Debug)]
pub struct GhostPort {
    pub name: String,
    pub target: PortRef,
    peer: OnceLock<PortRef>,
}

impl GhostPort {
    pub fn is_linked(&self) -> bool {
        self.peer.get().is_some()
    }

    pub fn peer(&self) -> Option<&PortRef> {
        self.peer.get()
    }
}

/// Where a source port delivers its buffers
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Port(PortRef),
    Ghost(BinId),
}

/// Top-level container of stages and bins
pub struct StageGraph {
    name: String,
    stages: Vec<Stage>,
    bins: Vec<Bin>,
    links: HashMap<PortRef, Endpoint>,
    linked_sinks: HashSet<PortRef>,
    deferred: Vec<DeferredLink>,
    probes: RwLock<HashMap<PortRef, Vec<Arc<dyn PadProbe>>>>,
}

impl StageGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            bins: Vec::new(),
            links: HashMap::new(),
            linked_sinks: HashSet::new(),
            deferred: Vec::new(),
            probes: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn name_taken(&self, name: &str) -> bool {
        name == self.name
            || self.stages.iter().any(|s| s.name == name)
            || self.bins.iter().any(|b| b.name == name)
    }

    /// Add an empty bin
    pub fn add_bin(&mut self, name: &str, parent: Parent) -> Result<BinId, PipelineError> {
        if self.name_taken(name) {
            return Err(PipelineError::build(name, "name already used in this pipeline"));
        }
        self.bins.push(Bin {
            name: name.to_string(),
            parent,
            ghost: None,
        });
        debug!("Created bin {}", name);
        Ok(BinId(self.bins.len() - 1))
    }

    /// Create a stage through the factory and add it to `parent`
    pub fn add_stage(
        &mut self,
        name: &str,
        kind: StageKind,
        parent: Parent,
        factory: &dyn ElementFactory,
    ) -> Result<StageId, PipelineError> {
        if self.name_taken(name) {
            return Err(PipelineError::build(name, "name already used in this pipeline"));
        }
        if let Parent::Bin(bin) = parent {
            if bin.0 >= self.bins.len() {
                return Err(PipelineError::build(name, "parent bin does not exist"));
            }
        }

        let element = factory
            .make(&kind, name)
            .map_err(|reason| PipelineError::build(name, format!("{} ({})", reason, kind.factory_name())))?;

        let ports = kind
            .templates()
            .into_iter()
            .filter(|t| t.presence == Presence::Always)
            .map(|t| Port {
                name: t.name.to_string(),
                direction: t.direction,
                caps: t.caps,
            })
            .collect();

        debug!("Created stage {} ({})", name, kind.factory_name());
        self.stages.push(Stage {
            name: name.to_string(),
            kind,
            parent,
            ports,
            element: Mutex::new(element),
        });
        Ok(StageId(self.stages.len() - 1))
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0]
    }

    pub fn stages(&self) -> impl Iterator<Item = (StageId, &Stage)> {
        self.stages.iter().enumerate().map(|(i, s)| (StageId(i), s))
    }

    pub fn stage_by_name(&self, name: &str) -> Option<StageId> {
        self.stages.iter().position(|s| s.name == name).map(StageId)
    }

    pub fn bin(&self, id: BinId) -> &Bin {
        &self.bins[id.0]
    }

    #[cfg(test)]
    pub fn bin_by_name(&self, name: &str) -> Option<BinId> {
        self.bins.iter().position(|b| b.name == name).map(BinId)
    }

    fn stage_checked(&self, id: StageId) -> Result<&Stage, LinkError> {
        self.stages
            .get(id.0)
            .ok_or_else(|| LinkError::UnknownStage(format!("#{}", id.0)))
    }

    fn port_checked(&self, port: &PortRef, direction: Direction) -> Result<&Port, LinkError> {
        let stage = self.stage_checked(port.stage)?;
        let found = stage.port(&port.port).ok_or_else(|| LinkError::UnknownPort {
            stage: stage.name.clone(),
            port: port.port.clone(),
        })?;
        if found.direction != direction {
            return Err(LinkError::WrongDirection {
                stage: stage.name.clone(),
                port: port.port.clone(),
            });
        }
        Ok(found)
    }

    /// Human readable `stage:port`
    pub fn describe(&self, port: &PortRef) -> String {
        match self.stages.get(port.stage.0) {
            Some(stage) => format!("{}:{}", stage.name, port.port),
            None => format!("#{}:{}", port.stage.0, port.port),
        }
    }

    /// Obtain a request port (e.g. `sink_0` of the muxer)
    pub fn request_port(&mut self, stage: StageId, name: &str) -> Result<PortRef, LinkError> {
        let target = self.stage_checked(stage)?;
        if target.port(name).is_some() {
            return Err(LinkError::AlreadyLinked(format!("{}:{}", target.name, name)));
        }

        let template = target
            .kind
            .templates()
            .into_iter()
            .find(|t| t.presence == Presence::Request && t.matches(name))
            .ok_or_else(|| LinkError::UnknownPort {
                stage: target.name.clone(),
                port: name.to_string(),
            })?;

        self.stages[stage.0].ports.push(Port {
            name: name.to_string(),
            direction: template.direction,
            caps: template.caps,
        });
        Ok(PortRef::new(stage, name))
    }

    fn src_is_free(&self, src: &PortRef) -> Result<(), LinkError> {
        let from_ghost = self
            .bins
            .iter()
            .any(|b| b.ghost.as_ref().and_then(|g| g.peer.get()) == Some(src));
        if self.links.contains_key(src) || from_ghost {
            return Err(LinkError::AlreadyLinked(self.describe(src)));
        }
        Ok(())
    }

    /// Link a source port to a sink port of a stage in the same container
    pub fn link_ports(&mut self, src: &PortRef, sink: &PortRef) -> Result<(), LinkError> {
        let produced = self.port_checked(src, Direction::Src)?.caps.clone();
        let accepted = self.port_checked(sink, Direction::Sink)?.caps.clone();

        let (from, to) = (self.describe(src), self.describe(sink));
        if self.stage(src.stage).parent != self.stage(sink.stage).parent {
            return Err(LinkError::WrongHierarchy { from, to });
        }
        self.src_is_free(src)?;
        if self.linked_sinks.contains(sink) {
            return Err(LinkError::AlreadyLinked(to));
        }
        if !produced.can_intersect(&accepted) {
            return Err(LinkError::IncompatibleCaps {
                from,
                to,
                produced: produced.to_string(),
                accepted: accepted.to_string(),
            });
        }

        debug!("Linked {} -> {}", from, to);
        self.links.insert(src.clone(), Endpoint::Port(sink.clone()));
        self.linked_sinks.insert(sink.clone());
        Ok(())
    }

    /// Link the `src` port of one stage to the `sink` port of the next
    pub fn link(&mut self, src: StageId, sink: StageId) -> Result<(), PipelineError> {
        let from = PortRef::new(src, "src");
        let to = PortRef::new(sink, "sink");
        self.link_ports(&from, &to).map_err(|e| {
            PipelineError::link(self.describe(&from), self.describe(&to), e)
        })
    }

    /// Link stages in declaration order, stopping at the first failure
    pub fn link_many(&mut self, chain: &[StageId]) -> Result<(), PipelineError> {
        for pair in chain.windows(2) {
            self.link(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Expose a sink port of a stage inside `bin` as the bin's ghost port
    pub fn add_ghost_port(&mut self, bin: BinId, name: &str, target: PortRef) -> Result<(), LinkError> {
        self.port_checked(&target, Direction::Sink)?;
        let bin_name = self.bins[bin.0].name.clone();
        if self.stage(target.stage).parent != Parent::Bin(bin) {
            return Err(LinkError::WrongHierarchy {
                from: bin_name,
                to: self.describe(&target),
            });
        }
        if self.bins[bin.0].ghost.is_some() || self.linked_sinks.contains(&target) {
            return Err(LinkError::AlreadyLinked(self.describe(&target)));
        }

        self.linked_sinks.insert(target.clone());
        self.bins[bin.0].ghost = Some(GhostPort {
            name: name.to_string(),
            target,
            peer: OnceLock::new(),
        });
        Ok(())
    }

    /// Link a source port to a bin's ghost port
    ///
    /// `produced` is what the source port carries. For ports announced at
    /// runtime it comes from the announcement, since such ports are not part
    /// of the built graph. This is the only link allowed once the graph is
    /// shared with the streaming thread.
    pub fn link_to_ghost(&self, src: &PortRef, produced: &Caps, bin: BinId) -> Result<(), LinkError> {
        let stage = self.stage_checked(src.stage)?;
        match stage.port(&src.port) {
            Some(port) if port.direction != Direction::Src => {
                return Err(LinkError::WrongDirection {
                    stage: stage.name.clone(),
                    port: src.port.clone(),
                });
            }
            Some(_) => {}
            None if stage.accepts_sometimes_port(&src.port) => {}
            None => {
                return Err(LinkError::UnknownPort {
                    stage: stage.name.clone(),
                    port: src.port.clone(),
                });
            }
        }

        let target_bin = &self.bins[bin.0];
        let ghost = target_bin
            .ghost
            .as_ref()
            .ok_or_else(|| LinkError::NoGhostPort(target_bin.name.clone()))?;
        let from = self.describe(src);
        let to = format!("{}:{}", target_bin.name, ghost.name);

        if stage.parent != target_bin.parent {
            return Err(LinkError::WrongHierarchy { from, to });
        }
        self.src_is_free(src)?;

        let accepted = &self.port_checked(&ghost.target, Direction::Sink)?.caps;
        if !produced.can_intersect(accepted) {
            return Err(LinkError::IncompatibleCaps {
                from,
                to,
                produced: produced.to_string(),
                accepted: accepted.to_string(),
            });
        }

        ghost
            .peer
            .set(src.clone())
            .map_err(|_| LinkError::AlreadyLinked(to.clone()))?;
        debug!("Linked {} -> {}", from, to);
        Ok(())
    }

    /// Static variant of [`link_to_ghost`](Self::link_to_ghost) used at build time
    pub fn link_stage_to_ghost(&mut self, src: StageId, bin: BinId) -> Result<(), PipelineError> {
        let from = PortRef::new(src, "src");
        let produced = self
            .port_checked(&from, Direction::Src)
            .map(|p| p.caps.clone())
            .map_err(|e| PipelineError::link(self.describe(&from), self.bins[bin.0].name.clone(), e))?;
        self.link_to_ghost(&from, &produced, bin)
            .map_err(|e| PipelineError::link(self.describe(&from), self.bins[bin.0].name.clone(), e))?;
        self.links.insert(from, Endpoint::Ghost(bin));
        Ok(())
    }

    pub fn ghost_is_linked(&self, bin: BinId) -> bool {
        self.bins[bin.0].ghost.as_ref().is_some_and(GhostPort::is_linked)
    }

    /// Sink port receiving what `src` pushes, ghost ports resolved
    pub fn peer_of(&self, src: &PortRef) -> Option<&PortRef> {
        match self.links.get(src) {
            Some(Endpoint::Port(sink)) => Some(sink),
            Some(Endpoint::Ghost(bin)) => self.bins[bin.0].ghost.as_ref().map(|g| &g.target),
            None => self.bins.iter().find_map(|b| {
                b.ghost
                    .as_ref()
                    .filter(|g| g.peer.get() == Some(src))
                    .map(|g| &g.target)
            }),
        }
    }

    /// Register a link to resolve once `source` announces its outputs
    pub fn add_deferred_link(&mut self, link: DeferredLink) {
        self.deferred.push(link);
    }

    pub fn deferred_links_for(&self, stage: StageId) -> impl Iterator<Item = &DeferredLink> {
        self.deferred.iter().filter(move |d| d.source() == stage)
    }

    /// Install a probe on a port
    pub fn add_probe(&self, port: &PortRef, probe: Arc<dyn PadProbe>) -> Result<(), LinkError> {
        let stage = self.stage_checked(port.stage)?;
        if stage.port(&port.port).is_none() {
            return Err(LinkError::UnknownPort {
                stage: stage.name.clone(),
                port: port.port.clone(),
            });
        }
        self.probes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(port.clone())
            .or_default()
            .push(probe);
        Ok(())
    }

    /// Run the probes of a port in installation order
    pub fn run_probes(&self, port: &PortRef, buffer: &mut Buffer) -> ProbeReturn {
        let probes = self.probes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(list) = probes.get(port) {
            for probe in list {
                if probe.on_buffer(buffer) == ProbeReturn::Drop {
                    return ProbeReturn::Drop;
                }
            }
        }
        ProbeReturn::Continue
    }
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraph")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("bins", &self.bins)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::stage::{Emitter, FlowError};
    use std::path::PathBuf;

    pub(crate) struct Passthrough;

    impl Element for Passthrough {
        fn chain(&mut self, _port: &str, buffer: Buffer, out: &mut Emitter) -> Result<(), FlowError> {
            out.push_src(buffer);
            Ok(())
        }
    }

    /// Factory whose elements forward everything, optionally refusing one kind
    pub(crate) struct TestFactory {
        pub refuse: Option<&'static str>,
    }

    impl ElementFactory for TestFactory {
        fn make(&self, kind: &StageKind, _name: &str) -> Result<Box<dyn Element>, String> {
            if self.refuse == Some(kind.factory_name()) {
                return Err("no such element".to_string());
            }
            Ok(Box::new(Passthrough))
        }
    }

    const FACTORY: TestFactory = TestFactory { refuse: None };

    #[test]
    fn test_link_chain() {
        let mut graph = StageGraph::new("test");
        let a = graph.add_stage("a", StageKind::Queue, Parent::Top, &FACTORY).unwrap();
        let b = graph.add_stage("b", StageKind::Convert, Parent::Top, &FACTORY).unwrap();
        let c = graph.add_stage("c", StageKind::Queue, Parent::Top, &FACTORY).unwrap();

        graph.link_many(&[a, b, c]).unwrap();
        assert_eq!(graph.peer_of(&PortRef::new(a, "src")), Some(&PortRef::new(b, "sink")));
        assert_eq!(graph.peer_of(&PortRef::new(b, "src")), Some(&PortRef::new(c, "sink")));
        assert_eq!(graph.peer_of(&PortRef::new(c, "src")), None);
    }

    #[test]
    fn test_ports_link_once() {
        let mut graph = StageGraph::new("test");
        let a = graph.add_stage("a", StageKind::Queue, Parent::Top, &FACTORY).unwrap();
        let b = graph.add_stage("b", StageKind::Queue, Parent::Top, &FACTORY).unwrap();
        let c = graph.add_stage("c", StageKind::Queue, Parent::Top, &FACTORY).unwrap();

        graph.link(a, b).unwrap();
        assert!(matches!(
            graph.link(a, c),
            Err(PipelineError::Link { source: LinkError::AlreadyLinked(_), .. })
        ));
        assert!(matches!(
            graph.link(c, b),
            Err(PipelineError::Link { source: LinkError::AlreadyLinked(_), .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut graph = StageGraph::new("test");
        graph.add_stage("a", StageKind::Queue, Parent::Top, &FACTORY).unwrap();
        let err = graph.add_stage("a", StageKind::Queue, Parent::Top, &FACTORY).unwrap_err();
        assert!(matches!(err, PipelineError::Build { stage, .. } if stage == "a"));
    }

    #[test]
    fn test_factory_failure_names_stage() {
        let factory = TestFactory { refuse: Some("osd") };
        let mut graph = StageGraph::new("test");
        let err = graph
            .add_stage("overlay", StageKind::OnScreenDisplay, Parent::Top, &factory)
            .unwrap_err();
        assert!(err.to_string().contains("overlay"));
        assert!(err.to_string().contains("osd"));
    }

    #[test]
    fn test_incompatible_caps() {
        let mut graph = StageGraph::new("test");
        let enc = graph
            .add_stage("enc", StageKind::Encoder { bitrate: 1 }, Parent::Top, &FACTORY)
            .unwrap();
        let osd = graph.add_stage("osd", StageKind::OnScreenDisplay, Parent::Top, &FACTORY).unwrap();

        let err = graph.link(enc, osd).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Link { source: LinkError::IncompatibleCaps { .. }, .. }
        ));
    }

    #[test]
    fn test_cross_bin_link_rejected() {
        let mut graph = StageGraph::new("test");
        let bin = graph.add_bin("bin", Parent::Top).unwrap();
        let outside = graph.add_stage("out", StageKind::Queue, Parent::Top, &FACTORY).unwrap();
        let inside = graph.add_stage("in", StageKind::Queue, Parent::Bin(bin), &FACTORY).unwrap();

        let err = graph.link(outside, inside).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Link { source: LinkError::WrongHierarchy { .. }, .. }
        ));
    }

    #[test]
    fn test_request_port_and_ghost() {
        let mut graph = StageGraph::new("test");
        let bin = graph.add_bin("bin", Parent::Top).unwrap();
        let mux = graph
            .add_stage("mux", StageKind::StreamMux(Default::default()), Parent::Bin(bin), &FACTORY)
            .unwrap();
        let src = graph.add_stage("src", StageKind::Queue, Parent::Top, &FACTORY).unwrap();

        assert!(graph.request_port(mux, "src_0").is_err());
        let pad = graph.request_port(mux, "sink_0").unwrap();
        assert!(graph.request_port(mux, "sink_0").is_err());

        graph.add_ghost_port(bin, "sink", pad.clone()).unwrap();
        assert!(!graph.ghost_is_linked(bin));

        graph.link_stage_to_ghost(src, bin).unwrap();
        assert!(graph.ghost_is_linked(bin));
        assert_eq!(graph.peer_of(&PortRef::new(src, "src")), Some(&pad));
    }

    #[test]
    fn test_runtime_ghost_link_is_once() {
        let mut graph = StageGraph::new("test");
        let bin = graph.add_bin("bin", Parent::Top).unwrap();
        let mux = graph
            .add_stage("mux", StageKind::StreamMux(Default::default()), Parent::Bin(bin), &FACTORY)
            .unwrap();
        let dec = graph.add_stage("dec", StageKind::Decoder, Parent::Top, &FACTORY).unwrap();
        let pad = graph.request_port(mux, "sink_0").unwrap();
        graph.add_ghost_port(bin, "sink", pad.clone()).unwrap();

        let video = Caps::raw_video();
        graph.link_to_ghost(&PortRef::new(dec, "src_0"), &video, bin).unwrap();
        assert!(matches!(
            graph.link_to_ghost(&PortRef::new(dec, "src_1"), &video, bin),
            Err(LinkError::AlreadyLinked(_))
        ));
        assert!(matches!(
            graph.link_to_ghost(&PortRef::new(dec, "bogus"), &video, bin),
            Err(LinkError::UnknownPort { .. })
        ));
        assert_eq!(graph.peer_of(&PortRef::new(dec, "src_0")), Some(&pad));
        assert_eq!(graph.peer_of(&PortRef::new(dec, "src_1")), None);
    }

    #[test]
    fn test_probes_run_in_order() {
        let mut graph = StageGraph::new("test");
        let sink = graph
            .add_stage("sink", StageKind::FileSink { location: PathBuf::from("x") }, Parent::Top, &FACTORY)
            .unwrap();
        let port = PortRef::new(sink, "sink");

        graph
            .add_probe(&port, Arc::new(|b: &mut Buffer| {
                b.frame_num += 1;
                ProbeReturn::Continue
            }))
            .unwrap();
        graph
            .add_probe(&port, Arc::new(|b: &mut Buffer| {
                if b.frame_num > 1 { ProbeReturn::Drop } else { ProbeReturn::Continue }
            }))
            .unwrap();
        assert!(graph.add_probe(&PortRef::new(sink, "src"), Arc::new(|_: &mut Buffer| ProbeReturn::Continue)).is_err());

        let mut buffer = Buffer::default();
        assert_eq!(graph.run_probes(&port, &mut buffer), ProbeReturn::Continue);
        assert_eq!(buffer.frame_num, 1);
        assert_eq!(graph.run_probes(&port, &mut buffer), ProbeReturn::Drop);
    }
}
