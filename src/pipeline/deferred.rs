//! Deferred link between a decoder's runtime output and a bin's ghost port
//!
//! A decoder only knows what streams its input holds once data flows, so it
//! announces its output ports from the streaming thread. The first video port
//! announced gets linked to the processing bin; everything after that is a
//! no-op.

use log::{debug, info};

use super::graph::{BinId, PortRef, StageGraph, StageId};
use super::stage::PadAnnouncement;
use super::types::MediaKind;
use crate::error::LinkError;

/// What happened to an announced port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDecision {
    /// The bin input was connected to the announced port
    Linked,
    /// The bin input was already connected, nothing done
    AlreadyLinked,
    /// Not a video port, waiting for further announcements
    Ignored(MediaKind),
}

/// Connection from a dynamically-typed source port to a bin's ghost port
#[derive(Debug, Clone)]
pub struct DeferredLink {
    source: StageId,
    bin: BinId,
}

impl DeferredLink {
    pub fn new(source: StageId, bin: BinId) -> Self {
        Self { source, bin }
    }

    /// Stage whose announcements resolve this link
    pub fn source(&self) -> StageId {
        self.source
    }

    pub fn bin(&self) -> BinId {
        self.bin
    }

    /// Handle a port announced by the source stage
    ///
    /// Safe to call any number of times: once the bin input is linked every
    /// further call reports [`LinkDecision::AlreadyLinked`].
    pub fn on_pad_added(
        &self,
        graph: &StageGraph,
        announcement: &PadAnnouncement,
    ) -> Result<LinkDecision, LinkError> {
        debug!(
            "New port {} announced by {}",
            announcement.port,
            graph.stage(self.source).name()
        );

        if graph.ghost_is_linked(self.bin) {
            debug!("{} input already linked", graph.bin(self.bin).name());
            return Ok(LinkDecision::AlreadyLinked);
        }

        match announcement.caps.kind() {
            MediaKind::Video => {}
            kind @ (MediaKind::Audio | MediaKind::Other) => {
                info!(
                    "Port caps {} do not have video, waiting",
                    announcement.caps.media_type
                );
                return Ok(LinkDecision::Ignored(kind));
            }
        }

        let src = PortRef::new(self.source, announcement.port.clone());
        match graph.link_to_ghost(&src, &announcement.caps, self.bin) {
            Ok(()) => {
                info!(
                    "Linked {} to {}",
                    graph.describe(&src),
                    graph.bin(self.bin).name()
                );
                Ok(LinkDecision::Linked)
            }
            // lost a race against another announcement
            Err(LinkError::AlreadyLinked(_)) if graph.ghost_is_linked(self.bin) => {
                Ok(LinkDecision::AlreadyLinked)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::Parent;
    use crate::pipeline::graph::tests::TestFactory;
    use crate::pipeline::stage::StageKind;
    use crate::pipeline::types::Caps;

    fn graph_with_bin() -> (StageGraph, DeferredLink) {
        let factory = TestFactory { refuse: None };
        let mut graph = StageGraph::new("test");
        let bin = graph.add_bin("bin", Parent::Top).unwrap();
        let mux = graph
            .add_stage("mux", StageKind::StreamMux(Default::default()), Parent::Bin(bin), &factory)
            .unwrap();
        let decoder = graph.add_stage("decoder", StageKind::Decoder, Parent::Top, &factory).unwrap();
        let pad = graph.request_port(mux, "sink_0").unwrap();
        graph.add_ghost_port(bin, "sink", pad).unwrap();
        (graph, DeferredLink::new(decoder, bin))
    }

    fn announce(port: &str, caps: Caps) -> PadAnnouncement {
        PadAnnouncement {
            port: port.to_string(),
            caps,
        }
    }

    #[test]
    fn test_links_first_video_port() {
        let (graph, link) = graph_with_bin();

        let decision = link.on_pad_added(&graph, &announce("src_0", Caps::raw_video())).unwrap();
        assert_eq!(decision, LinkDecision::Linked);
        assert!(graph.ghost_is_linked(link.bin()));
    }

    #[test]
    fn test_idempotent_after_link() {
        let (graph, link) = graph_with_bin();
        let video = announce("src_0", Caps::raw_video());

        assert_eq!(link.on_pad_added(&graph, &video).unwrap(), LinkDecision::Linked);
        assert_eq!(link.on_pad_added(&graph, &video).unwrap(), LinkDecision::AlreadyLinked);
        assert_eq!(
            link.on_pad_added(&graph, &announce("src_1", Caps::raw_video())).unwrap(),
            LinkDecision::AlreadyLinked
        );
        let peer = graph.bin(link.bin()).ghost().unwrap().peer().unwrap();
        assert_eq!(peer.port, "src_0");
    }

    #[test]
    fn test_non_video_ignored() {
        let (graph, link) = graph_with_bin();

        assert_eq!(
            link.on_pad_added(&graph, &announce("src_0", Caps::new("audio/x-raw"))).unwrap(),
            LinkDecision::Ignored(MediaKind::Audio)
        );
        assert_eq!(
            link.on_pad_added(&graph, &announce("src_1", Caps::new("text/x-raw"))).unwrap(),
            LinkDecision::Ignored(MediaKind::Other)
        );
        assert!(!graph.ghost_is_linked(link.bin()));

        assert_eq!(
            link.on_pad_added(&graph, &announce("src_2", Caps::raw_video())).unwrap(),
            LinkDecision::Linked
        );
    }

    #[test]
    fn test_undecodable_video_fails() {
        let (graph, link) = graph_with_bin();

        let err = link
            .on_pad_added(&graph, &announce("src_0", Caps::new("video/x-h265")))
            .unwrap_err();
        assert!(matches!(err, LinkError::IncompatibleCaps { .. }));
        assert!(!graph.ghost_is_linked(link.bin()));
    }
}
