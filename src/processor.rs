//! The protocol state machine: the message processor owns the table of known nodes and all
//!  message state in both directions.
//!
//! All protocol state is mutated by a single worker through [MessageProcessor::process_pass],
//!  which drains inbound segments, then outbound messages, and then does periodic per-node
//!  maintenance. The worker is either driven by [MessageProcessor::run_loop] on a tokio task, or
//!  by the host calling [MessageProcessor::tick] from its own loop.
//!
//! Everything else interacts with the processor through a [ProcessorHandle], which enqueues
//!  work and wakes the worker.

mod driver;
mod handle;
mod inbound;
mod maintenance;
mod outbound;

pub use handle::ProcessorHandle;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::beacon::DiscoveryBeacon;
use crate::config::MessagingConfig;
use crate::events::TransportEvents;
use crate::node_id::NodeId;
use crate::node_info::NodeInfo;
use crate::processor::handle::{InboundSegment, OutboundRequest, ProcessorShared};
use crate::segment::{encode_segment, SegmentHeader, SegmentType};
use crate::segmenter::Segmenter;
use crate::send_socket::SegmentSender;
use crate::serialized_message::SerializationDispatcher;

pub struct MessageProcessor {
    config: Arc<MessagingConfig>,
    send_socket: Arc<dyn SegmentSender>,
    events: Arc<dyn TransportEvents>,
    beacon: Arc<dyn DiscoveryBeacon>,
    serialization: Arc<dyn SerializationDispatcher>,

    shared: Arc<ProcessorShared>,
    inbound_queue: mpsc::UnboundedReceiver<InboundSegment>,
    outbound_queue: mpsc::UnboundedReceiver<OutboundRequest>,

    nodes: FxHashMap<NodeId, NodeInfo>,
    node_ids_by_endpoint: FxHashMap<SocketAddr, NodeId>,
    /// messages for static endpoints that are not (yet) known as nodes - they are sent once on a
    ///  best effort basis
    static_segmenters: FxHashMap<SocketAddr, BTreeMap<i32, Segmenter>>,

    next_message_id: i32,
    is_shut_down: bool,
}

impl MessageProcessor {
    pub fn new(
        config: Arc<MessagingConfig>,
        send_socket: Arc<dyn SegmentSender>,
        events: Arc<dyn TransportEvents>,
        beacon: Arc<dyn DiscoveryBeacon>,
        serialization: Arc<dyn SerializationDispatcher>,
    ) -> (MessageProcessor, ProcessorHandle) {
        let (inbound_sender, inbound_queue) = mpsc::unbounded_channel();
        let (outbound_sender, outbound_queue) = mpsc::unbounded_channel();
        let shared = Arc::new(ProcessorShared::default());

        let handle = ProcessorHandle::new(inbound_sender, outbound_sender, shared.clone());

        let processor = MessageProcessor {
            config,
            send_socket,
            events,
            beacon,
            serialization,
            shared,
            inbound_queue,
            outbound_queue,
            nodes: FxHashMap::default(),
            node_ids_by_endpoint: FxHashMap::default(),
            static_segmenters: FxHashMap::default(),
            next_message_id: 1,
            is_shut_down: false,
        };
        (processor, handle)
    }

    /// Does one pass of all pending work. This is the single place where protocol state changes,
    ///  regardless of which driver is used.
    pub fn process_pass(&mut self, now: Instant) {
        while let Ok(segment) = self.inbound_queue.try_recv() {
            self.on_inbound_segment(segment.buf, segment.from, now);
        }
        while let Ok(request) = self.outbound_queue.try_recv() {
            self.on_outbound_request(request);
        }

        self.update_segmenters(now);
        self.update_reassemblers(now);
        self.remove_dead_nodes(now);
        self.publish_known_nodes();
    }

    /// The synchronous driver for hosts running their own loop. Returns `false` once shutdown was
    ///  requested through the handle and completed.
    pub fn tick(&mut self) -> bool {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> bool {
        if self.is_shut_down {
            return false;
        }

        self.process_pass(now);

        if self.shared.is_stop_requested() {
            self.shutdown();
            return false;
        }
        true
    }

    /// Releases all nodes, notifying the application that they are lost. Idempotent.
    fn shutdown(&mut self) {
        if self.is_shut_down {
            return;
        }
        self.is_shut_down = true;

        info!("shutting down message processor with {} known nodes", self.nodes.len());
        let node_ids = self.nodes.keys().copied().collect::<Vec<_>>();
        for node_id in node_ids {
            self.remove_node(node_id);
        }
        self.static_segmenters.clear();
        self.publish_known_nodes();
    }

    pub fn local_node_id(&self) -> NodeId {
        self.config.local_node_id
    }

    pub fn num_known_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    fn remove_node(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.remove(&node_id) {
            info!("removing node {:?} at {:?}", node_id, node.endpoint);
            if self.node_ids_by_endpoint.get(&node.endpoint) == Some(&node_id) {
                self.node_ids_by_endpoint.remove(&node.endpoint);
            }
            self.events.on_node_lost(node_id);
        }
    }

    /// Moves a node's entry to a new id and forgets all its message state. This is how a peer
    ///  restart is handled: the restarted process is a different node from the application's
    ///  perspective.
    fn rekey_node(&mut self, old_id: NodeId, new_id: NodeId) {
        if old_id == new_id {
            return;
        }
        if self.nodes.contains_key(&new_id) {
            warn!("node {:?} claims to be {:?} which is known already - ignoring", old_id, new_id);
            return;
        }
        let Some(mut node) = self.nodes.remove(&old_id) else {
            return;
        };

        info!("node at {:?} restarted: {:?} -> {:?}", node.endpoint, old_id, new_id);
        node.reset(new_id);
        self.node_ids_by_endpoint.insert(node.endpoint, new_id);
        self.nodes.insert(new_id, node);

        self.events.on_node_lost(old_id);
        self.events.on_node_discovered(new_id);
    }

    fn publish_known_nodes(&self) {
        self.beacon.set_known_peer_count(self.nodes.len());

        let snapshot = self.nodes.values()
            .map(|node| (node.node_id, node.protocol_version))
            .collect();
        self.shared.publish_protocol_versions(snapshot);
    }

    fn next_message_id(&mut self) -> i32 {
        let result = self.next_message_id;
        self.next_message_id = match self.next_message_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        result
    }

    /// Sends a segment consisting of a header and a single chunk. Failures are logged, there is
    ///  no retry for control segments.
    fn send_control_segment(&self, to: SocketAddr, header: SegmentHeader, ser_chunk: impl FnOnce(&mut bytes::BytesMut)) {
        let segment_type = header.segment_type;
        let buf = encode_segment(&header, ser_chunk);
        if let Err(e) = self.send_socket.send_segment(to, &buf) {
            debug!("error sending {:?} segment to {:?}: {}", segment_type, to, e);
        }
    }

    fn header(&self, protocol_version: u8, recipient_id: NodeId, segment_type: SegmentType) -> SegmentHeader {
        SegmentHeader {
            protocol_version,
            recipient_id,
            sender_id: self.config.local_node_id,
            segment_type,
        }
    }
}
