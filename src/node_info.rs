use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::node_id::NodeId;
use crate::reassembler::ReassembledMessage;
use crate::resequencer::Resequencer;
use crate::segmenter::Segmenter;

/// Everything the processor knows about one peer: its identity, the protocol version negotiated
///  with it, and the messages in flight in both directions
pub struct NodeInfo {
    pub node_id: NodeId,
    /// the id the node announced in its most recent `Hello` or `Pong`
    pub announced_id: NodeId,
    pub endpoint: SocketAddr,
    pub protocol_version: u8,
    pub last_segment_received_time: Instant,

    /// outbound messages by message id - flushed in message id order
    pub segmenters: BTreeMap<i32, Segmenter>,
    /// inbound messages by message id
    pub reassemblers: FxHashMap<i32, ReassembledMessage>,
    pub resequencer: Resequencer,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, endpoint: SocketAddr, protocol_version: u8, now: Instant, resequencer_window: u64) -> NodeInfo {
        NodeInfo {
            node_id,
            announced_id: node_id,
            endpoint,
            protocol_version,
            last_segment_received_time: now,
            segmenters: BTreeMap::new(),
            reassemblers: FxHashMap::default(),
            resequencer: Resequencer::new(resequencer_window),
        }
    }

    /// Moves the node to a new id, e.g. because the peer restarted at the same endpoint and its
    ///  message ids and sequence numbers start over. All message state is discarded.
    pub fn reset(&mut self, new_node_id: NodeId) {
        debug!("resetting node {:?} at {:?} as {:?}", self.node_id, self.endpoint, new_node_id);

        self.node_id = new_node_id;
        self.announced_id = new_node_id;
        self.discard_message_state();
    }

    /// Records the id a node announced about itself. A different id than before means the peer
    ///  restarted, so all message state is discarded. Returns `true` in that case.
    ///
    /// The node keeps its `node_id`, which is the id its segments carry.
    pub fn adopt_announced_id(&mut self, announced_id: NodeId) -> bool {
        if announced_id == self.announced_id {
            return false;
        }
        debug!("node {:?} at {:?} changed its announced id from {:?} to {:?}", self.node_id, self.endpoint, self.announced_id, announced_id);

        self.announced_id = announced_id;
        self.discard_message_state();
        true
    }

    /// NB: Outbound messages are discarded as well: the peer lost their partially received
    ///      segments, and acknowledged segments would never be re-sent
    fn discard_message_state(&mut self) {
        debug!("discarding {} outbound and {} inbound messages for {:?}", self.segmenters.len(), self.reassemblers.len(), self.node_id);

        self.segmenters.clear();
        self.reassemblers.clear();
        self.resequencer.reset();
    }

    pub fn is_dead(&self, now: Instant, dead_interval: Duration) -> bool {
        now.saturating_duration_since(self.last_segment_received_time) > dead_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use std::sync::Arc;
    use crate::segment::MessageFlags;
    use crate::serialized_message::SerializedMessage;

    fn endpoint() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[test]
    fn test_reset() {
        let now = Instant::now();
        let mut node = NodeInfo::new(NodeId::from_u128(1), endpoint(), 12, now, 16);

        node.segmenters.insert(1, Segmenter::new(Arc::new(SerializedMessage::new(MessageFlags::RELIABLE, 0, 12)), 1024, Duration::from_millis(100)));
        node.reassemblers.insert(5, ReassembledMessage::new(12, 10, 1, MessageFlags::RELIABLE, 0, now));
        node.resequencer.offer(1, Bytes::from_static(b"a"));
        node.resequencer.offer(3, Bytes::from_static(b"c"));

        node.reset(NodeId::from_u128(2));

        assert_eq!(node.node_id, NodeId::from_u128(2));
        assert_eq!(node.announced_id, NodeId::from_u128(2));
        assert_eq!(node.endpoint, endpoint());
        assert_eq!(node.protocol_version, 12);
        assert!(node.segmenters.is_empty());
        assert!(node.reassemblers.is_empty());
        assert_eq!(node.resequencer.next_expected_sequence(), 1);
        assert_eq!(node.resequencer.num_buffered(), 0);
    }

    #[test]
    fn test_adopt_announced_id() {
        let now = Instant::now();
        let mut node = NodeInfo::new(NodeId::from_u128(1), endpoint(), 12, now, 16);
        node.reassemblers.insert(5, ReassembledMessage::new(12, 10, 1, MessageFlags::RELIABLE, 0, now));

        assert!(!node.adopt_announced_id(NodeId::from_u128(1)));
        assert_eq!(node.reassemblers.len(), 1);

        assert!(node.adopt_announced_id(NodeId::from_u128(3)));
        assert_eq!(node.node_id, NodeId::from_u128(1));
        assert_eq!(node.announced_id, NodeId::from_u128(3));
        assert!(node.reassemblers.is_empty());

        // repeating the announcement is no news
        node.reassemblers.insert(6, ReassembledMessage::new(12, 10, 1, MessageFlags::RELIABLE, 0, now));
        assert!(!node.adopt_announced_id(NodeId::from_u128(3)));
        assert_eq!(node.reassemblers.len(), 1);
    }

    #[rstest]
    #[case::fresh(4, false)]
    #[case::exactly_at_limit(5, false)]
    #[case::dead(6, true)]
    fn test_is_dead(#[case] age_secs: u64, #[case] expected: bool) {
        let start = Instant::now();
        let node = NodeInfo::new(NodeId::from_u128(1), endpoint(), 12, start, 16);
        assert_eq!(node.is_dead(start + Duration::from_secs(age_secs), Duration::from_secs(5)), expected);
    }
}
