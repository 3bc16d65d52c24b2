use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::node_id::NodeId;
use crate::processor::handle::OutboundRequest;
use crate::processor::MessageProcessor;
use crate::segmenter::Segmenter;
use crate::serialized_message::SerializedMessage;

impl MessageProcessor {
    /// Registers a segmenter for every recipient. The message is serialized once per protocol
    ///  version in use among the recipients, and all recipients with the same version share
    ///  the serialized bytes.
    pub(super) fn on_outbound_request(&mut self, request: OutboundRequest) {
        let is_broadcast = request.recipients.is_empty();

        let mut groups: BTreeMap<u8, Vec<NodeId>> = BTreeMap::new();
        if is_broadcast {
            for node in self.nodes.values() {
                groups.entry(node.protocol_version).or_default().push(node.node_id);
            }
        }
        else {
            for node_id in &request.recipients {
                match self.nodes.get(node_id) {
                    Some(node) => groups.entry(node.protocol_version).or_default().push(*node_id),
                    None => debug!("recipient {:?} is not a known node - skipping", node_id),
                }
            }
        }

        // unknown static peers get the message in this node's preferred protocol version
        let static_endpoints = if is_broadcast {
            self.unknown_static_endpoints()
        }
        else {
            Vec::new()
        };
        let static_version = self.config.max_supported_protocol_version();
        if !static_endpoints.is_empty() {
            groups.entry(static_version).or_default();
        }

        if groups.is_empty() {
            debug!("outbound message has no recipients - discarding");
            return;
        }

        let message_id = self.next_message_id();
        debug!("enqueueing message #{} for {} protocol version(s)", message_id, groups.len());

        for (protocol_version, node_ids) in groups {
            let serialized = Arc::new(SerializedMessage::new(request.message.flags(), request.message.sequence(), protocol_version));
            self.serialization.dispatch(request.message.clone(), serialized.clone());

            for node_id in node_ids {
                let segmenter = self.new_segmenter(&serialized);
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.segmenters.insert(message_id, segmenter);
                }
            }

            if protocol_version == static_version {
                for endpoint in &static_endpoints {
                    let segmenter = self.new_segmenter(&serialized);
                    self.static_segmenters.entry(*endpoint).or_default()
                        .insert(message_id, segmenter);
                }
            }
        }
    }

    fn new_segmenter(&self, serialized: &Arc<SerializedMessage>) -> Segmenter {
        Segmenter::new(serialized.clone(), self.config.segment_size, self.config.send_interval)
    }

    /// Static endpoints that do not belong to a known node
    fn unknown_static_endpoints(&self) -> Vec<SocketAddr> {
        self.config.static_endpoints.iter()
            .filter(|endpoint| !self.node_ids_by_endpoint.contains_key(*endpoint))
            .copied()
            .collect()
    }
}
