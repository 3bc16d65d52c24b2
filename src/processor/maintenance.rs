use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::MessagingConfig;
use crate::node_id::NodeId;
use crate::processor::MessageProcessor;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::segment::protocol_version::PROTOCOL_VERSION_ACKNOWLEDGE_SEGMENTS;
use crate::segment::{encode_segment, AcknowledgeSegmentsChunk, DataChunk, SegmentHeader, SegmentType};
use crate::segmenter::Segmenter;
use crate::send_socket::SegmentSender;

impl MessageProcessor {
    /// Sends pending segments of all outbound messages, for known nodes as well as for static
    ///  endpoints that are not known as nodes yet
    pub(super) fn update_segmenters(&mut self, now: Instant) {
        let send_socket = self.send_socket.as_ref();
        let config = self.config.as_ref();

        for node in self.nodes.values_mut() {
            flush_segmenters(send_socket, config, node.node_id, node.endpoint, &mut node.segmenters, now, false);
        }

        for (endpoint, segmenters) in self.static_segmenters.iter_mut() {
            flush_segmenters(send_socket, config, NodeId::BROADCAST, *endpoint, segmenters, now, true);
        }
        self.static_segmenters.retain(|_, segmenters| !segmenters.is_empty());
    }

    /// Sends one batch of segment acknowledgments per inbound message, and discards stale
    ///  inbound messages
    pub(super) fn update_reassemblers(&mut self, now: Instant) {
        let send_socket = self.send_socket.as_ref();
        let local_node_id = self.config.local_node_id;
        let max_acknowledgments = self.config.max_acknowledgments_per_segment();
        let stale_interval = self.config.stale_interval;

        for node in self.nodes.values_mut() {
            // this segment type does not exist before protocol version 11
            let protocol_version = node.protocol_version.max(PROTOCOL_VERSION_ACKNOWLEDGE_SEGMENTS);
            let header = SegmentHeader {
                protocol_version,
                recipient_id: node.node_id,
                sender_id: local_node_id,
                segment_type: SegmentType::AcknowledgeSegments,
            };
            let endpoint = node.endpoint;

            for (&message_id, reassembler) in node.reassemblers.iter_mut() {
                if !reassembler.has_pending_acknowledgments() {
                    continue;
                }

                let chunk = AcknowledgeSegmentsChunk {
                    message_id,
                    segment_indices: reassembler.get_pending_acknowledgments(max_acknowledgments),
                };
                trace!("acknowledging segments {:?} of message #{} to {:?}", chunk.segment_indices, message_id, node.node_id);
                let buf = encode_segment(&header, |b| chunk.ser(b, protocol_version));
                if let Err(e) = send_socket.send_segment(endpoint, &buf) {
                    debug!("error sending acknowledgment to {:?}: {}", endpoint, e);
                }
            }

            let num_before = node.reassemblers.len();
            node.reassemblers.retain(|_, reassembler| !reassembler.is_stale(now, stale_interval));
            if node.reassemblers.len() < num_before {
                debug!("discarded {} stale inbound messages from {:?}", num_before - node.reassemblers.len(), node.node_id);
            }
        }
    }

    /// A node is dead if nothing was received from it for a number of beacon intervals
    pub(super) fn remove_dead_nodes(&mut self, now: Instant) {
        let dead_interval = self.beacon.beacon_interval()
            .saturating_mul(self.config.dead_beacon_intervals);

        let dead_nodes = self.nodes.values()
            .filter(|node| node.is_dead(now, dead_interval))
            .map(|node| node.node_id)
            .collect::<Vec<_>>();

        for node_id in dead_nodes {
            info!("nothing received from node {:?} for {:?} - considering it dead", node_id, dead_interval);
            self.remove_node(node_id);
        }
    }
}

/// Sends all pending segments of those messages that are due.
///
/// Unreliable messages are discarded after they were sent, reliable messages wait for
///  acknowledgment. For `best_effort` recipients, all messages are sent only once.
///
/// A failed send operation ends the flush for this recipient, leaving the remaining messages
///  for the next pass.
fn flush_segmenters(
    send_socket: &dyn SegmentSender,
    config: &MessagingConfig,
    recipient_id: NodeId,
    endpoint: SocketAddr,
    segmenters: &mut BTreeMap<i32, Segmenter>,
    now: Instant,
    best_effort: bool,
) {
    let mut done = Vec::new();

    for (&message_id, segmenter) in segmenters.iter_mut() {
        segmenter.initialize(config.max_message_size_for(segmenter.protocol_version()));

        if segmenter.is_invalid() {
            warn!("message #{} for {:?} failed to serialize or exceeds the size limit - discarding", message_id, recipient_id);
            done.push(message_id);
            continue;
        }
        if !segmenter.is_initialized() {
            trace!("message #{} is not serialized yet", message_id);
            continue;
        }
        if !segmenter.needs_sending(now) {
            continue;
        }

        // NB: the header's protocol version is the one the message was serialized for, even if
        //      the version negotiated with the node changed in the meantime
        let header = SegmentHeader {
            protocol_version: segmenter.protocol_version(),
            recipient_id,
            sender_id: config.local_node_id,
            segment_type: SegmentType::Data,
        };

        match send_pending_segments(send_socket, &header, endpoint, message_id, segmenter) {
            Ok(()) => {
                if best_effort || !segmenter.is_reliable() {
                    done.push(message_id);
                }
                else {
                    segmenter.mark_sent(now);
                }
            }
            Err(e) => {
                debug!("error sending message #{} to {:?}: {} - retrying later", message_id, endpoint, e);
                if best_effort {
                    done.push(message_id);
                }
                break;
            }
        }
    }

    for message_id in done {
        segmenters.remove(&message_id);
    }
}

fn send_pending_segments(send_socket: &dyn SegmentSender, header: &SegmentHeader, endpoint: SocketAddr, message_id: i32, segmenter: &Segmenter) -> anyhow::Result<()> {
    let protocol_version = header.protocol_version;
    assert_eq!(protocol_version, segmenter.protocol_version());

    let message_total_size: i64 = segmenter.message_len().prechecked_cast();
    let segment_size: u64 = segmenter.segment_size().safe_cast();

    for segment_index in segmenter.pending_indices() {
        let Some(payload) = segmenter.get_pending_segment(segment_index) else {
            continue;
        };

        let chunk = DataChunk {
            message_id,
            message_total_size,
            message_flags: segmenter.flags(),
            segment_index,
            segment_byte_offset: u64::from(segment_index) * segment_size,
            total_segment_count: segmenter.total_segments(),
            sequence: segmenter.sequence(),
            payload,
        };

        trace!("sending segment #{} of message #{} to {:?}", segment_index, message_id, endpoint);
        let buf = encode_segment(header, |b| chunk.ser(b, protocol_version));
        send_socket.send_segment(endpoint, &buf)?;
    }
    Ok(())
}
