use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, span, trace, Level};

use crate::node_id::NodeId;
use crate::node_info::NodeInfo;
use crate::processor::MessageProcessor;
use crate::reassembler::ReassembledMessage;
use crate::segmenter::Segmenter;
use crate::segment::{AbortChunk, AcknowledgeChunk, AcknowledgeSegmentsChunk, DataChunk, MessageIdChunk, NodeChunk, PingChunk, RetransmitChunk, SegmentHeader, SegmentType, TimeoutChunk, WireError};

impl MessageProcessor {
    pub(super) fn on_inbound_segment(&mut self, buf: Bytes, from: SocketAddr, now: Instant) {
        let mut buf = buf;
        let header = match SegmentHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("received unparseable segment from {:?}: {} - dropping", from, e);
                return;
            }
        };

        let _span = span!(Level::TRACE, "segment", sender=?header.sender_id, segment_type=?header.segment_type).entered();

        if header.sender_id == self.config.local_node_id {
            trace!("received own segment - dropping");
            return;
        }
        if header.sender_id.is_broadcast() {
            debug!("received segment from {:?} without a sender id - dropping", from);
            return;
        }
        if !header.recipient_id.is_broadcast() && header.recipient_id != self.config.local_node_id {
            debug!("received segment for {:?} - dropping", header.recipient_id);
            return;
        }
        if !self.config.supports_protocol_version(header.protocol_version) {
            debug!("received segment with unsupported protocol version {} - dropping", header.protocol_version);
            return;
        }

        if header.segment_type == SegmentType::Ping && !self.is_compatible_ping(&header, &buf) {
            return;
        }

        self.on_segment_from_node(&header, from, now);

        let result = match header.segment_type {
            SegmentType::Hello | SegmentType::Pong => self.on_hello_or_pong(&header, &mut buf),
            SegmentType::Ping => self.on_ping(&header, &mut buf),
            SegmentType::Bye => self.on_bye(&header, &mut buf),
            SegmentType::Data => self.on_data(&header, &mut buf, now),
            SegmentType::Abort => self.on_abort_or_acknowledge(&header, AbortChunk::deser(&mut buf)),
            SegmentType::Acknowledge => self.on_abort_or_acknowledge(&header, AcknowledgeChunk::deser(&mut buf)),
            SegmentType::AcknowledgeSegments => self.on_acknowledge_segments(&header, &mut buf),
            SegmentType::Retransmit => self.on_retransmit(&header, &mut buf),
            SegmentType::Timeout => self.on_timeout(&header, TimeoutChunk::deser(&mut buf)),
            SegmentType::None | SegmentType::Unknown(_) => {
                debug!("received segment of unsupported type {:?} - dropping", header.segment_type);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("received malformed {:?} segment from {:?}: {} - dropping", header.segment_type, from, e);
        }
    }

    /// Registers traffic from a node, discovering it if it is new. A different node id at a known
    ///  endpoint is treated as the peer having restarted.
    fn on_segment_from_node(&mut self, header: &SegmentHeader, from: SocketAddr, now: Instant) {
        let sender_id = header.sender_id;

        if let Some(&previous_id) = self.node_ids_by_endpoint.get(&from) {
            if previous_id != sender_id && !self.nodes.contains_key(&sender_id) {
                self.rekey_node(previous_id, sender_id);
            }
        }

        let node = match self.nodes.entry(sender_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                info!("discovered node {:?} at {:?}", sender_id, from);
                self.events.on_node_discovered(sender_id);
                e.insert(NodeInfo::new(sender_id, from, header.protocol_version, now, self.config.resequencer_window))
            }
        };

        if node.endpoint != from {
            debug!("node {:?} moved from {:?} to {:?}", sender_id, node.endpoint, from);
            if self.node_ids_by_endpoint.get(&node.endpoint) == Some(&sender_id) {
                self.node_ids_by_endpoint.remove(&node.endpoint);
            }
        }

        node.endpoint = from;
        node.protocol_version = header.protocol_version;
        node.last_segment_received_time = now;
        self.node_ids_by_endpoint.insert(from, sender_id);

        if let Some(static_segmenters) = self.static_segmenters.remove(&from) {
            debug!("static endpoint {:?} is node {:?} - discarding {} best-effort messages", from, sender_id, static_segmenters.len());
        }
    }

    fn on_hello_or_pong(&mut self, header: &SegmentHeader, buf: &mut Bytes) -> Result<(), WireError> {
        let chunk = NodeChunk::deser(buf)?;
        if let Some(node) = self.nodes.get_mut(&header.sender_id) {
            if node.adopt_announced_id(chunk.node_id) {
                info!("node {:?} at {:?} announced itself as {:?} - it restarted, message state was discarded", header.sender_id, node.endpoint, chunk.node_id);
            }
        }
        Ok(())
    }

    /// A node proposing a protocol version that can not be negotiated is evicted if it is known,
    ///  and not registered otherwise.
    fn is_compatible_ping(&mut self, header: &SegmentHeader, buf: &Bytes) -> bool {
        let Ok(chunk) = PingChunk::deser(&mut buf.clone()) else {
            // reported when the segment is handled
            return true;
        };
        if self.negotiate_protocol_version(chunk.protocol_version).is_some() {
            return true;
        }

        info!("node {:?} proposed protocol version {} which is not supported locally - evicting", header.sender_id, chunk.protocol_version);
        self.remove_node(header.sender_id);
        false
    }

    fn negotiate_protocol_version(&self, proposed_version: u8) -> Option<u8> {
        let negotiated_version = proposed_version.min(self.config.max_supported_protocol_version());
        self.config.supports_protocol_version(negotiated_version)
            .then_some(negotiated_version)
    }

    fn on_ping(&mut self, header: &SegmentHeader, buf: &mut Bytes) -> Result<(), WireError> {
        let chunk = PingChunk::deser(buf)?;
        let Some(negotiated_version) = self.negotiate_protocol_version(chunk.protocol_version) else {
            return Ok(());
        };

        let Some(node) = self.nodes.get_mut(&header.sender_id) else {
            return Ok(());
        };
        node.protocol_version = negotiated_version;
        let endpoint = node.endpoint;

        trace!("replying to ping from {:?} with protocol version {}", header.sender_id, negotiated_version);
        let pong = NodeChunk { node_id: self.config.local_node_id };
        self.send_control_segment(endpoint, self.header(negotiated_version, header.sender_id, SegmentType::Pong), |b| pong.ser(b));
        Ok(())
    }

    fn on_bye(&mut self, header: &SegmentHeader, buf: &mut Bytes) -> Result<(), WireError> {
        let chunk = NodeChunk::deser(buf)?;
        if chunk.node_id == header.sender_id {
            info!("node {:?} said good-bye", chunk.node_id);
            self.remove_node(chunk.node_id);
        }
        else {
            debug!("received good-bye for {:?} from {:?} - ignoring", chunk.node_id, header.sender_id);
        }
        Ok(())
    }

    fn on_data(&mut self, header: &SegmentHeader, buf: &mut Bytes, now: Instant) -> Result<(), WireError> {
        let chunk = DataChunk::deser(buf, header.protocol_version)?;
        let sender_id = header.sender_id;

        let Some(node) = self.nodes.get_mut(&sender_id) else {
            return Ok(());
        };

        if chunk.sequence != 0 && node.resequencer.is_stale(chunk.sequence) {
            debug!("message #{} with sequence number {} from {:?} was already delivered - dropping", chunk.message_id, chunk.sequence, sender_id);
            return Ok(());
        }

        let reassembler = match node.reassemblers.entry(chunk.message_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let max_message_size = self.config.max_message_size_for(header.protocol_version);
                let Some(total_size) = valid_message_size(&chunk, max_message_size, self.config.segment_size) else {
                    info!("message #{} from {:?} has {} bytes in {} segments which exceeds the limit of {} bytes or does not match the segment size of {} - aborting", chunk.message_id, sender_id, chunk.message_total_size, chunk.total_segment_count, max_message_size, self.config.segment_size);

                    let endpoint = node.endpoint;
                    let abort = AbortChunk { message_id: chunk.message_id };
                    self.send_control_segment(endpoint, self.header(header.protocol_version, sender_id, SegmentType::Abort), |b| abort.ser(b));
                    return Ok(());
                };

                trace!("starting reassembly of message #{} from {:?}: {} bytes in {} segments", chunk.message_id, sender_id, total_size, chunk.total_segment_count);
                e.insert(ReassembledMessage::new(header.protocol_version, total_size, chunk.total_segment_count, chunk.message_flags, chunk.sequence, now))
            }
        };

        reassembler.reassemble(chunk.segment_index, chunk.segment_byte_offset, &chunk.payload, now);
        if !reassembler.is_complete() {
            return Ok(());
        }

        let to_deliver = if reassembler.is_delivered() {
            trace!("message #{} from {:?} was delivered already", chunk.message_id, sender_id);
            Vec::new()
        }
        else {
            let sequence = reassembler.sequence();
            let data = reassembler.take_for_delivery();
            if sequence == 0 {
                vec![data]
            }
            else if node.resequencer.offer(sequence, data) {
                node.resequencer.drain_ready()
                    .map(|(_, data)| data)
                    .collect()
            }
            else {
                trace!("message #{} from {:?} with sequence number {} waits for its predecessors", chunk.message_id, sender_id, sequence);
                Vec::new()
            }
        };

        // NB: a complete message is acknowledged every time a segment for it arrives: the
        //      sender's segments mean it did not receive the previous acknowledgment
        let endpoint = node.endpoint;
        let ack = AcknowledgeChunk { message_id: chunk.message_id };
        self.send_control_segment(endpoint, self.header(header.protocol_version, sender_id, SegmentType::Acknowledge), |b| ack.ser(b));

        for data in to_deliver {
            self.events.on_message_reassembled(data, sender_id);
        }
        Ok(())
    }

    fn on_abort_or_acknowledge(&mut self, header: &SegmentHeader, chunk: Result<MessageIdChunk, WireError>) -> Result<(), WireError> {
        let chunk = chunk?;
        if let Some(node) = self.nodes.get_mut(&header.sender_id) {
            if node.segmenters.remove(&chunk.message_id).is_some() {
                debug!("{:?} for message #{} from {:?} - done sending", header.segment_type, chunk.message_id, header.sender_id);
            }
        }
        Ok(())
    }

    fn on_acknowledge_segments(&mut self, header: &SegmentHeader, buf: &mut Bytes) -> Result<(), WireError> {
        let chunk = AcknowledgeSegmentsChunk::deser(buf, header.protocol_version)?;
        let Some(node) = self.nodes.get_mut(&header.sender_id) else {
            return Ok(());
        };

        let is_complete = match node.segmenters.get_mut(&chunk.message_id) {
            Some(segmenter) => {
                segmenter.mark_acknowledged(&chunk.segment_indices);
                segmenter.is_complete()
            }
            None => {
                trace!("acknowledgment for unknown message #{} from {:?}", chunk.message_id, header.sender_id);
                false
            }
        };

        if is_complete {
            debug!("all segments of message #{} were acknowledged by {:?}", chunk.message_id, header.sender_id);
            node.segmenters.remove(&chunk.message_id);
        }
        Ok(())
    }

    fn on_retransmit(&mut self, header: &SegmentHeader, buf: &mut Bytes) -> Result<(), WireError> {
        let chunk = RetransmitChunk::deser(buf)?;
        if let Some(segmenter) = self.segmenter_mut(header.sender_id, chunk.message_id) {
            let indices = chunk.segment_indices.iter()
                .map(|&idx| idx as u32)
                .collect::<Vec<_>>();
            segmenter.mark_for_retransmission(&indices);
        }
        Ok(())
    }

    fn on_timeout(&mut self, header: &SegmentHeader, chunk: Result<TimeoutChunk, WireError>) -> Result<(), WireError> {
        let chunk = chunk?;
        if let Some(segmenter) = self.segmenter_mut(header.sender_id, chunk.message_id) {
            segmenter.mark_all_for_retransmission();
        }
        Ok(())
    }

    fn segmenter_mut(&mut self, node_id: NodeId, message_id: i32) -> Option<&mut Segmenter> {
        self.nodes.get_mut(&node_id)?
            .segmenters.get_mut(&message_id)
    }
}

/// The message size announced by a data chunk, if it is within `max_message_size` and the
///  announced number of segments is what splitting it into `segment_size` segments yields.
///
/// NB: All nodes use the same segment size, and an empty message is one empty segment
fn valid_message_size(chunk: &DataChunk, max_message_size: usize, segment_size: usize) -> Option<usize> {
    let total_size = usize::try_from(chunk.message_total_size).ok()?;
    if total_size > max_message_size {
        return None;
    }
    let total_segment_count = usize::try_from(chunk.total_segment_count).ok()?;
    if total_segment_count != total_size.div_ceil(segment_size).max(1) {
        return None;
    }
    Some(total_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::MessageFlags;
    use rstest::rstest;

    fn data_chunk(total_size: i64, total_segment_count: u32) -> DataChunk {
        DataChunk {
            message_id: 1,
            message_total_size: total_size,
            message_flags: MessageFlags::RELIABLE,
            segment_index: 0,
            segment_byte_offset: 0,
            total_segment_count,
            sequence: 0,
            payload: Bytes::new(),
        }
    }

    #[rstest]
    #[case::regular(2500, 3, Some(2500))]
    #[case::empty(0, 1, Some(0))]
    #[case::single_byte(1, 1, Some(1))]
    #[case::exactly_one_segment(1024, 1, Some(1024))]
    #[case::at_limit(10_000, 10, Some(10_000))]
    #[case::too_big(10_001, 10, None)]
    #[case::negative(-1, 1, None)]
    #[case::no_segments(100, 0, None)]
    #[case::empty_without_segments(0, 0, None)]
    #[case::too_few_segments(2500, 2, None)]
    #[case::too_many_segments(2500, 4, None)]
    #[case::more_segments_than_bytes(2, 3, None)]
    #[case::one_byte_per_segment(5000, 5000, None)]
    fn test_valid_message_size(#[case] total_size: i64, #[case] total_segment_count: u32, #[case] expected: Option<usize>) {
        assert_eq!(valid_message_size(&data_chunk(total_size, total_segment_count), 10_000, 1024), expected);
    }
}
