use std::cmp::min;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bit_set::BitSet;
use bit_vec::BitVec;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::segment::MessageFlags;
use crate::serialized_message::{SerializationState, SerializedMessage};

/// Splits one serialized message into segments for one recipient node, and keeps track of which
///  segments still need to be sent.
///
/// The serialized bytes are shared with the segmenters of all other recipients using the same
///  protocol version, while the 'pending' bookkeeping is per recipient.
///
/// Reliable messages stay pending until they are acknowledged, and pending segments are
///  re-sent every `send_interval`. Unreliable messages are sent once.
pub struct Segmenter {
    message: Arc<SerializedMessage>,
    segment_size: usize,
    send_interval: Duration,

    /// `None` until the serialization is complete
    data: Option<Bytes>,
    invalid: bool,

    pending: BitSet,
    pending_count: usize,
    total_segments: usize,
    sent_count: usize,
    last_sent_time: Option<Instant>,
}

impl Segmenter {
    pub fn new(message: Arc<SerializedMessage>, segment_size: usize, send_interval: Duration) -> Segmenter {
        Segmenter {
            message,
            segment_size,
            send_interval,
            data: None,
            invalid: false,
            pending: BitSet::new(),
            pending_count: 0,
            total_segments: 0,
            sent_count: 0,
            last_sent_time: None,
        }
    }

    /// Snapshots the serialized message once its serialization has completed. This is a no-op if
    ///  the segmenter is initialized already or the serialization is still running.
    ///
    /// A failed serialization or a message exceeding `max_message_size` makes the segmenter
    ///  invalid.
    pub fn initialize(&mut self, max_message_size: usize) {
        if self.is_initialized() || self.invalid {
            return;
        }

        match self.message.state() {
            SerializationState::Incomplete => {}
            SerializationState::Invalid => {
                debug!("serialization failed - segmenter is invalid");
                self.invalid = true;
            }
            SerializationState::Complete(data) => {
                if data.len() > max_message_size {
                    debug!("serialized message has {} bytes, exceeding the limit of {} for protocol version {} - segmenter is invalid", data.len(), max_message_size, self.message.protocol_version());
                    self.invalid = true;
                    return;
                }

                // NB: An empty message is still sent as one (empty) segment so the receiver sees it
                self.total_segments = data.len().div_ceil(self.segment_size).max(1);
                self.pending = BitSet::from_bit_vec(BitVec::from_elem(self.total_segments, true));
                self.pending_count = self.total_segments;
                self.data = Some(data);

                trace!("initialized segmenter with {} segments", self.total_segments);
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn is_complete(&self) -> bool {
        self.is_initialized() && self.pending_count == 0
    }

    pub fn is_reliable(&self) -> bool {
        self.message.flags().contains(MessageFlags::RELIABLE)
    }

    pub fn flags(&self) -> MessageFlags {
        self.message.flags()
    }

    pub fn sequence(&self) -> u64 {
        self.message.sequence()
    }

    /// The protocol version this segmenter's message was serialized for. Segments must be sent
    ///  with this version even if the recipient's negotiated version changed in the meantime.
    pub fn protocol_version(&self) -> u8 {
        self.message.protocol_version()
    }

    pub fn message_len(&self) -> usize {
        self.data.as_ref()
            .map(|d| d.len())
            .unwrap_or(0)
    }

    pub fn total_segments(&self) -> u32 {
        self.total_segments.prechecked_cast()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn sent_count(&self) -> usize {
        self.sent_count
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn pending_indices(&self) -> Vec<u32> {
        self.pending.iter()
            .map(|idx| idx.prechecked_cast())
            .collect()
    }

    /// Returns the slice of the message for a segment index if that segment is still pending
    pub fn get_pending_segment(&self, index: u32) -> Option<Bytes> {
        let data = self.data.as_ref()?;
        let index: usize = index.safe_cast();
        if !self.pending.contains(index) {
            return None;
        }

        let start = index * self.segment_size;
        let end = min(data.len(), start + self.segment_size);
        Some(data.slice(start..end))
    }

    /// NB: Duplicate acknowledgments are harmless
    pub fn mark_acknowledged(&mut self, indices: &[u32]) {
        for &idx in indices {
            if self.pending.remove(idx.safe_cast()) {
                self.pending_count -= 1;
            }
        }
    }

    pub fn mark_for_retransmission(&mut self, indices: &[u32]) {
        for &idx in indices {
            let idx: usize = idx.safe_cast();
            if idx >= self.total_segments {
                debug!("retransmission requested for segment #{} of a message with {} segments - ignoring", idx, self.total_segments);
                continue;
            }
            if self.pending.insert(idx) {
                self.pending_count += 1;
            }
        }
    }

    pub fn mark_all_for_retransmission(&mut self) {
        for idx in 0..self.total_segments {
            self.pending.insert(idx);
        }
        self.pending_count = self.total_segments;
    }

    pub fn needs_sending(&self, now: Instant) -> bool {
        match self.last_sent_time {
            None => true,
            Some(last_sent_time) => now >= last_sent_time + self.send_interval,
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.sent_count += 1;
        self.last_sent_time = Some(now);
    }
}
