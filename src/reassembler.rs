use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bit_set::BitSet;
use bit_vec::BitVec;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::safe_converter::SafeCast;
use crate::segment::MessageFlags;

/// Collects the data segments of one inbound message into a pre-allocated buffer.
///
/// A reassembled message outlives its delivery: it is kept until no segment arrived for the
///  stale interval, so that segments of a reliable message re-sent after a lost acknowledgment
///  are recognized as duplicates rather than delivered a second time.
pub struct ReassembledMessage {
    protocol_version: u8,
    flags: MessageFlags,
    sequence: u64,

    data: Vec<u8>,
    total_segments: u32,
    pending: BitSet,
    pending_count: usize,

    /// segment indices that were received but not acknowledged to the sender yet, in order of
    ///  arrival. `queued_acknowledgments` mirrors the queue's content to keep it free of
    ///  duplicates.
    pending_acknowledgments: VecDeque<u32>,
    queued_acknowledgments: BitSet,

    delivered: bool,
    last_segment_time: Instant,
}

impl ReassembledMessage {
    pub fn new(protocol_version: u8, total_size: usize, total_segments: u32, flags: MessageFlags, sequence: u64, now: Instant) -> ReassembledMessage {
        let num_segments: usize = total_segments.safe_cast();
        let pending = BitSet::from_bit_vec(BitVec::from_elem(num_segments, true));

        ReassembledMessage {
            protocol_version,
            flags,
            sequence,
            data: vec![0; total_size],
            total_segments,
            pending,
            pending_count: num_segments,
            pending_acknowledgments: VecDeque::new(),
            queued_acknowledgments: BitSet::with_capacity(num_segments),
            delivered: false,
            last_segment_time: now,
        }
    }

    /// Copies a segment's payload into the message buffer.
    ///
    /// Segments with an index outside the message are dropped. Everything else is queued for
    ///  acknowledgment, including duplicates, since a duplicate means the sender did not get
    ///  the previous acknowledgment.
    pub fn reassemble(&mut self, segment_index: u32, byte_offset: u64, payload: &[u8], now: Instant) {
        self.last_segment_time = now;

        if segment_index >= self.total_segments {
            debug!("received segment #{} for a message with {} segments - dropping", segment_index, self.total_segments);
            return;
        }
        let idx: usize = segment_index.safe_cast();

        if self.pending.contains(idx) {
            let fits = usize::try_from(byte_offset).ok()
                .and_then(|offs| offs.checked_add(payload.len()).map(|end| (offs, end)))
                .filter(|(_, end)| *end <= self.data.len());

            match fits {
                Some((offs, end)) => {
                    self.data[offs..end].copy_from_slice(payload);
                    self.pending.remove(idx);
                    self.pending_count -= 1;
                    trace!("reassembled segment #{}, {} pending", segment_index, self.pending_count);
                }
                None => {
                    debug!("segment #{} at offset {} with {} bytes exceeds the message size of {} - dropping", segment_index, byte_offset, payload.len(), self.data.len());
                }
            }
        }

        if self.queued_acknowledgments.insert(idx) {
            self.pending_acknowledgments.push_back(segment_index);
        }
    }

    /// Removes and returns up to `max` segment indices in the order they were received
    pub fn get_pending_acknowledgments(&mut self, max: usize) -> Vec<u32> {
        let num = max.min(self.pending_acknowledgments.len());
        let result = self.pending_acknowledgments.drain(..num).collect::<Vec<_>>();
        for &idx in &result {
            self.queued_acknowledgments.remove(idx.safe_cast());
        }
        result
    }

    pub fn has_pending_acknowledgments(&self) -> bool {
        !self.pending_acknowledgments.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.pending_count == 0
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    /// Marks the message as delivered and hands out its data. The buffer is released, but the
    ///  bookkeeping stays in place to recognize duplicates.
    pub fn take_for_delivery(&mut self) -> Bytes {
        debug_assert!(self.is_complete());
        self.delivered = true;
        Bytes::from(std::mem::take(&mut self.data))
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(MessageFlags::RELIABLE)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn last_segment_time(&self) -> Instant {
        self.last_segment_time
    }

    /// Reliable messages are kept until they are delivered, everything else only until no
    ///  segment arrived for `stale_interval`
    pub fn is_stale(&self, now: Instant, stale_interval: Duration) -> bool {
        now.saturating_duration_since(self.last_segment_time) > stale_interval
            && (!self.is_reliable() || self.delivered)
    }
}
