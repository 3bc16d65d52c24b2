use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

/// Brings completed messages carrying a sequence number back into their sender's order.
///
/// Out-of-order messages are buffered in a window of `window_size` sequence numbers starting at
///  the next expected sequence number. A message beyond that window moves the window forward:
///  missing messages that fall out of the window are given up, and buffered messages that fall
///  out of it are released in sequence order.
pub struct Resequencer {
    window_size: u64,
    next_expected: u64,
    /// set once `u64::MAX` was released: there is no next sequence number after that
    exhausted: bool,
    buffered: BTreeMap<u64, Bytes>,
    ready: VecDeque<(u64, Bytes)>,
}

impl Resequencer {
    pub const FIRST_SEQUENCE: u64 = 1;

    pub fn new(window_size: u64) -> Resequencer {
        assert!(window_size > 0);

        Resequencer {
            window_size,
            next_expected: Self::FIRST_SEQUENCE,
            exhausted: false,
            buffered: BTreeMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn next_expected_sequence(&self) -> u64 {
        self.next_expected
    }

    /// A sequence number is stale if it was delivered or skipped already
    pub fn is_stale(&self, sequence: u64) -> bool {
        self.exhausted || sequence < self.next_expected
    }

    pub fn num_buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Returns true if there are messages ready to be drained after this call
    pub fn offer(&mut self, sequence: u64, message: Bytes) -> bool {
        if self.is_stale(sequence) {
            debug!("sequence #{} was already delivered or skipped - discarding", sequence);
            return !self.ready.is_empty();
        }

        // NB: if the window's end does not fit into u64, every remaining sequence number is in it
        if let Some(window_end) = self.next_expected.checked_add(self.window_size) {
            if sequence >= window_end {
                let new_lower_bound = sequence - self.window_size + 1;
                debug!("sequence #{} is outside the resequencing window - skipping from #{} to #{}", sequence, self.next_expected, new_lower_bound);

                let still_buffered = self.buffered.split_off(&new_lower_bound);
                let released = std::mem::replace(&mut self.buffered, still_buffered);
                self.ready.extend(released);
                self.next_expected = new_lower_bound;
            }
        }

        if self.buffered.insert(sequence, message).is_some() {
            trace!("sequence #{} is already buffered - replacing", sequence);
        }

        while let Some(message) = self.buffered.remove(&self.next_expected) {
            self.ready.push_back((self.next_expected, message));
            match self.next_expected.checked_add(1) {
                Some(next) => self.next_expected = next,
                None => {
                    debug!("released the highest possible sequence number - discarding all further sequenced messages");
                    self.exhausted = true;
                    break;
                }
            }
        }

        !self.ready.is_empty()
    }

    /// Returns all messages that are ready for delivery, in ascending sequence order
    pub fn drain_ready(&mut self) -> impl Iterator<Item = (u64, Bytes)> {
        std::mem::take(&mut self.ready).into_iter()
    }

    /// Discards all state, starting over at the first sequence number. This is for when the
    ///  sending node restarted.
    pub fn reset(&mut self) {
        self.next_expected = Self::FIRST_SEQUENCE;
        self.exhausted = false;
        self.buffered.clear();
        self.ready.clear();
    }
}
