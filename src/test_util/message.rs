use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use bytes::Bytes;

use crate::segment::MessageFlags;
use crate::serialized_message::OutboundMessage;

/// An application message that serializes to a fixed payload (in every protocol version), or
///  fails to serialize
#[derive(Debug)]
pub struct TestMessage {
    flags: MessageFlags,
    sequence: u64,
    payload: Option<Bytes>,
    serialize_count: AtomicUsize,
}

impl TestMessage {
    pub fn reliable(payload: &[u8]) -> TestMessage {
        Self::new(MessageFlags::RELIABLE, Some(Bytes::copy_from_slice(payload)))
    }

    pub fn unreliable(payload: &[u8]) -> TestMessage {
        Self::new(MessageFlags::empty(), Some(Bytes::copy_from_slice(payload)))
    }

    pub fn failing() -> TestMessage {
        Self::new(MessageFlags::RELIABLE, None)
    }

    fn new(flags: MessageFlags, payload: Option<Bytes>) -> TestMessage {
        TestMessage {
            flags,
            sequence: 0,
            payload,
            serialize_count: AtomicUsize::new(0),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> TestMessage {
        self.sequence = sequence;
        self
    }

    /// the number of times [OutboundMessage::serialize] was called
    pub fn serialize_count(&self) -> usize {
        self.serialize_count.load(Ordering::Acquire)
    }
}

impl OutboundMessage for TestMessage {
    fn flags(&self) -> MessageFlags {
        self.flags
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn serialize(&self, _protocol_version: u8) -> anyhow::Result<Bytes> {
        self.serialize_count.fetch_add(1, Ordering::AcqRel);
        match &self.payload {
            Some(payload) => Ok(payload.clone()),
            None => bail!("test message is not serializable"),
        }
    }
}
