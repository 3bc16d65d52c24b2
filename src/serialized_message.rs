//! The boundary to the serialization layer: application messages are turned into bytes outside
//!  the processor worker, and the worker polls the outcome.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::segment::MessageFlags;

/// An application level message that can be serialized for a given protocol version
pub trait OutboundMessage: Send + Sync + 'static {
    fn flags(&self) -> MessageFlags;

    /// Messages with a non-zero sequence number are delivered in sequence order by the
    ///  receiving node; 0 means 'deliver as soon as it is complete'
    fn sequence(&self) -> u64 {
        0
    }

    fn serialize(&self, protocol_version: u8) -> anyhow::Result<Bytes>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializationState {
    Incomplete,
    Complete(Bytes),
    Invalid,
}

/// The result of serializing one message in one protocol version's wire format. It is shared by
///  the segmenters of all recipient nodes using that protocol version.
pub struct SerializedMessage {
    flags: MessageFlags,
    sequence: u64,
    protocol_version: u8,
    data: OnceLock<Option<Bytes>>,
}

impl SerializedMessage {
    pub fn new(flags: MessageFlags, sequence: u64, protocol_version: u8) -> SerializedMessage {
        SerializedMessage {
            flags,
            sequence,
            protocol_version,
            data: OnceLock::new(),
        }
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn state(&self) -> SerializationState {
        match self.data.get() {
            None => SerializationState::Incomplete,
            Some(Some(data)) => SerializationState::Complete(data.clone()),
            Some(None) => SerializationState::Invalid,
        }
    }

    /// NB: Only the first outcome counts, later calls are ignored
    pub fn complete(&self, data: Bytes) {
        if self.data.set(Some(data)).is_err() {
            warn!("serialization outcome was already set - ignoring");
        }
    }

    pub fn fail(&self) {
        if self.data.set(None).is_err() {
            warn!("serialization outcome was already set - ignoring");
        }
    }

    /// Runs the actual serialization and records its outcome
    pub fn serialize_from(&self, message: &dyn OutboundMessage) {
        match message.serialize(self.protocol_version) {
            Ok(data) => self.complete(data),
            Err(e) => {
                debug!("serializing message for protocol version {} failed: {}", self.protocol_version, e);
                self.fail();
            }
        }
    }
}

/// This trait decouples the decision *where* messages are serialized from the processor: the
///  processor only observes [SerializedMessage::state].
pub trait SerializationDispatcher: Send + Sync + 'static {
    fn dispatch(&self, message: Arc<dyn OutboundMessage>, target: Arc<SerializedMessage>);
}

/// Serializes on the calling thread - for small messages and for tests
pub struct InlineSerialization;

impl SerializationDispatcher for InlineSerialization {
    fn dispatch(&self, message: Arc<dyn OutboundMessage>, target: Arc<SerializedMessage>) {
        target.serialize_from(message.as_ref());
    }
}

/// Serializes on tokio's blocking thread pool
pub struct BlockingPoolSerialization {
    runtime: Handle,
}

impl BlockingPoolSerialization {
    pub fn new(runtime: Handle) -> BlockingPoolSerialization {
        BlockingPoolSerialization { runtime }
    }
}

impl SerializationDispatcher for BlockingPoolSerialization {
    fn dispatch(&self, message: Arc<dyn OutboundMessage>, target: Arc<SerializedMessage>) {
        self.runtime.spawn_blocking(move || {
            target.serialize_from(message.as_ref());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::TestMessage;

    #[test]
    fn test_state_transitions() {
        let serialized = SerializedMessage::new(MessageFlags::RELIABLE, 3, 12);
        assert_eq!(serialized.state(), SerializationState::Incomplete);

        serialized.complete(Bytes::from_static(b"abc"));
        assert_eq!(serialized.state(), SerializationState::Complete(Bytes::from_static(b"abc")));

        serialized.fail();
        assert_eq!(serialized.state(), SerializationState::Complete(Bytes::from_static(b"abc")));
    }

    #[test]
    fn test_inline_serialization() {
        let target = Arc::new(SerializedMessage::new(MessageFlags::empty(), 0, 11));
        InlineSerialization.dispatch(Arc::new(TestMessage::unreliable(b"hello")), target.clone());
        assert_eq!(target.state(), SerializationState::Complete(Bytes::from_static(b"hello")));
    }

    #[test]
    fn test_failed_serialization_is_invalid() {
        let target = Arc::new(SerializedMessage::new(MessageFlags::empty(), 0, 12));
        InlineSerialization.dispatch(Arc::new(TestMessage::failing()), target.clone());
        assert_eq!(target.state(), SerializationState::Invalid);
    }

    #[tokio::test]
    async fn test_blocking_pool_serialization() {
        let target = Arc::new(SerializedMessage::new(MessageFlags::empty(), 0, 12));
        BlockingPoolSerialization::new(Handle::current())
            .dispatch(Arc::new(TestMessage::unreliable(b"x")), target.clone());

        for _ in 0..1000 {
            if target.state() != SerializationState::Incomplete {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(target.state(), SerializationState::Complete(Bytes::from_static(b"x")));
    }
}
