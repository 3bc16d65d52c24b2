use std::sync::Mutex;

use bytes::Bytes;

use crate::events::TransportEvents;
use crate::node_id::NodeId;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    MessageReassembled(Bytes, NodeId),
    NodeDiscovered(NodeId),
    NodeLost(NodeId),
}

impl TransportEvent {
    pub fn message(payload: &'static [u8], sender: NodeId) -> TransportEvent {
        TransportEvent::MessageReassembled(Bytes::from_static(payload), sender)
    }
}

/// Records all callbacks in the order they happened
#[derive(Default)]
pub struct TrackingTransportEvents {
    events: Mutex<Vec<TransportEvent>>,
}

impl TrackingTransportEvents {
    pub fn new() -> TrackingTransportEvents {
        Default::default()
    }

    /// returns recorded events, clearing the internal buffer
    pub fn take_events(&self) -> Vec<TransportEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// returns a copy of the recorded events, leaving the internal buffer untouched
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: TransportEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl TransportEvents for TrackingTransportEvents {
    fn on_message_reassembled(&self, message: Bytes, sender: NodeId) {
        self.record(TransportEvent::MessageReassembled(message, sender));
    }

    fn on_node_discovered(&self, node_id: NodeId) {
        self.record(TransportEvent::NodeDiscovered(node_id));
    }

    fn on_node_lost(&self, node_id: NodeId) {
        self.record(TransportEvent::NodeLost(node_id));
    }
}
