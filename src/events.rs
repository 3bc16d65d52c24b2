#[cfg(test)] use mockall::automock;

use bytes::Bytes;

use crate::node_id::NodeId;

/// Callbacks into the layer above the transport. They are called from the processor worker,
///  so implementations should hand off any real work instead of doing it inline.
#[cfg_attr(test, automock)]
pub trait TransportEvents: Send + Sync + 'static {
    /// A message was received completely, and it is next in sequence if it has a sequence number
    fn on_message_reassembled(&self, message: Bytes, sender: NodeId);

    fn on_node_discovered(&self, node_id: NodeId);

    /// A node was removed: it said good-bye, it was not heard from for too long, it restarted
    ///  with a new id, or this node shut down
    fn on_node_lost(&self, node_id: NodeId);
}
