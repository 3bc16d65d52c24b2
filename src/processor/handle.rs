use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::node_id::NodeId;
use crate::serialized_message::OutboundMessage;

pub(crate) struct InboundSegment {
    pub buf: Bytes,
    pub from: SocketAddr,
}

pub(crate) struct OutboundRequest {
    pub message: Arc<dyn OutboundMessage>,
    /// empty for 'all nodes'
    pub recipients: Vec<NodeId>,
}

/// The state shared between the processor worker and its handles
#[derive(Default)]
pub(crate) struct ProcessorShared {
    wake_signal: Notify,
    stop_requested: AtomicBool,
    /// published by the worker after every pass - the only node state visible outside the worker
    protocol_versions: Mutex<FxHashMap<NodeId, u8>>,
}

impl ProcessorShared {
    pub fn wake(&self) {
        self.wake_signal.notify_one();
    }

    pub async fn wait_for_wake(&self) {
        self.wake_signal.notified().await
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn publish_protocol_versions(&self, snapshot: FxHashMap<NodeId, u8>) {
        *self.lock_protocol_versions() = snapshot;
    }

    fn lock_protocol_versions(&self) -> std::sync::MutexGuard<'_, FxHashMap<NodeId, u8>> {
        // NB: the snapshot is replaced as a whole, so a panic while holding the lock cannot leave
        //      it inconsistent
        self.protocol_versions.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The thread safe API of a [super::MessageProcessor]: it enqueues work for the worker and
///  wakes it up.
#[derive(Clone)]
pub struct ProcessorHandle {
    inbound_sender: mpsc::UnboundedSender<InboundSegment>,
    outbound_sender: mpsc::UnboundedSender<OutboundRequest>,
    shared: Arc<ProcessorShared>,
}

impl ProcessorHandle {
    pub(crate) fn new(
        inbound_sender: mpsc::UnboundedSender<InboundSegment>,
        outbound_sender: mpsc::UnboundedSender<OutboundRequest>,
        shared: Arc<ProcessorShared>,
    ) -> ProcessorHandle {
        ProcessorHandle {
            inbound_sender,
            outbound_sender,
            shared,
        }
    }

    /// Hands a received datagram to the worker. Returns `false` if the processor is shutting down.
    pub fn enqueue_inbound_segment(&self, buf: Bytes, from: SocketAddr) -> bool {
        if self.shared.is_stop_requested() {
            trace!("processor is stopping - dropping segment from {:?}", from);
            return false;
        }
        if self.inbound_sender.send(InboundSegment { buf, from }).is_err() {
            return false;
        }
        self.shared.wake();
        true
    }

    /// Sends a message to the given nodes, or to all known nodes and static endpoints if
    ///  `recipients` is empty. Recipients that are not known nodes are skipped.
    ///
    /// Returns `false` if the processor is shutting down.
    pub fn enqueue_outbound_message(&self, message: Arc<dyn OutboundMessage>, recipients: Vec<NodeId>) -> bool {
        if self.shared.is_stop_requested() {
            debug!("processor is stopping - dropping outbound message");
            return false;
        }
        if self.outbound_sender.send(OutboundRequest { message, recipients }).is_err() {
            return false;
        }
        self.shared.wake();
        true
    }

    /// Groups recipients by the protocol version negotiated with them, based on the snapshot
    ///  published after the worker's most recent pass. An empty `recipients` list stands for all
    ///  known nodes; unknown nodes are omitted.
    pub fn recipients_by_protocol_version(&self, recipients: &[NodeId]) -> BTreeMap<u8, Vec<NodeId>> {
        let snapshot = self.shared.lock_protocol_versions();

        let mut result: BTreeMap<u8, Vec<NodeId>> = BTreeMap::new();
        if recipients.is_empty() {
            for (&node_id, &protocol_version) in snapshot.iter() {
                result.entry(protocol_version).or_default().push(node_id);
            }
            for node_ids in result.values_mut() {
                node_ids.sort();
            }
        }
        else {
            for node_id in recipients {
                if let Some(&protocol_version) = snapshot.get(node_id) {
                    result.entry(protocol_version).or_default().push(*node_id);
                }
            }
        }
        result
    }

    /// The known nodes and their negotiated protocol versions as of the worker's most recent pass
    pub fn known_nodes(&self) -> FxHashMap<NodeId, u8> {
        self.shared.lock_protocol_versions().clone()
    }

    /// Asks the worker to stop after its current pass. The worker then reports all known nodes
    ///  as lost.
    pub fn shutdown(&self) {
        debug!("requesting message processor shutdown");
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.wake();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.is_stop_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::TestMessage;
    use crate::test_util::node::{test_endpoint, test_node_id};
    use rstest::rstest;

    fn handle() -> (ProcessorHandle, mpsc::UnboundedReceiver<InboundSegment>, mpsc::UnboundedReceiver<OutboundRequest>) {
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        (ProcessorHandle::new(inbound_sender, outbound_sender, Default::default()), inbound_receiver, outbound_receiver)
    }

    #[rstest]
    #[case::all(vec![], vec![(11, vec![2]), (12, vec![1, 3])])]
    #[case::some(vec![3, 2], vec![(11, vec![2]), (12, vec![3])])]
    #[case::unknown_is_skipped(vec![1, 4], vec![(12, vec![1])])]
    #[case::only_unknown(vec![5], vec![])]
    fn test_recipients_by_protocol_version(#[case] recipients: Vec<u16>, #[case] expected: Vec<(u8, Vec<u16>)>) {
        let (handle, _, _) = handle();
        handle.shared.publish_protocol_versions([
            (test_node_id(1), 12),
            (test_node_id(2), 11),
            (test_node_id(3), 12),
        ].into_iter().collect());

        let recipients = recipients.into_iter().map(test_node_id).collect::<Vec<_>>();
        let expected = expected.into_iter()
            .map(|(v, ids)| (v, ids.into_iter().map(test_node_id).collect::<Vec<_>>()))
            .collect::<BTreeMap<_, _>>();

        assert_eq!(handle.recipients_by_protocol_version(&recipients), expected);
    }

    #[test]
    fn test_enqueue() {
        let (handle, mut inbound, mut outbound) = handle();

        assert!(handle.enqueue_inbound_segment(Bytes::from_static(b"abc"), test_endpoint(1)));
        assert!(handle.enqueue_outbound_message(Arc::new(TestMessage::reliable(b"x")), vec![test_node_id(1)]));

        let segment = inbound.try_recv().unwrap();
        assert_eq!(segment.buf, Bytes::from_static(b"abc"));
        assert_eq!(segment.from, test_endpoint(1));
        assert_eq!(outbound.try_recv().unwrap().recipients, vec![test_node_id(1)]);
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let (handle, mut inbound, mut outbound) = handle();
        handle.shutdown();
        assert!(handle.is_stop_requested());

        assert!(!handle.enqueue_inbound_segment(Bytes::from_static(b"abc"), test_endpoint(1)));
        assert!(!handle.enqueue_outbound_message(Arc::new(TestMessage::reliable(b"x")), vec![]));
        assert!(inbound.try_recv().is_err());
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_enqueue_after_worker_is_gone() {
        let (handle, inbound, outbound) = handle();
        drop(inbound);
        drop(outbound);

        assert!(!handle.enqueue_inbound_segment(Bytes::from_static(b"abc"), test_endpoint(1)));
        assert!(!handle.enqueue_outbound_message(Arc::new(TestMessage::reliable(b"x")), vec![]));
    }
}
