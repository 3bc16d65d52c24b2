use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::processor::MessageProcessor;

impl MessageProcessor {
    /// Runs the processor on its own tokio task until shutdown is requested through a
    ///  [super::ProcessorHandle]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run_loop())
    }

    /// Does a pass whenever new work is enqueued, or after the poll interval at the latest
    pub async fn run_loop(mut self) {
        info!("starting message processor for {:?}", self.local_node_id());
        let shared = self.shared.clone();
        let poll_interval = self.config.poll_interval;

        while self.tick() {
            select! {
                _ = shared.wait_for_wake() => {}
                _ = sleep(poll_interval) => {}
            }
        }
        debug!("message processor loop terminated");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::beacon::MockDiscoveryBeacon;
    use crate::config::MessagingConfig;
    use crate::node_id::NodeId;
    use crate::processor::MessageProcessor;
    use crate::segment::{encode_segment, NodeChunk, SegmentHeader, SegmentType};
    use crate::serialized_message::InlineSerialization;
    use crate::test_util::events::{TrackingTransportEvents, TransportEvent};
    use crate::test_util::node::{test_endpoint, test_node_id};
    use crate::test_util::sender::TrackingSegmentSender;

    #[tokio::test]
    async fn test_run_loop() {
        let mut config = MessagingConfig::default_ipv4(test_endpoint(0));
        config.local_node_id = test_node_id(0);

        let mut beacon = MockDiscoveryBeacon::new();
        beacon.expect_beacon_interval().return_const(Duration::from_secs(1));
        beacon.expect_set_known_peer_count().return_const(());

        let events = Arc::new(TrackingTransportEvents::new());
        let (processor, handle) = MessageProcessor::new(
            Arc::new(config),
            Arc::new(TrackingSegmentSender::new()),
            events.clone(),
            Arc::new(beacon),
            Arc::new(InlineSerialization),
        );
        let join_handle = processor.spawn();

        let hello = encode_segment(&SegmentHeader {
            protocol_version: 12,
            recipient_id: NodeId::BROADCAST,
            sender_id: test_node_id(1),
            segment_type: SegmentType::Hello,
        }, |b| NodeChunk { node_id: test_node_id(1) }.ser(b));
        assert!(handle.enqueue_inbound_segment(Bytes::from(hello), test_endpoint(1)));

        for _ in 0..500 {
            if !handle.known_nodes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(handle.known_nodes().get(&test_node_id(1)), Some(&12));

        handle.shutdown();
        join_handle.await.unwrap();

        assert_eq!(events.take_events(), vec![
            TransportEvent::NodeDiscovered(test_node_id(1)),
            TransportEvent::NodeLost(test_node_id(1)),
        ]);
        assert!(handle.known_nodes().is_empty());
    }
}
