#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::MessagingConfig;
use crate::node_id::NodeId;
use crate::segment::{encode_segment, NodeChunk, PingChunk, SegmentHeader, SegmentType};
use crate::send_socket::SegmentSender;

/// The part of peer discovery the processor interacts with: it reports how many peers it
///  knows, and it derives the timeout for dead peers from the beacon's period
#[cfg_attr(test, automock)]
pub trait DiscoveryBeacon: Send + Sync + 'static {
    fn set_known_peer_count(&self, num_peers: usize);

    fn beacon_interval(&self) -> Duration;
}

/// Announces this node by periodically sending a `Ping` to the multicast endpoint and to every
///  static endpoint, and says good-bye with a `Bye` when it is stopped.
///
/// The interval grows with the number of known peers, so discovery traffic stays roughly
///  constant as the cluster grows.
pub struct PingBeacon {
    config: Arc<MessagingConfig>,
    send_socket: Arc<dyn SegmentSender>,
    known_peer_count: AtomicUsize,
    stop_signal: Notify,
}

impl PingBeacon {
    pub fn new(config: Arc<MessagingConfig>, send_socket: Arc<dyn SegmentSender>) -> PingBeacon {
        PingBeacon {
            config,
            send_socket,
            known_peer_count: AtomicUsize::new(0),
            stop_signal: Notify::new(),
        }
    }

    fn header(&self, segment_type: SegmentType) -> SegmentHeader {
        SegmentHeader {
            protocol_version: self.config.min_supported_protocol_version(),
            recipient_id: NodeId::BROADCAST,
            sender_id: self.config.local_node_id,
            segment_type,
        }
    }

    pub fn ping_segment(&self) -> BytesMut {
        let chunk = PingChunk {
            node_id: self.config.local_node_id,
            protocol_version: self.config.max_supported_protocol_version(),
        };
        encode_segment(&self.header(SegmentType::Ping), |buf| chunk.ser(buf))
    }

    pub fn bye_segment(&self) -> BytesMut {
        let chunk = NodeChunk {
            node_id: self.config.local_node_id,
        };
        encode_segment(&self.header(SegmentType::Bye), |buf| chunk.ser(buf))
    }

    fn targets(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        std::iter::once(self.config.multicast_endpoint)
            .chain(self.config.static_endpoints.iter().copied())
    }

    fn send_to_all(&self, segment: &[u8]) {
        for to in self.targets() {
            if let Err(e) = self.send_socket.send_segment(to, segment) {
                warn!("error sending discovery segment to {:?}: {}", to, e);
            }
        }
    }

    pub fn send_ping(&self) {
        debug!("sending discovery ping");
        self.send_to_all(&self.ping_segment());
    }

    pub fn send_bye(&self) {
        info!("sending good-bye");
        self.send_to_all(&self.bye_segment());
    }

    /// Pings until [PingBeacon::stop] is called, then sends a `Bye`
    pub async fn run_loop(&self) {
        loop {
            self.send_ping();

            select! {
                _ = sleep(self.beacon_interval()) => {}
                _ = self.stop_signal.notified() => break,
            }
        }
        self.send_bye();
    }

    pub fn stop(&self) {
        self.stop_signal.notify_one();
    }
}

impl DiscoveryBeacon for PingBeacon {
    fn set_known_peer_count(&self, num_peers: usize) {
        self.known_peer_count.store(num_peers, Ordering::Release);
    }

    fn beacon_interval(&self) -> Duration {
        let num_peers = u32::try_from(self.known_peer_count.load(Ordering::Acquire))
            .unwrap_or(u32::MAX);
        self.config.beacon_interval_per_peer
            .saturating_mul(num_peers)
            .max(self.config.beacon_min_interval)
    }
}
