use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

use crate::node_id::NodeId;
use crate::segment::protocol_version::{check_decodable, is_legacy, PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_LEGACY_MIN};

#[derive(Clone, Debug)]
pub struct MessagingConfig {
    /// The id this process announces to its peers. It should be fresh for every process start
    ///  so peers can detect a restart.
    pub local_node_id: NodeId,

    /// The address the unicast socket is bound to. All segments are sent from this socket, so
    ///  this is the endpoint peers reply to.
    pub unicast_addr: SocketAddr,

    /// The multicast group (and port) that discovery pings and byes are sent to, and that is
    ///  joined for receiving them
    pub multicast_endpoint: SocketAddr,

    /// Peers that are contacted directly, e.g. because multicast does not reach them
    pub static_endpoints: Vec<SocketAddr>,

    /// The maximum number of message bytes per data segment.
    ///
    /// NB: This must be the same on all nodes, and the resulting datagram (segment size plus
    ///      roughly 80 bytes of headers) must fit the path MTU to avoid IP level fragmentation
    pub segment_size: usize,

    /// Protocol versions this node understands. The highest is proposed to peers.
    pub supported_protocol_versions: Vec<u8>,

    /// The minimum time between two flushes of the same message's pending segments
    pub send_interval: Duration,

    /// How long a reassembly buffer is retained after the last segment for it arrived
    pub stale_interval: Duration,

    /// Upper bound for the time the processor worker sleeps when there is nothing to do
    pub poll_interval: Duration,

    /// A peer is considered dead if nothing was received from it for this many beacon intervals
    pub dead_beacon_intervals: u32,

    /// The maximum distance between the next expected sequence number and the highest one
    ///  buffered by a node's resequencer. Messages beyond that skip the gap.
    pub resequencer_window: u64,

    /// message size limit for protocol versions before 12
    pub max_message_size_legacy: usize,
    /// message size limit for protocol versions 12 and later
    pub max_message_size: usize,

    pub beacon_min_interval: Duration,
    /// the beacon slows down with the number of known peers to limit discovery traffic
    pub beacon_interval_per_peer: Duration,
}

impl MessagingConfig {
    pub const DEFAULT_MULTICAST_ENDPOINT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(230, 0, 0, 1), 6666);
    pub const DEFAULT_SEGMENT_SIZE: usize = 1024;

    pub fn default_ipv4(unicast_addr: SocketAddr) -> MessagingConfig {
        MessagingConfig {
            local_node_id: NodeId::random(),
            unicast_addr,
            multicast_endpoint: SocketAddr::V4(Self::DEFAULT_MULTICAST_ENDPOINT),
            static_endpoints: Vec::new(),
            segment_size: Self::DEFAULT_SEGMENT_SIZE,
            supported_protocol_versions: (PROTOCOL_VERSION_LEGACY_MIN..=PROTOCOL_VERSION_CURRENT).collect(),
            send_interval: Duration::from_millis(100),
            stale_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            dead_beacon_intervals: 5,
            resequencer_window: 256,
            max_message_size_legacy: u16::MAX as usize * Self::DEFAULT_SEGMENT_SIZE,
            max_message_size: i32::MAX as usize,
            beacon_min_interval: Duration::from_secs(1),
            beacon_interval_per_peer: Duration::from_millis(200),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_node_id.is_broadcast() {
            bail!("the local node id must not be the broadcast id");
        }
        if self.segment_size < 16 {
            bail!("segment size is too small");
        }
        if self.segment_size > u16::MAX as usize {
            bail!("segment size {} does not fit a UDP datagram", self.segment_size);
        }
        if self.supported_protocol_versions.is_empty() {
            bail!("at least one protocol version must be supported");
        }
        for &v in &self.supported_protocol_versions {
            if check_decodable(v).is_err() {
                bail!("protocol version {} is not implemented", v);
            }
        }
        if self.max_message_size_legacy > u16::MAX as usize * self.segment_size {
            bail!("legacy message size limit exceeds what legacy segment indices can address");
        }
        if self.resequencer_window == 0 {
            bail!("resequencer window must not be empty");
        }
        if self.dead_beacon_intervals == 0 {
            bail!("dead beacon intervals must be positive");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        Ok(())
    }

    pub fn max_supported_protocol_version(&self) -> u8 {
        self.supported_protocol_versions.iter()
            .copied()
            .max()
            .unwrap_or(PROTOCOL_VERSION_CURRENT)
    }

    /// Discovery segments are sent in this version so that every peer sharing at least one
    ///  protocol version with this node can decode them
    pub fn min_supported_protocol_version(&self) -> u8 {
        self.supported_protocol_versions.iter()
            .copied()
            .min()
            .unwrap_or(PROTOCOL_VERSION_CURRENT)
    }

    pub fn supports_protocol_version(&self, protocol_version: u8) -> bool {
        self.supported_protocol_versions.contains(&protocol_version)
    }

    pub fn max_message_size_for(&self, protocol_version: u8) -> usize {
        if is_legacy(protocol_version) {
            self.max_message_size_legacy
        }
        else {
            self.max_message_size
        }
    }

    /// The number of segment indices that fit into one acknowledgment datagram
    pub fn max_acknowledgments_per_segment(&self) -> usize {
        self.segment_size / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> MessagingConfig {
        MessagingConfig::default_ipv4(SocketAddr::from(([127,0,0,1], 6667)))
    }

    #[test]
    fn test_default_is_valid() {
        config().validate().unwrap();
    }

    #[rstest]
    #[case::broadcast_id(|c: &mut MessagingConfig| c.local_node_id = NodeId::BROADCAST)]
    #[case::tiny_segments(|c: &mut MessagingConfig| c.segment_size = 8)]
    #[case::huge_segments(|c: &mut MessagingConfig| c.segment_size = 100_000)]
    #[case::no_versions(|c: &mut MessagingConfig| c.supported_protocol_versions.clear())]
    #[case::ancient_version(|c: &mut MessagingConfig| c.supported_protocol_versions.push(9))]
    #[case::legacy_limit(|c: &mut MessagingConfig| c.max_message_size_legacy = usize::MAX)]
    #[case::empty_window(|c: &mut MessagingConfig| c.resequencer_window = 0)]
    #[case::no_dead_intervals(|c: &mut MessagingConfig| c.dead_beacon_intervals = 0)]
    #[case::zero_poll(|c: &mut MessagingConfig| c.poll_interval = Duration::ZERO)]
    fn test_validate_rejects(#[case] modify: fn(&mut MessagingConfig)) {
        let mut config = config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case(vec![10, 11, 12], 10, 12)]
    #[case(vec![11, 10], 10, 11)]
    #[case(vec![12], 12, 12)]
    fn test_min_max_supported_protocol_version(#[case] versions: Vec<u8>, #[case] expected_min: u8, #[case] expected_max: u8) {
        let mut config = config();
        config.supported_protocol_versions = versions;
        assert_eq!(config.min_supported_protocol_version(), expected_min);
        assert_eq!(config.max_supported_protocol_version(), expected_max);
    }

    #[rstest]
    #[case::legacy(11, u16::MAX as usize * 1024)]
    #[case::current(12, i32::MAX as usize)]
    fn test_max_message_size_for(#[case] version: u8, #[case] expected: usize) {
        assert_eq!(config().max_message_size_for(version), expected);
    }
}
