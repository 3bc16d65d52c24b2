use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::beacon::PingBeacon;
use crate::config::MessagingConfig;
use crate::events::TransportEvents;
use crate::node_id::NodeId;
use crate::processor::{MessageProcessor, ProcessorHandle};
use crate::serialized_message::{OutboundMessage, SerializationDispatcher};

/// The largest possible UDP payload
const RECEIVE_BUFFER_SIZE: usize = 65536;

/// EndPoint is where the parts of the transport come together: it owns the sockets, feeds
///  received datagrams to the message processor, runs the discovery beacon and has the API for
///  application code to send messages.
pub struct EndPoint {
    config: Arc<MessagingConfig>,
    unicast_socket: Arc<UdpSocket>,
    beacon: Arc<PingBeacon>,
    handle: ProcessorHandle,
    processor_task: JoinHandle<()>,
    beacon_task: JoinHandle<()>,
    receive_tasks: Vec<JoinHandle<()>>,
}

impl EndPoint {
    /// Binds the sockets and spawns all of the end point's tasks on the current tokio runtime.
    ///
    /// Failure to join the multicast group is not fatal: the end point then relies on static
    ///  endpoints and inbound `Ping`s for discovery.
    pub async fn start(
        config: MessagingConfig,
        events: Arc<dyn TransportEvents>,
        serialization: Arc<dyn SerializationDispatcher>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let unicast_socket = Arc::new(UdpSocket::bind(config.unicast_addr).await?);
        info!("bound unicast socket to {:?}", unicast_socket.local_addr()?);

        let multicast_socket = match make_multicast_socket(config.multicast_endpoint) {
            Ok(socket) => {
                info!("listening for multicast segments on {:?}", config.multicast_endpoint);
                Some(Arc::new(socket))
            }
            Err(e) => {
                warn!("no multicast discovery on {:?}: {:#}", config.multicast_endpoint, e);
                None
            }
        };

        let config = Arc::new(config);
        let beacon = Arc::new(PingBeacon::new(config.clone(), unicast_socket.clone()));

        let (processor, handle) = MessageProcessor::new(
            config.clone(),
            unicast_socket.clone(),
            events,
            beacon.clone(),
            serialization,
        );
        let processor_task = processor.spawn();

        let mut receive_tasks = vec![
            tokio::spawn(recv_loop(unicast_socket.clone(), handle.clone())),
        ];
        if let Some(multicast_socket) = multicast_socket {
            receive_tasks.push(tokio::spawn(recv_loop(multicast_socket, handle.clone())));
        }

        let beacon_task = {
            let beacon = beacon.clone();
            tokio::spawn(async move { beacon.run_loop().await })
        };

        Ok(EndPoint {
            config,
            unicast_socket,
            beacon,
            handle,
            processor_task,
            beacon_task,
            receive_tasks,
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.config.local_node_id
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.unicast_socket.local_addr()?)
    }

    pub fn handle(&self) -> &ProcessorHandle {
        &self.handle
    }

    /// Sends a message to the given nodes, or to all known nodes if `recipients` is empty.
    ///
    /// Returns `false` if the end point is shutting down.
    pub fn send(&self, message: Arc<dyn OutboundMessage>, recipients: Vec<NodeId>) -> bool {
        self.handle.enqueue_outbound_message(message, recipients)
    }

    /// Says good-bye to peers, reports all known nodes as lost and stops all tasks
    pub async fn shutdown(self) {
        info!("shutting down end point {:?}", self.config.local_node_id);

        self.beacon.stop();
        if let Err(e) = self.beacon_task.await {
            error!("beacon task terminated abnormally: {}", e);
        }

        self.handle.shutdown();
        if let Err(e) = self.processor_task.await {
            error!("message processor terminated abnormally: {}", e);
        }

        for task in self.receive_tasks {
            task.abort();
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, handle: ProcessorHandle) {
    info!("starting receive loop on {:?}", socket.local_addr());

    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "segment_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received {} bytes from {:?}", num_read, from);

        if !handle.enqueue_inbound_segment(Bytes::copy_from_slice(&buf[..num_read]), from) {
            debug!("message processor is shut down - terminating receive loop");
            break;
        }
    }
}

/// Creates a non-blocking UDP socket bound to the multicast endpoint's port and joined to its
///  group. Address reuse allows several nodes on the same host to receive the group's traffic.
fn make_multicast_socket(multicast_endpoint: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(multicast_endpoint), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    match multicast_endpoint.ip() {
        IpAddr::V4(group) => {
            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), multicast_endpoint.port());
            socket.bind(&bind_addr.into()).context("bind()")?;
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED).context("IP_ADD_MEMBERSHIP")?;
        }
        IpAddr::V6(group) => {
            socket.set_only_v6(true).context("IPV6_V6ONLY")?;
            let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), multicast_endpoint.port());
            socket.bind(&bind_addr.into()).context("bind()")?;
            socket.join_multicast_v6(&group, 0).context("IPV6_JOIN_GROUP")?;
        }
    }

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::config::MessagingConfig;
    use crate::end_point::EndPoint;
    use crate::serialized_message::InlineSerialization;
    use crate::test_util::events::{TrackingTransportEvents, TransportEvent};
    use crate::test_util::message::TestMessage;
    use crate::test_util::node::test_node_id;

    fn config(n: u16, static_endpoints: Vec<SocketAddr>) -> MessagingConfig {
        let mut config = MessagingConfig::default_ipv4("127.0.0.1:0".parse().unwrap());
        config.local_node_id = test_node_id(n);
        // a port nobody else uses, so the test is not disturbed by other nodes on the network
        config.multicast_endpoint = "239.255.42.99:47231".parse().unwrap();
        config.static_endpoints = static_endpoints;
        config.beacon_min_interval = Duration::from_millis(50);
        config.send_interval = Duration::from_millis(20);
        config
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_two_end_points() {
        let events_a = Arc::new(TrackingTransportEvents::new());
        let end_point_a = EndPoint::start(config(1, vec![]), events_a.clone(), Arc::new(InlineSerialization)).await.unwrap();

        let events_b = Arc::new(TrackingTransportEvents::new());
        let end_point_b = EndPoint::start(config(2, vec![end_point_a.local_addr().unwrap()]), events_b.clone(), Arc::new(InlineSerialization)).await.unwrap();

        wait_for(|| end_point_a.handle().known_nodes().contains_key(&test_node_id(2))
            && end_point_b.handle().known_nodes().contains_key(&test_node_id(1))).await;

        assert!(end_point_b.send(Arc::new(TestMessage::reliable(b"hello from b")), vec![test_node_id(1)]));
        wait_for(|| events_a.events().iter().any(|e| matches!(e, TransportEvent::MessageReassembled(..)))).await;

        assert_eq!(events_a.take_events(), vec![
            TransportEvent::NodeDiscovered(test_node_id(2)),
            TransportEvent::MessageReassembled(Bytes::from_static(b"hello from b"), test_node_id(2)),
        ]);
        assert_eq!(events_b.take_events(), vec![
            TransportEvent::NodeDiscovered(test_node_id(1)),
        ]);

        end_point_b.shutdown().await;
        assert_eq!(events_b.take_events(), vec![
            TransportEvent::NodeLost(test_node_id(1)),
        ]);

        // the Bye makes A forget B right away
        wait_for(|| end_point_a.handle().known_nodes().is_empty()).await;
        end_point_a.shutdown().await;
        assert_eq!(events_a.take_events(), vec![
            TransportEvent::NodeLost(test_node_id(2)),
        ]);
    }
}
