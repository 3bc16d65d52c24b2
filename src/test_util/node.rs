use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::node_id::NodeId;

/// convenience method for unit test code: create a [NodeId] based on a number, the same number
///  generating the same id and different numbers different ids
pub fn test_node_id(number: u16) -> NodeId {
    NodeId::from_u128(0x1000 + number as u128)
}

/// the endpoint 'belonging' to the node with the same number, see [test_node_id]
pub fn test_endpoint(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10_000 + number))
}
