//! A peer-to-peer messaging transport on top of UDP, designed for nodes of a distributed
//!  application that share a network segment.
//!
//! ## Design goals
//!
//! * Nodes discover each other without central coordination
//!   * every node periodically sends a `Ping` to a multicast group and to a configurable list of
//!     static endpoints; a node receiving a `Ping` from an unknown node answers with a `Pong`
//!   * a node that says `Bye`, or that was not heard from for a number of beacon intervals, is
//!     considered lost
//!   * a node is identified by a random 128 bit id chosen at startup, so a restarted process is a
//!     different node even if it reuses the old address
//! * The abstraction is sending / receiving *messages* of arbitrary size
//!   * messages are split into segments that fit into a single datagram, and reassembled by the
//!     recipient
//!   * *reliable* messages are resent until all segments are acknowledged; unreliable messages
//!     are sent once
//!   * messages with a sequence number are delivered in sequence order, within a bounded window:
//!     a receiver skips missing messages rather than waiting for them indefinitely
//! * Peers running different protocol versions interoperate
//!   * the protocol version is negotiated per node through `Ping` / `Pong`
//!   * a message is serialized once per protocol version in use among its recipients
//! * All protocol state is owned by a single worker, so there is no locking on the hot path
//!
//! ## Segment types
//!
//! ```ascii
//!  Hello, Pong          announce a node id to a specific node
//!  Ping                 discovery beacon, carrying the sender's preferred protocol version
//!  Bye                  the sender is shutting down
//!  Data                 one segment of a message
//!  Acknowledge          a message was received completely
//!  AcknowledgeSegments  a list of received segments of a message (protocol version 11+)
//!  Retransmit           request to resend specific segments of a message
//!  Abort, Timeout       the recipient gave up on a message
//! ```
//!
//! See [segment] for the byte level format.

pub mod beacon;
pub mod config;
pub mod end_point;
pub mod events;
pub mod node_id;
pub mod node_info;
pub mod processor;
pub mod reassembler;
pub mod resequencer;
pub mod safe_converter;
pub mod segment;
pub mod segmenter;
pub mod send_socket;
pub mod serialized_message;
pub mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
