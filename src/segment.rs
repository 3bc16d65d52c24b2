//! The byte-level framing shared by every datagram.
//!
//! Each UDP datagram carries exactly one *segment*: a fixed header followed by one
//!  type-specific chunk. All numbers are little endian.
//!
//! ```ascii
//!  0: protocol version (u8)
//!  1: recipient node id (16 bytes) - all zeros for 'broadcast'
//! 17: sender node id (16 bytes)
//! 33: segment type (u8)
//! 34: chunk (depends on segment type and protocol version)
//! ```
//!
//! Chunks are encoded as fixed-width fields. The only variable-length parts are lists of
//!  segment indices (prefixed with their varint encoded length) and the payload of a data
//!  chunk, which extends to the end of the datagram.
//!
//! Protocol versions 10 and 11 are 'legacy': they use narrower integer fields for message sizes
//!  and segment indices, and they have no message flags. Version 12 is the current format.
//!  Decoding anything older than 10 fails with [WireError::UnsupportedVersion].

mod chunks;
mod data_chunk;
mod header;
pub mod protocol_version;

pub use chunks::*;
pub use data_chunk::{DataChunk, MessageFlags};
pub use header::SegmentHeader;

use bytes::BytesMut;
use num_enum::{FromPrimitive, IntoPrimitive};

/// The kind of chunk following the segment header. Ordinals are part of the wire format, so
///  new kinds may only be appended.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SegmentType {
    None = 0,
    Abort = 1,
    Acknowledge = 2,
    Bye = 3,
    Data = 4,
    Hello = 5,
    Retransmit = 6,
    Timeout = 7,
    AcknowledgeSegments = 8,
    Ping = 9,
    Pong = 10,
    /// a segment type introduced by a later protocol revision
    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("segment ends prematurely")]
    Truncated,
    #[error("malformed varint length prefix")]
    MalformedLength,
}

impl From<bytes::TryGetError> for WireError {
    fn from(_: bytes::TryGetError) -> Self {
        WireError::Truncated
    }
}

/// Assembles a complete segment: the header followed by whatever `ser_chunk` writes
pub fn encode_segment(header: &SegmentHeader, ser_chunk: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SegmentHeader::SERIALIZED_LEN + 64);
    header.ser(&mut buf);
    ser_chunk(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::node_id::NodeId;

    #[test]
    fn test_encode_segment() {
        let header = SegmentHeader {
            protocol_version: 12,
            recipient_id: NodeId::BROADCAST,
            sender_id: NodeId::from_u128(7),
            segment_type: SegmentType::Acknowledge,
        };
        let buf = encode_segment(&header, |buf| AcknowledgeChunk { message_id: 3 }.ser(buf));

        assert_eq!(buf.len(), SegmentHeader::SERIALIZED_LEN + 4);
        let mut b: &[u8] = &buf;
        assert_eq!(SegmentHeader::deser(&mut b).unwrap(), header);
        assert_eq!(AcknowledgeChunk::deser(&mut b).unwrap(), AcknowledgeChunk { message_id: 3 });
    }

    #[rstest]
    #[case(0, SegmentType::None)]
    #[case(1, SegmentType::Abort)]
    #[case(2, SegmentType::Acknowledge)]
    #[case(3, SegmentType::Bye)]
    #[case(4, SegmentType::Data)]
    #[case(5, SegmentType::Hello)]
    #[case(6, SegmentType::Retransmit)]
    #[case(7, SegmentType::Timeout)]
    #[case(8, SegmentType::AcknowledgeSegments)]
    #[case(9, SegmentType::Ping)]
    #[case(10, SegmentType::Pong)]
    #[case(11, SegmentType::Unknown(11))]
    #[case(255, SegmentType::Unknown(255))]
    fn test_segment_type_ordinals(#[case] raw: u8, #[case] expected: SegmentType) {
        assert_eq!(SegmentType::from(raw), expected);
        assert_eq!(u8::from(expected), raw);
    }
}
