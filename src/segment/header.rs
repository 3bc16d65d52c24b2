use bytes::{Buf, BufMut};

use crate::node_id::NodeId;
use crate::segment::protocol_version::check_decodable;
use crate::segment::{SegmentType, WireError};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentHeader {
    pub protocol_version: u8,
    /// [NodeId::BROADCAST] for segments addressed to every node
    pub recipient_id: NodeId,
    pub sender_id: NodeId,
    pub segment_type: SegmentType,
}

impl SegmentHeader {
    pub const SERIALIZED_LEN: usize = 2 + 2 * NodeId::SERIALIZED_LEN;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.protocol_version);
        self.recipient_id.ser(buf);
        self.sender_id.ser(buf);
        buf.put_u8(self.segment_type.into());
    }

    /// NB: The protocol version is checked before anything else is parsed, so callers can tell
    ///      an incompatible peer from a garbled datagram
    pub fn deser(buf: &mut impl Buf) -> Result<SegmentHeader, WireError> {
        let protocol_version = buf.try_get_u8()?;
        check_decodable(protocol_version)?;

        let recipient_id = NodeId::deser(buf)?;
        let sender_id = NodeId::deser(buf)?;
        let segment_type = SegmentType::from(buf.try_get_u8()?);

        Ok(SegmentHeader {
            protocol_version,
            recipient_id,
            sender_id,
            segment_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn header(protocol_version: u8, segment_type: SegmentType) -> SegmentHeader {
        SegmentHeader {
            protocol_version,
            recipient_id: NodeId::from_u128(1),
            sender_id: NodeId::from_u128(2),
            segment_type,
        }
    }

    #[rstest]
    #[case::data(header(12, SegmentType::Data))]
    #[case::legacy_ping(header(10, SegmentType::Ping))]
    #[case::unknown_type(header(12, SegmentType::Unknown(42)))]
    fn test_ser_deser(#[case] original: SegmentHeader) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), SegmentHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(SegmentHeader::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }

    #[test]
    fn test_ser_layout() {
        let mut buf = BytesMut::new();
        header(12, SegmentType::Hello).ser(&mut buf);
        assert_eq!(buf[0], 12);
        assert_eq!(buf[16], 1);
        assert_eq!(buf[32], 2);
        assert_eq!(buf[33], 5);
    }

    #[rstest]
    #[case::too_old(9)]
    #[case::too_new(200)]
    fn test_deser_unsupported_version(#[case] version: u8) {
        let mut buf = BytesMut::new();
        header(version, SegmentType::Data).ser(&mut buf);
        let mut b: &[u8] = &buf;
        assert_eq!(SegmentHeader::deser(&mut b), Err(WireError::UnsupportedVersion(version)));
    }

    #[rstest]
    #[case::empty(0)]
    #[case::version_only(1)]
    #[case::without_type(33)]
    fn test_deser_truncated(#[case] len: usize) {
        let mut buf = BytesMut::new();
        header(12, SegmentType::Data).ser(&mut buf);
        let mut b: &[u8] = &buf[..len];
        assert_eq!(SegmentHeader::deser(&mut b), Err(WireError::Truncated));
    }
}
