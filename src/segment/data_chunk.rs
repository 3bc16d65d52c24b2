use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

use crate::segment::protocol_version::is_legacy;
use crate::segment::WireError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u16 {
        /// The receiver acknowledges segments, and the sender retransmits until everything is
        ///  acknowledged
        const RELIABLE = 0x0001;
    }
}

/// One segment's worth of a message.
///
/// Legacy layout (protocol 10 and 11):
/// ```ascii
///  0: message id (i32)
///  4: message total size (i32)
///  8: segment index (u16)
/// 10: segment byte offset (u32)
/// 14: total segment count (u16)
/// 16: sequence (u64)
/// 24: payload (rest of the datagram)
/// ```
///
/// Current layout (protocol 12):
/// ```ascii
///  0: message id (i32)
///  4: message total size (i64)
/// 12: message flags (u16)
/// 14: segment index (u32)
/// 18: segment byte offset (u64)
/// 26: total segment count (u32)
/// 30: sequence (u64)
/// 38: payload (rest of the datagram)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataChunk {
    pub message_id: i32,
    pub message_total_size: i64,
    pub message_flags: MessageFlags,
    pub segment_index: u32,
    pub segment_byte_offset: u64,
    pub total_segment_count: u32,
    /// 0 for messages that are delivered as soon as they are complete
    pub sequence: u64,
    pub payload: Bytes,
}

impl DataChunk {
    pub const SERIALIZED_PREFIX_LEN_LEGACY: usize = 24;
    pub const SERIALIZED_PREFIX_LEN_CURRENT: usize = 38;

    pub fn serialized_prefix_len(protocol_version: u8) -> usize {
        if is_legacy(protocol_version) {
            Self::SERIALIZED_PREFIX_LEN_LEGACY
        }
        else {
            Self::SERIALIZED_PREFIX_LEN_CURRENT
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.message_flags.contains(MessageFlags::RELIABLE)
    }

    pub fn ser(&self, buf: &mut impl BufMut, protocol_version: u8) {
        if is_legacy(protocol_version) {
            self.ser_legacy(buf);
        }
        else {
            self.ser_current(buf);
        }
        buf.put_slice(&self.payload);
    }

    /// NB: The data chunk owns the rest of the buffer as its payload, so this consumes
    ///      the entire buffer
    pub fn deser(buf: &mut impl Buf, protocol_version: u8) -> Result<DataChunk, WireError> {
        let mut result = if is_legacy(protocol_version) {
            Self::deser_legacy(buf)?
        }
        else {
            Self::deser_current(buf)?
        };
        result.payload = buf.copy_to_bytes(buf.remaining());
        Ok(result)
    }

    /// NB: narrowing to the legacy field widths truncates - legacy peers can not address
    ///      bigger messages anyway, and the sender enforces the legacy message size limit
    fn ser_legacy(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.message_id);
        buf.put_i32_le(self.message_total_size as i32);
        buf.put_u16_le(self.segment_index as u16);
        buf.put_u32_le(self.segment_byte_offset as u32);
        buf.put_u16_le(self.total_segment_count as u16);
        buf.put_u64_le(self.sequence);
    }

    fn ser_current(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.message_id);
        buf.put_i64_le(self.message_total_size);
        buf.put_u16_le(self.message_flags.bits());
        buf.put_u32_le(self.segment_index);
        buf.put_u64_le(self.segment_byte_offset);
        buf.put_u32_le(self.total_segment_count);
        buf.put_u64_le(self.sequence);
    }

    fn deser_legacy(buf: &mut impl Buf) -> Result<DataChunk, WireError> {
        let message_id = buf.try_get_i32_le()?;
        let message_total_size = buf.try_get_i32_le()? as i64;
        let segment_index = buf.try_get_u16_le()? as u32;
        let segment_byte_offset = buf.try_get_u32_le()? as u64;
        let total_segment_count = buf.try_get_u16_le()? as u32;
        let sequence = buf.try_get_u64_le()?;

        Ok(DataChunk {
            message_id,
            message_total_size,
            message_flags: MessageFlags::empty(),
            segment_index,
            segment_byte_offset,
            total_segment_count,
            sequence,
            payload: Bytes::new(),
        })
    }

    fn deser_current(buf: &mut impl Buf) -> Result<DataChunk, WireError> {
        let message_id = buf.try_get_i32_le()?;
        let message_total_size = buf.try_get_i64_le()?;
        let message_flags = MessageFlags::from_bits_retain(buf.try_get_u16_le()?);
        let segment_index = buf.try_get_u32_le()?;
        let segment_byte_offset = buf.try_get_u64_le()?;
        let total_segment_count = buf.try_get_u32_le()?;
        let sequence = buf.try_get_u64_le()?;

        Ok(DataChunk {
            message_id,
            message_total_size,
            message_flags,
            segment_index,
            segment_byte_offset,
            total_segment_count,
            sequence,
            payload: Bytes::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn chunk(message_flags: MessageFlags, payload: &'static [u8]) -> DataChunk {
        DataChunk {
            message_id: 17,
            message_total_size: 2500,
            message_flags,
            segment_index: 2,
            segment_byte_offset: 2048,
            total_segment_count: 3,
            sequence: 5,
            payload: Bytes::from_static(payload),
        }
    }

    #[rstest]
    #[case::reliable(chunk(MessageFlags::RELIABLE, b"abc"))]
    #[case::unreliable(chunk(MessageFlags::empty(), b"abc"))]
    #[case::empty_payload(chunk(MessageFlags::RELIABLE, b""))]
    #[case::unknown_flag_bits(chunk(MessageFlags::from_bits_retain(0x8001), b"x"))]
    fn test_current_version_is_lossless(#[case] original: DataChunk) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf, 12);
        assert_eq!(buf.len(), DataChunk::SERIALIZED_PREFIX_LEN_CURRENT + original.payload.len());

        let mut b: &[u8] = &buf;
        assert_eq!(DataChunk::deser(&mut b, 12).unwrap(), original);
        assert!(b.is_empty());
    }

    #[test]
    fn test_current_layout() {
        let mut buf = BytesMut::new();
        chunk(MessageFlags::RELIABLE, b"xy").ser(&mut buf, 12);
        assert_eq!(buf.as_ref(), &[
            17,0,0,0,
            0xc4,9,0,0,0,0,0,0,
            1,0,
            2,0,0,0,
            0,8,0,0,0,0,0,0,
            3,0,0,0,
            5,0,0,0,0,0,0,0,
            b'x', b'y',
        ]);
    }

    #[rstest]
    #[case(10)]
    #[case(11)]
    fn test_legacy_layout(#[case] protocol_version: u8) {
        let mut buf = BytesMut::new();
        chunk(MessageFlags::RELIABLE, b"xy").ser(&mut buf, protocol_version);
        assert_eq!(buf.as_ref(), &[
            17,0,0,0,
            0xc4,9,0,0,
            2,0,
            0,8,0,0,
            3,0,
            5,0,0,0,0,0,0,0,
            b'x', b'y',
        ]);
    }

    #[rstest]
    #[case(10)]
    #[case(11)]
    fn test_legacy_synthesizes_empty_flags(#[case] protocol_version: u8) {
        let mut buf = BytesMut::new();
        chunk(MessageFlags::RELIABLE, b"xy").ser(&mut buf, protocol_version);

        let mut b: &[u8] = &buf;
        let decoded = DataChunk::deser(&mut b, protocol_version).unwrap();
        assert_eq!(decoded.message_flags, MessageFlags::empty());
        assert!(!decoded.is_reliable());
        assert_eq!(decoded, chunk(MessageFlags::empty(), b"xy"));
    }

    #[test]
    fn test_legacy_narrowing_truncates() {
        let mut original = chunk(MessageFlags::empty(), b"");
        original.segment_index = 0x1_0005;

        let mut buf = BytesMut::new();
        original.ser(&mut buf, 11);
        let mut b: &[u8] = &buf;
        assert_eq!(DataChunk::deser(&mut b, 11).unwrap().segment_index, 5);
    }

    #[rstest]
    #[case::current(12, 37)]
    #[case::legacy(10, 23)]
    fn test_deser_truncated(#[case] protocol_version: u8, #[case] len: usize) {
        let mut buf = BytesMut::new();
        chunk(MessageFlags::empty(), b"").ser(&mut buf, protocol_version);
        let mut b: &[u8] = &buf[..len];
        assert_eq!(DataChunk::deser(&mut b, protocol_version), Err(WireError::Truncated));
    }
}
