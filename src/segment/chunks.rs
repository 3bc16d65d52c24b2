use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::node_id::NodeId;
use crate::segment::protocol_version::is_legacy;
use crate::segment::WireError;

/// The body of `Hello`, `Pong` and `Bye` segments: the id of the node sending it
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeChunk {
    pub node_id: NodeId,
}
impl NodeChunk {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.node_id.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<NodeChunk, WireError> {
        Ok(NodeChunk {
            node_id: NodeId::deser(buf)?,
        })
    }
}

/// A ping announces the sender's id and the highest protocol version it supports. The receiver
///  replies with a `Pong` in the negotiated version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PingChunk {
    pub node_id: NodeId,
    pub protocol_version: u8,
}
impl PingChunk {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.node_id.ser(buf);
        buf.put_u8(self.protocol_version);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PingChunk, WireError> {
        let node_id = NodeId::deser(buf)?;
        let protocol_version = buf.try_get_u8()?;
        Ok(PingChunk {
            node_id,
            protocol_version,
        })
    }
}

/// Shared body of all segments that refer to a whole message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageIdChunk {
    pub message_id: i32,
}
impl MessageIdChunk {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.message_id);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<MessageIdChunk, WireError> {
        Ok(MessageIdChunk {
            message_id: buf.try_get_i32_le()?,
        })
    }
}

/// The receiver got the entire message
pub type AcknowledgeChunk = MessageIdChunk;
/// Stop sending the message
pub type AbortChunk = MessageIdChunk;
/// Resend all segments of the message
pub type TimeoutChunk = MessageIdChunk;

/// Request to resend specific segments of a message
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetransmitChunk {
    pub message_id: i32,
    pub segment_indices: Vec<u16>,
}
impl RetransmitChunk {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.message_id);
        buf.put_usize_varint(self.segment_indices.len());
        for &idx in &self.segment_indices {
            buf.put_u16_le(idx);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<RetransmitChunk, WireError> {
        let message_id = buf.try_get_i32_le()?;
        let len = try_get_list_len(buf, size_of::<u16>())?;

        let mut segment_indices = Vec::with_capacity(len);
        for _ in 0..len {
            segment_indices.push(buf.try_get_u16_le()?);
        }
        Ok(RetransmitChunk {
            message_id,
            segment_indices,
        })
    }
}

/// Acknowledges individual segments of a message. Segment indices are u16 before protocol
///  version 12.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcknowledgeSegmentsChunk {
    pub message_id: i32,
    pub segment_indices: Vec<u32>,
}
impl AcknowledgeSegmentsChunk {
    pub fn ser(&self, buf: &mut impl BufMut, protocol_version: u8) {
        buf.put_i32_le(self.message_id);
        buf.put_usize_varint(self.segment_indices.len());
        if is_legacy(protocol_version) {
            for &idx in &self.segment_indices {
                // NB: legacy peers cannot address more segments than this, truncation is accepted
                buf.put_u16_le(idx as u16);
            }
        }
        else {
            for &idx in &self.segment_indices {
                buf.put_u32_le(idx);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf, protocol_version: u8) -> Result<AcknowledgeSegmentsChunk, WireError> {
        let message_id = buf.try_get_i32_le()?;

        let segment_indices = if is_legacy(protocol_version) {
            let len = try_get_list_len(buf, size_of::<u16>())?;
            let mut result = Vec::with_capacity(len);
            for _ in 0..len {
                result.push(buf.try_get_u16_le()? as u32);
            }
            result
        }
        else {
            let len = try_get_list_len(buf, size_of::<u32>())?;
            let mut result = Vec::with_capacity(len);
            for _ in 0..len {
                result.push(buf.try_get_u32_le()?);
            }
            result
        };

        Ok(AcknowledgeSegmentsChunk {
            message_id,
            segment_indices,
        })
    }
}

/// reads a list's length prefix, rejecting lengths that can not possibly fit into the rest of
///  the datagram before anything is allocated for them
fn try_get_list_len(buf: &mut impl Buf, element_size: usize) -> Result<usize, WireError> {
    let len = buf.try_get_usize_varint()
        .map_err(|_| WireError::MalformedLength)?;
    if len > buf.remaining() / element_size {
        return Err(WireError::Truncated);
    }
    Ok(len)
}
