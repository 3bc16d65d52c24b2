use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::segment::WireError;

/// Identifies a messaging process. A process picks a fresh random id on startup, so peers can
///  detect a restart at the same network endpoint by the id changing.
///
/// The nil id is reserved as the 'broadcast' recipient.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const BROADCAST: NodeId = NodeId(Uuid::nil());

    pub const SERIALIZED_LEN: usize = 16;

    pub fn random() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    pub const fn from_u128(raw: u128) -> NodeId {
        NodeId(Uuid::from_u128(raw))
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_nil()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> Result<NodeId, WireError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(WireError::Truncated);
        }
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut raw);
        Ok(NodeId(Uuid::from_bytes(raw)))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "[broadcast]")
        }
        else {
            write!(f, "[{}]", self.0.simple())
        }
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::broadcast(NodeId::BROADCAST, true)]
    #[case::regular(NodeId::from_u128(0x1234), false)]
    fn test_is_broadcast(#[case] id: NodeId, #[case] expected: bool) {
        assert_eq!(id.is_broadcast(), expected);
    }

    #[test]
    fn test_random_is_not_broadcast() {
        assert!(!NodeId::random().is_broadcast());
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_ser() {
        let id = NodeId::from_u128(0x0102030405060708090a0b0c0d0e0f10);
        let mut buf = BytesMut::new();
        id.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16]);

        let mut b: &[u8] = &buf;
        assert_eq!(NodeId::deser(&mut b).unwrap(), id);
        assert!(b.is_empty());
    }

    #[test]
    fn test_deser_truncated() {
        let mut b: &[u8] = &[1,2,3];
        assert!(matches!(NodeId::deser(&mut b), Err(WireError::Truncated)));
    }
}
