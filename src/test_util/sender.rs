use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::anyhow;
use bytes::Bytes;

use crate::segment::SegmentHeader;
use crate::send_socket::SegmentSender;

/// A segment that went through a [TrackingSegmentSender], with its header parsed
#[derive(Debug, Clone)]
pub struct SentSegment {
    pub to: SocketAddr,
    pub header: SegmentHeader,
    /// everything after the header
    pub chunk: Bytes,
}

/// Records sent segments instead of putting them on the wire, and can be switched to failing
///  every send operation
#[derive(Default)]
pub struct TrackingSegmentSender {
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    failing: Mutex<bool>,
}

impl TrackingSegmentSender {
    pub fn new() -> TrackingSegmentSender {
        Default::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// returns sent segments as raw datagrams, clearing the internal buffer
    pub fn take_raw(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// returns sent segments, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<SentSegment> {
        self.take_raw().into_iter()
            .map(|(to, buf)| {
                let mut chunk = buf;
                let header = SegmentHeader::deser(&mut chunk)
                    .expect("sent segments should have a valid header");
                SentSegment { to, header, chunk }
            })
            .collect()
    }
}

impl SegmentSender for TrackingSegmentSender {
    fn send_segment(&self, to: SocketAddr, segment_buf: &[u8]) -> anyhow::Result<usize> {
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("simulated send failure"));
        }
        self.sent.lock().unwrap().push((to, Bytes::copy_from_slice(segment_buf)));
        Ok(segment_buf.len())
    }
}
