#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

use tracing::trace;

/// This is an abstraction for sending a single datagram, introduced to facilitate mocking the
///  I/O part away for testing.
///
/// Sending must not block: the processor calls this from its worker, and a datagram that
///  cannot be sent right away is reported as an error and retried on a later pass.
#[cfg_attr(test, automock)]
pub trait SegmentSender: Send + Sync + 'static {
    fn send_segment(&self, to: SocketAddr, segment_buf: &[u8]) -> anyhow::Result<usize>;
}

impl SegmentSender for tokio::net::UdpSocket {
    fn send_segment(&self, to: SocketAddr, segment_buf: &[u8]) -> anyhow::Result<usize> {
        trace!("UDP socket: sending segment to {:?}", to);
        Ok(self.try_send_to(segment_buf, to)?)
    }
}

impl SegmentSender for std::net::UdpSocket {
    fn send_segment(&self, to: SocketAddr, segment_buf: &[u8]) -> anyhow::Result<usize> {
        trace!("UDP socket: sending segment to {:?}", to);
        Ok(self.send_to(segment_buf, to)?)
    }
}
