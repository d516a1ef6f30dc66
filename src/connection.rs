use crate::{error::Result, io::Handle};

/// Direct send strategy used instead of buffering, typically before a
/// connection is hijacked. Returns the number of bytes it accepted.
pub type PassThrough = Box<dyn Fn(&[u8]) -> Result<usize> + Send + Sync>;

/// The framework-side owner of a connection a stream is built on.
pub trait Connection: Send + Sync {
    /// Performs the upgrade handshake and hands over the raw socket.
    ///
    /// `Ok(None)` means the connection cannot be hijacked.
    fn hijack(&self) -> Result<Option<Handle>>;

    /// Sender the framework offers for writes that bypass the stream buffer.
    fn pass_through(&self) -> Option<PassThrough> {
        None
    }

    /// Inbound bytes for the protocol parser.
    fn parse(&self, data: &[u8]);

    /// The peer is gone; tear the connection down.
    fn client_gone(&self);
}
