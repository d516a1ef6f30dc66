//! The seam between streams and the event loop that drives them.
//!
//! ```text
//!   Stream ──attach / detach / writes_pending──▶ Reactor
//!   Stream ◀──flush / receive / hangup────────── Reactor
//! ```
//!
//! A stream never polls its socket. It arms writability interest when it has
//! bytes queued and the reactor calls back into [`ReactorClient::flush`] once
//! the socket can take more. [`EventLoop`](crate::event_loop::EventLoop) is
//! the mio-backed implementation; tests substitute their own.

use std::sync::Arc;

use crate::{error::Result, io::Handle};

/// Registration capability a stream needs from its event loop.
///
/// All methods may be called from any thread.
pub trait Reactor: Send + Sync {
    /// Registers `handle` as a read source bound to `client`.
    fn attach(&self, handle: &Handle, client: Arc<dyn ReactorClient>) -> Result<()>;

    /// Stops watching `handle` and drops the reactor's reference to its client.
    fn detach(&self, handle: &Handle) -> Result<()>;

    /// Asks to be told when `handle` becomes writable. Redundant calls are
    /// harmless.
    fn writes_pending(&self, handle: &Handle) -> Result<()>;
}

/// Callbacks the reactor drives on an attached stream.
pub trait ReactorClient: Send + Sync {
    /// Drains queued bytes. `Ok(true)` when nothing is left to send,
    /// `Ok(false)` when the socket would block again.
    fn flush(&self) -> Result<bool>;

    /// Inbound bytes read from the handle.
    fn receive(&self, data: &[u8]);

    /// Whether bytes are waiting to be sent. Must not block on the drain lock.
    fn has_pending(&self) -> bool;

    /// The peer closed the connection or the read side failed.
    fn hangup(&self);
}
