//! # hijack-io
//! Non-blocking, order-preserving write path for sockets taken over ("hijacked")
//! from a request framework, driven by a reactor built on [`mio`].
//!
//! Protocol code may call [`Stream::write`] from any thread at any time. The
//! call never waits on the socket: bytes go out immediately when the socket
//! can take them and are queued otherwise, to be drained in submission order
//! when the reactor reports the socket writable again.
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────────┐ write  ┌──────────────────────────────┐
//! │ Protocol     │───────▶│ Stream                       │
//! │ layer        │        │  WriteBuffer  (SegQueue FIFO)│
//! └──────────────┘        │  DrainGuard   (head chunk)   │
//!                         └───────┬──────────────▲───────┘
//!            attach / detach /    │              │ flush / receive / hangup
//!            writes_pending       ▼              │
//!                         ┌──────────────────────┴───────┐
//!                         │ Reactor (EventLoop over mio) │
//!                         └──────────────┬───────────────┘
//!                                        ▼
//!                              epoll / kqueue
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hijack_io::{Connection, EventLoop, EventLoopConfig, Handle, Stream};
//! use std::sync::{Arc, Mutex};
//!
//! struct Upgraded {
//!     socket: Mutex<Option<Handle>>,
//! }
//!
//! impl Connection for Upgraded {
//!     fn hijack(&self) -> hijack_io::Result<Option<Handle>> {
//!         Ok(self.socket.lock().unwrap().take())
//!     }
//!     fn parse(&self, data: &[u8]) {
//!         println!("received {} bytes", data.len());
//!     }
//!     fn client_gone(&self) {
//!         println!("client gone");
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_loop = Arc::new(EventLoop::new(EventLoopConfig::default())?);
//!     let (socket, _peer) = mio::net::UnixStream::pair()?;
//!     let socket: Handle = Arc::new(socket);
//!     let connection = Arc::new(Upgraded {
//!         socket: Mutex::new(Some(socket)),
//!     });
//!
//!     let stream = Stream::new(event_loop.clone(), connection);
//!     stream.hijack()?;
//!     stream.write(&b"hello"[..])?;
//!
//!     event_loop.run()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`stream`]: the write entry point, flush loop and lifecycle
//! - [`buffer`] and [`guard`]: the queue and single-drainer exclusion behind it
//! - [`reactor`]: the capability traits between streams and event loops
//! - [`event_loop`]: the mio-backed reactor
//! - [`config`], [`logger`], [`error`]: configuration, logging and errors

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod guard;
pub mod io;
pub mod logger;
pub mod pool;
pub mod reactor;
pub mod stream;

pub use config::{AfterClose, EventLoopConfig, StreamConfig};
pub use connection::{Connection, PassThrough};
pub use error::{Result, StreamError};
pub use event_loop::EventLoop;
pub use io::{Handle, RawIo};
pub use logger::{LogLevel, Logger, NoOpLogger, TracingLogger};
pub use reactor::{Reactor, ReactorClient};
pub use stream::{Stream, StreamStats};

/// Re-exports of the types most applications touch.
///
/// ```rust
/// use hijack_io::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{AfterClose, EventLoopConfig, StreamConfig};
    pub use crate::connection::Connection;
    pub use crate::error::{Result, StreamError};
    pub use crate::event_loop::EventLoop;
    pub use crate::io::{Handle, RawIo};
    pub use crate::reactor::{Reactor, ReactorClient};
    pub use crate::stream::Stream;
}
