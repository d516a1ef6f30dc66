//! The hijacked stream: buffered, order-preserving, non-blocking writes.
//!
//! ## Write Path
//!
//! ```text
//! write(bytes)
//!   ├─ pass-through configured ──▶ sender(bytes)
//!   ├─ guard busy ───────────────▶ queue, arm writability
//!   └─ guard acquired
//!        ├─ head or queue non-empty ──▶ queue, arm writability
//!        └─ send now
//!             ├─ complete ──▶ done
//!             ├─ partial ───▶ tail becomes head, arm writability
//!             └─ would block ▶ queue, arm writability
//!
//! reactor: writable ──▶ flush()
//!   loop under the guard: head (or next chunk) ──▶ socket
//!     drained ──▶ true      would block ──▶ false (stay armed)
//! ```
//!
//! A lost connection on either path tears the stream down once and the
//! caller only ever sees its write accepted.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, OnceLock, PoisonError, RwLock,
};

use bytes::Bytes;
use serde::Serialize;

use crate::{
    buffer::WriteBuffer,
    config::{AfterClose, StreamConfig},
    connection::{Connection, PassThrough},
    error::{Result, StreamError},
    guard::{DrainGuard, DrainPermit},
    io::{send_nonblock, Handle, RawIo, SendOutcome},
    logger::LogLevel,
    reactor::{Reactor, ReactorClient},
};

/// Point-in-time copy of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub bytes_accepted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_discarded: u64,
    pub chunks_queued: u64,
    pub immediate_writes: u64,
    pub partial_sends: u64,
    pub flushes: u64,
}

#[derive(Default)]
struct Counters {
    bytes_accepted: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_discarded: AtomicU64,
    chunks_queued: AtomicU64,
    immediate_writes: AtomicU64,
    partial_sends: AtomicU64,
    flushes: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            bytes_accepted: self.bytes_accepted.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_discarded: self.bytes_discarded.load(Ordering::Relaxed),
            chunks_queued: self.chunks_queued.load(Ordering::Relaxed),
            immediate_writes: self.immediate_writes.load(Ordering::Relaxed),
            partial_sends: self.partial_sends.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

pub struct Stream {
    config: StreamConfig,
    reactor: Arc<dyn Reactor>,
    connection: Arc<dyn Connection>,
    pass_through: OnceLock<PassThrough>,
    handle: RwLock<Option<Handle>>,
    buffer: WriteBuffer,
    guard: DrainGuard,
    closed: AtomicBool,
    gone: AtomicBool,
    counters: Counters,
}

impl Stream {
    pub fn new(reactor: Arc<dyn Reactor>, connection: Arc<dyn Connection>) -> Arc<Self> {
        Self::with_config(reactor, connection, StreamConfig::default())
    }

    pub fn with_config(
        reactor: Arc<dyn Reactor>,
        connection: Arc<dyn Connection>,
        config: StreamConfig,
    ) -> Arc<Self> {
        let pass_through = OnceLock::new();
        if let Some(sender) = connection.pass_through() {
            let _ = pass_through.set(sender);
        }

        Arc::new(Self {
            config,
            reactor,
            connection,
            pass_through,
            handle: RwLock::new(None),
            buffer: WriteBuffer::new(),
            guard: DrainGuard::new(),
            closed: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Routes every future write straight to `sender`, bypassing the buffer.
    ///
    /// Only the first sender sticks (including one offered by the connection
    /// at construction). Returns whether `sender` was installed.
    pub fn set_pass_through(&self, sender: PassThrough) -> bool {
        self.pass_through.set(sender).is_ok()
    }

    pub fn is_pass_through(&self) -> bool {
        self.pass_through.get().is_some()
    }

    /// Accepts `data` for transmission and returns its length.
    ///
    /// Never blocks on the socket. Bytes that cannot go out right away are
    /// queued behind earlier writes and sent when the reactor reports the
    /// socket writable. If the peer is gone the bytes are accepted and
    /// dropped.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        if let Some(sender) = self.pass_through.get() {
            return sender(&data[..]);
        }

        let len = data.len();
        if self.is_closed() {
            return self.write_after_close(len);
        }
        if len == 0 {
            return Ok(0);
        }
        Counters::add(&self.counters.bytes_accepted, len);

        let outcome = match self.guard.try_acquire() {
            Some(mut permit) => {
                let outcome = self.write_owned(&mut permit, data);
                drop(permit);
                outcome
            }
            None => self.enqueue(data),
        };
        // a close that ran while this writer was past the closed check
        self.discard_if_closed();

        match outcome {
            Ok(()) => Ok(len),
            Err(StreamError::ConnectionLost(err)) => {
                self.connection_lost(&err);
                Ok(len)
            }
            Err(err) => Err(err),
        }
    }

    fn write_owned(&self, permit: &mut DrainPermit<'_>, data: Bytes) -> Result<()> {
        let handle = match self.handle() {
            Some(handle) if !permit.has_head() && self.buffer.is_empty() => handle,
            _ => return self.enqueue(data),
        };

        match send_nonblock(&*handle, &data)? {
            SendOutcome::Complete => {
                Counters::add(&self.counters.immediate_writes, 1);
                Counters::add(&self.counters.bytes_sent, data.len());
                Ok(())
            }
            SendOutcome::Partial(n) => {
                Counters::add(&self.counters.partial_sends, 1);
                Counters::add(&self.counters.bytes_sent, n);
                permit.set_head(Some(data.slice(n..)));
                self.reactor.writes_pending(&handle)
            }
            SendOutcome::WouldBlock => self.enqueue(data),
        }
    }

    fn enqueue(&self, data: Bytes) -> Result<()> {
        Counters::add(&self.counters.chunks_queued, 1);
        self.buffer.push(data);
        match self.handle() {
            Some(handle) => self.reactor.writes_pending(&handle),
            // armed at hijack
            None => Ok(()),
        }
    }

    fn write_after_close(&self, len: usize) -> Result<usize> {
        match self.config.after_close {
            AfterClose::Discard => {
                Counters::add(&self.counters.bytes_discarded, len);
                self.config.logger.log(
                    LogLevel::Debug,
                    &format!("Discarding {} bytes written after close", len),
                );
                Ok(len)
            }
            AfterClose::Reject => Err(StreamError::Closed),
        }
    }

    /// Sends queued bytes until the queue is empty (`true`) or the socket
    /// would block (`false`).
    ///
    /// Called by the reactor when the handle turns writable. Waits for a
    /// writer that is mid-send, never for the socket.
    pub fn flush(&self) -> Result<bool> {
        if self.is_closed() {
            return Ok(true);
        }
        let Some(handle) = self.handle() else {
            return Ok(false);
        };

        let outcome = {
            let mut permit = self.guard.acquire();
            self.drain(&mut permit, &*handle)
        };
        self.discard_if_closed();

        match outcome {
            Err(StreamError::ConnectionLost(err)) => {
                self.connection_lost(&err);
                Ok(true)
            }
            Ok(_) if self.is_closed() => Ok(true),
            other => other,
        }
    }

    fn drain(&self, permit: &mut DrainPermit<'_>, io: &dyn RawIo) -> Result<bool> {
        Counters::add(&self.counters.flushes, 1);
        loop {
            if self.is_closed() {
                if let Some(head) = permit.take_head() {
                    Counters::add(&self.counters.bytes_discarded, head.len());
                }
                return Ok(true);
            }

            let Some(head) = permit.take_head().or_else(|| self.buffer.pop()) else {
                return Ok(true);
            };

            match send_nonblock(io, &head) {
                Ok(SendOutcome::Complete) => {
                    Counters::add(&self.counters.bytes_sent, head.len());
                }
                Ok(SendOutcome::Partial(n)) => {
                    Counters::add(&self.counters.partial_sends, 1);
                    Counters::add(&self.counters.bytes_sent, n);
                    permit.set_head(Some(head.slice(n..)));
                    if !self.config.drain_partial_immediately {
                        return Ok(false);
                    }
                }
                Ok(SendOutcome::WouldBlock) => {
                    permit.set_head(Some(head));
                    return Ok(false);
                }
                Err(err) => {
                    permit.set_head(Some(head));
                    return Err(err.into());
                }
            }
        }
    }

    /// Forwards inbound bytes to the connection's parser.
    pub fn receive(&self, data: &[u8]) {
        Counters::add(&self.counters.bytes_received, data.len());
        self.connection.parse(data);
    }

    /// Takes over the connection's raw socket and registers it with the
    /// reactor.
    ///
    /// Returns `Ok(false)` when the connection cannot be hijacked. Bytes
    /// written before the hijack are scheduled right away.
    pub fn hijack(self: &Arc<Self>) -> Result<bool> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }

        let handle = {
            let mut slot = self.handle.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(StreamError::AlreadyAttached);
            }
            let Some(handle) = self.connection.hijack()? else {
                return Ok(false);
            };
            let client: Arc<dyn ReactorClient> = self.clone();
            if let Err(err) = self.reactor.attach(&handle, client) {
                // the connection has already given the socket up
                self.config.logger.log(
                    LogLevel::Error,
                    &format!(
                        "Dropping hijacked socket fd {}: attach failed: {}",
                        handle.as_raw_fd(),
                        err
                    ),
                );
                return Err(err);
            }
            *slot = Some(handle.clone());
            handle
        };

        self.config.logger.log(
            LogLevel::Debug,
            &format!("Hijacked socket fd {}", handle.as_raw_fd()),
        );

        if self.has_pending() {
            self.reactor.writes_pending(&handle)?;
        }
        Ok(true)
    }

    /// Unregisters from the reactor. A no-op when nothing is attached.
    pub fn detach(&self) -> Result<()> {
        let handle = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => self.reactor.detach(&handle),
            None => Ok(()),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.detach()
    }

    /// Detaches, discards unsent bytes and tells the connection its client is
    /// gone.
    ///
    /// Unsent bytes are lost unless `flush_on_close` is set, and even then
    /// only what the socket takes without blocking goes out.
    pub fn close(&self) -> Result<()> {
        self.teardown(self.config.flush_on_close)
    }

    fn teardown(&self, drain_first: bool) -> Result<()> {
        let mut detached = Ok(());

        if !self.closed.load(Ordering::SeqCst) {
            if drain_first {
                self.drain_before_close();
            }
            if !self.closed.swap(true, Ordering::SeqCst) {
                detached = self.shutdown();
                let discarded = self.discard_pending();
                if discarded > 0 {
                    self.config.logger.log(
                        LogLevel::Debug,
                        &format!("Closed with {} unsent bytes discarded", discarded),
                    );
                }
            }
        }

        if !self.gone.swap(true, Ordering::SeqCst) {
            self.connection.client_gone();
        }
        detached
    }

    fn drain_before_close(&self) {
        let Some(handle) = self.handle() else {
            return;
        };
        let Some(mut permit) = self.guard.try_acquire() else {
            return;
        };
        if let Err(err) = self.drain(&mut permit, &*handle) {
            self.config.logger.log(
                LogLevel::Debug,
                &format!("Flush before close failed: {}", err),
            );
        }
    }

    fn discard_pending(&self) -> usize {
        let mut discarded = self.buffer.clear();
        // a drainer still holding the guard discards its head after release
        if let Some(mut permit) = self.guard.try_acquire() {
            discarded += permit.take_head().map_or(0, |head| head.len());
        }
        Counters::add(&self.counters.bytes_discarded, discarded);
        discarded
    }

    /// Empties a closed stream. Called by every guard holder after release,
    /// since `close` skips the head while a send is in flight.
    fn discard_if_closed(&self) {
        if self.is_closed() {
            self.discard_pending();
        }
    }

    fn connection_lost(&self, err: &std::io::Error) {
        self.config
            .logger
            .log(LogLevel::Info, &format!("Connection lost: {}", err));
        if let Err(e) = self.teardown(false) {
            self.config.logger.log(
                LogLevel::Warn,
                &format!("Detach after connection loss failed: {}", e),
            );
        }
    }

    fn handle(&self) -> Option<Handle> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_attached(&self) -> bool {
        self.handle().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bytes accepted but not yet handed to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.guard.head_bytes() + self.buffer.queued_bytes()
    }

    pub fn has_pending(&self) -> bool {
        self.guard.head_bytes() > 0 || !self.buffer.is_empty()
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }
}

impl ReactorClient for Stream {
    fn flush(&self) -> Result<bool> {
        Stream::flush(self)
    }

    fn receive(&self, data: &[u8]) {
        Stream::receive(self, data)
    }

    fn has_pending(&self) -> bool {
        Stream::has_pending(self)
    }

    fn hangup(&self) {
        if let Err(err) = self.close() {
            self.config
                .logger
                .log(LogLevel::Warn, &format!("Close after hangup failed: {}", err));
        }
    }
}
