//! mio-backed reactor driving hijacked streams from a single dispatch thread.
//!
//! ## Event Handling Pipeline
//!
//! ```text
//! attach(handle, client)
//!     - insert Registration keyed by fd
//!     - register fd with Interest::READABLE
//!
//! writes_pending(handle)            (any thread)
//!     - first call re-registers READABLE | WRITABLE
//!     - later calls are no-ops until disarmed
//!
//! run()                             (dispatch thread)
//!     Readable ──> read until WouldBlock ──> client.receive()
//!                  EOF / read failure    ──> client.hangup()
//!     Writable ──> client.flush()
//!                  false ──> stay armed, wait for the next edge
//!                  true  ──> flush again while client.has_pending(),
//!                            otherwise back to READABLE only
//!
//! detach(handle)
//!     - remove Registration, deregister fd
//! ```
//!
//! mio is edge-triggered, so a registration only leaves the writable set
//! while holding its interest lock and after confirming the client has
//! nothing left. A writer that queued in between either sees the interest
//! still armed after the check (and its bytes are picked up by the re-flush)
//! or arms it again itself.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
};

use lockfree::map::Map as LockfreeMap;
use mio::{event::Event, unix::SourceFd, Events, Interest, Poll, Registry, Token, Waker};

use crate::{
    config::EventLoopConfig,
    error::{is_connection_lost, Result, StreamError},
    io::Handle,
    logger::LogLevel,
    pool::BufferPool,
    reactor::{Reactor, ReactorClient},
};

/// Reserved for the shutdown waker; never a valid descriptor.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

struct Registration {
    handle: Handle,
    client: Arc<dyn ReactorClient>,
    /// Whether WRITABLE is part of the registered interest.
    writable: Mutex<bool>,
}

impl Registration {
    fn writable(&self) -> MutexGuard<'_, bool> {
        self.writable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct EventLoop {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    registrations: LockfreeMap<usize, Arc<Registration>>,
    running: AtomicBool,
    read_pool: BufferPool,
    config: EventLoopConfig,
}

impl EventLoop {
    pub fn new(config: EventLoopConfig) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            registrations: LockfreeMap::new(),
            running: AtomicBool::new(false),
            read_pool: BufferPool::new(config.read_pool_size, config.read_buffer_size),
            config,
        })
    }

    /// Polls and dispatches on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) -> Result<()> {
        let mut poll = match self.poll.try_lock() {
            Ok(poll) => poll,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(StreamError::AlreadyRunning),
        };
        let mut events = Events::with_capacity(self.config.events_capacity);

        self.running.store(true, Ordering::SeqCst);
        self.log(LogLevel::Debug, "Event loop started");

        while self.running.load(Ordering::SeqCst) {
            match poll.poll(&mut events, Some(self.config.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(event);
            }
        }

        self.log(LogLevel::Debug, "Event loop stopped");
        Ok(())
    }

    /// Asks a running loop to return. Safe from any thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            self.log(LogLevel::Error, &format!("Failed to wake event loop: {}", e));
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of attached handles.
    pub fn registered(&self) -> usize {
        self.registrations.iter().count()
    }

    fn registration(&self, key: usize) -> Option<Arc<Registration>> {
        self.registrations.get(&key).map(|entry| entry.val().clone())
    }

    fn dispatch(&self, event: &Event) {
        let key = event.token().0;
        let Some(registration) = self.registration(key) else {
            return;
        };

        if event.is_readable() || event.is_read_closed() {
            self.handle_read(&registration);
        }

        if event.is_writable() && self.is_current(key, &registration) {
            self.handle_writable(key, &registration);
        }
    }

    /// False once the registration was detached, e.g. by a hangup while
    /// reading.
    fn is_current(&self, key: usize, registration: &Arc<Registration>) -> bool {
        self.registration(key)
            .is_some_and(|current| Arc::ptr_eq(&current, registration))
    }

    fn handle_read(&self, registration: &Registration) {
        let mut buffer = self.read_pool.acquire();
        loop {
            match registration.handle.read_nonblock(&mut buffer) {
                Ok(0) => {
                    registration.client.hangup();
                    return;
                }
                Ok(n) => registration.client.receive(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let level = if is_connection_lost(&e) {
                        LogLevel::Debug
                    } else {
                        LogLevel::Error
                    };
                    self.log(
                        level,
                        &format!(
                            "Read error on fd {}: {}",
                            registration.handle.as_raw_fd(),
                            e
                        ),
                    );
                    registration.client.hangup();
                    return;
                }
            }
        }
    }

    fn handle_writable(&self, key: usize, registration: &Arc<Registration>) {
        loop {
            match registration.client.flush() {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        &format!(
                            "Flush failed on fd {}: {}",
                            registration.handle.as_raw_fd(),
                            e
                        ),
                    );
                    registration.client.hangup();
                    return;
                }
            }

            // a lost connection detaches the client during flush
            if !self.is_current(key, registration) {
                return;
            }

            let mut writable = registration.writable();
            if registration.client.has_pending() {
                // queued by a writer that saw the interest still armed
                continue;
            }
            if *writable {
                if let Err(e) = self.reregister(&registration.handle, Interest::READABLE) {
                    self.log(
                        LogLevel::Warn,
                        &format!("Failed to drop write interest: {}", e),
                    );
                    return;
                }
                *writable = false;
            }
            return;
        }
    }

    fn reregister(&self, handle: &Handle, interest: Interest) -> io::Result<()> {
        let fd = handle.as_raw_fd();
        self.registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.config.logger.log(level, message);
    }
}

impl Reactor for EventLoop {
    fn attach(&self, handle: &Handle, client: Arc<dyn ReactorClient>) -> Result<()> {
        let fd = handle.as_raw_fd();
        let key = fd as usize;
        if self.registrations.get(&key).is_some() {
            return Err(StreamError::AlreadyAttached);
        }

        // visible before the first event can arrive
        self.registrations.insert(
            key,
            Arc::new(Registration {
                handle: handle.clone(),
                client,
                writable: Mutex::new(false),
            }),
        );

        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&fd), Token(key), Interest::READABLE)
        {
            self.registrations.remove(&key);
            return Err(e.into());
        }

        self.log(LogLevel::Debug, &format!("Attached fd {}", fd));
        Ok(())
    }

    fn detach(&self, handle: &Handle) -> Result<()> {
        let fd = handle.as_raw_fd();
        if self.registrations.remove(&(fd as usize)).is_none() {
            return Ok(());
        }

        match self.registry.deregister(&mut SourceFd(&fd)) {
            Ok(()) => {
                self.log(LogLevel::Debug, &format!("Detached fd {}", fd));
                Ok(())
            }
            // the socket was already closed underneath us
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn writes_pending(&self, handle: &Handle) -> Result<()> {
        let fd = handle.as_raw_fd();
        let Some(registration) = self.registration(fd as usize) else {
            return Ok(());
        };

        let mut writable = registration.writable();
        if !*writable {
            self.reregister(handle, Interest::READABLE | Interest::WRITABLE)?;
            *writable = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoOpLogger;
    use mio::net::UnixStream;
    use std::{
        io::Write,
        sync::atomic::AtomicUsize,
        thread,
        time::{Duration, Instant},
    };

    #[derive(Default)]
    struct RecordingClient {
        received: Mutex<Vec<u8>>,
        flushes: AtomicUsize,
        hangups: AtomicUsize,
        pending: AtomicBool,
    }

    impl ReactorClient for RecordingClient {
        fn flush(&self) -> Result<bool> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.pending.store(false, Ordering::SeqCst);
            Ok(true)
        }

        fn receive(&self, data: &[u8]) {
            self.received.lock().unwrap().extend_from_slice(data);
        }

        fn has_pending(&self) -> bool {
            self.pending.load(Ordering::SeqCst)
        }

        fn hangup(&self) {
            self.hangups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_loop() -> Arc<EventLoop> {
        let config = EventLoopConfig::builder()
            .poll_timeout(Duration::from_millis(10))
            .read_buffer_size(64)
            .logger(Arc::new(NoOpLogger))
            .build();
        Arc::new(EventLoop::new(config).unwrap())
    }

    fn spawn_loop(event_loop: &Arc<EventLoop>) -> thread::JoinHandle<Result<()>> {
        let el = event_loop.clone();
        thread::spawn(move || el.run())
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_event_loop_creation() {
        assert!(EventLoop::new(EventLoopConfig::default()).is_ok());

        let config = EventLoopConfig::builder().events_capacity(0).build();
        assert!(matches!(
            EventLoop::new(config),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_stop_returns_from_run() {
        let event_loop = test_loop();
        let handle = spawn_loop(&event_loop);
        wait_for("loop start", || event_loop.is_running());

        event_loop.stop();
        handle.join().unwrap().unwrap();
        assert!(!event_loop.is_running());
    }

    #[test]
    fn test_attach_and_detach() {
        let event_loop = test_loop();
        let (local, _peer) = UnixStream::pair().unwrap();
        let handle: Handle = Arc::new(local);
        let client = Arc::new(RecordingClient::default());

        event_loop.attach(&handle, client.clone()).unwrap();
        assert_eq!(event_loop.registered(), 1);
        assert!(matches!(
            event_loop.attach(&handle, client),
            Err(StreamError::AlreadyAttached)
        ));

        event_loop.detach(&handle).unwrap();
        event_loop.detach(&handle).unwrap();
        assert_eq!(event_loop.registered(), 0);

        // nothing to arm once detached
        event_loop.writes_pending(&handle).unwrap();
    }

    #[test]
    fn test_readable_forwards_to_receive() {
        let event_loop = test_loop();
        let (local, mut peer) = UnixStream::pair().unwrap();
        let handle: Handle = Arc::new(local);
        let client = Arc::new(RecordingClient::default());
        event_loop.attach(&handle, client.clone()).unwrap();

        let runner = spawn_loop(&event_loop);
        // larger than one read buffer to exercise the read-until-WouldBlock loop
        let payload: Vec<u8> = (0..200u8).collect();
        peer.write_all(&payload).unwrap();

        wait_for("inbound bytes", || client.received.lock().unwrap().len() == 200);
        assert_eq!(*client.received.lock().unwrap(), payload);

        event_loop.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_writes_pending_triggers_flush_then_disarms() {
        let event_loop = test_loop();
        let (local, _peer) = UnixStream::pair().unwrap();
        let handle: Handle = Arc::new(local);
        let client = Arc::new(RecordingClient::default());
        event_loop.attach(&handle, client.clone()).unwrap();
        let runner = spawn_loop(&event_loop);

        client.pending.store(true, Ordering::SeqCst);
        event_loop.writes_pending(&handle).unwrap();
        event_loop.writes_pending(&handle).unwrap();
        wait_for("flush", || client.flushes.load(Ordering::SeqCst) >= 1);

        let registration = event_loop.registration(handle.as_raw_fd() as usize).unwrap();
        wait_for("disarm", || !*registration.writable());

        // no further writable events once disarmed
        let settled = client.flushes.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(client.flushes.load(Ordering::SeqCst), settled);

        event_loop.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_peer_close_hangs_up() {
        let event_loop = test_loop();
        let (local, peer) = UnixStream::pair().unwrap();
        let handle: Handle = Arc::new(local);
        let client = Arc::new(RecordingClient::default());
        event_loop.attach(&handle, client.clone()).unwrap();
        let runner = spawn_loop(&event_loop);

        drop(peer);
        wait_for("hangup", || client.hangups.load(Ordering::SeqCst) >= 1);

        event_loop.stop();
        runner.join().unwrap().unwrap();
        assert!(client.received.lock().unwrap().is_empty());
    }
}
