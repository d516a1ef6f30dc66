//! The raw duplex handle a stream writes to once hijacked.

use std::{
    io::{self, Read, Write},
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
};

/// Non-blocking duplex socket shared between the reactor (reads) and the
/// stream (writes). Both directions take `&self` so one handle can serve
/// both sides without an outer lock.
pub trait RawIo: AsRawFd + Send + Sync {
    /// Writes as much of `buf` as the socket accepts right now.
    ///
    /// Must return `ErrorKind::WouldBlock` instead of stalling.
    fn write_nonblock(&self, buf: &[u8]) -> io::Result<usize>;

    /// Reads whatever is available; `Ok(0)` means the peer closed.
    fn read_nonblock(&self, buf: &mut [u8]) -> io::Result<usize>;
}

pub type Handle = Arc<dyn RawIo>;

impl RawIo for mio::net::TcpStream {
    fn write_nonblock(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn read_nonblock(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl RawIo for mio::net::UnixStream {
    fn write_nonblock(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn read_nonblock(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

/// Result of one non-blocking send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Complete,
    Partial(usize),
    WouldBlock,
}

/// Attempts a single non-blocking send of `buf`, retrying only on `EINTR`.
pub fn send_nonblock(io: &dyn RawIo, buf: &[u8]) -> io::Result<SendOutcome> {
    loop {
        match io.write_nonblock(buf) {
            Ok(0) if !buf.is_empty() => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ))
            }
            Ok(n) if n >= buf.len() => return Ok(SendOutcome::Complete),
            Ok(n) => return Ok(SendOutcome::Partial(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// Scripted socket: each send consumes the next step; once the script
    /// runs out every send is accepted in full.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Step {
        Accept(usize),
        Block,
        Reset,
        Fail,
    }

    #[derive(Default)]
    pub(crate) struct FakeSocket {
        pub script: Mutex<VecDeque<Step>>,
        pub sent: Mutex<Vec<u8>>,
        pub attempts: AtomicUsize,
        pub inbound: Mutex<VecDeque<Vec<u8>>>,
        /// Caps every accepted send when non-zero and the script is empty.
        pub max_per_send: AtomicUsize,
    }

    impl FakeSocket {
        pub(crate) fn scripted(steps: &[Step]) -> Self {
            Self {
                script: Mutex::new(steps.iter().copied().collect()),
                ..Self::default()
            }
        }

        pub(crate) fn push(&self, step: Step) {
            self.script.lock().unwrap().push_back(step);
        }

        pub(crate) fn sent(&self) -> Vec<u8> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl AsRawFd for FakeSocket {
        fn as_raw_fd(&self) -> RawFd {
            42
        }
    }

    impl RawIo for FakeSocket {
        fn write_nonblock(&self, buf: &[u8]) -> io::Result<usize> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            let accepted = match step {
                Some(Step::Accept(n)) => n.min(buf.len()),
                Some(Step::Block) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(Step::Reset) => return Err(io::ErrorKind::ConnectionReset.into()),
                Some(Step::Fail) => return Err(io::ErrorKind::PermissionDenied.into()),
                None => match self.max_per_send.load(Ordering::SeqCst) {
                    0 => buf.len(),
                    cap => cap.min(buf.len()),
                },
            };
            self.sent.lock().unwrap().extend_from_slice(&buf[..accepted]);
            Ok(accepted)
        }

        fn read_nonblock(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbound.lock().unwrap().pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_send_outcomes() {
        let socket = FakeSocket::scripted(&[Step::Accept(4), Step::Accept(1), Step::Block]);
        assert_eq!(send_nonblock(&socket, b"abcd").unwrap(), SendOutcome::Complete);
        assert_eq!(send_nonblock(&socket, b"ef").unwrap(), SendOutcome::Partial(1));
        assert_eq!(send_nonblock(&socket, b"gh").unwrap(), SendOutcome::WouldBlock);
        assert_eq!(socket.sent(), b"abcde");
    }

    #[test]
    fn test_zero_byte_send_is_write_zero() {
        let socket = FakeSocket::scripted(&[Step::Accept(0)]);
        let err = send_nonblock(&socket, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_reset_surfaces_as_error() {
        let socket = FakeSocket::scripted(&[Step::Reset]);
        let err = send_nonblock(&socket, b"x").unwrap_err();
        assert!(crate::error::is_connection_lost(&err));
    }

    #[test]
    fn test_mio_unix_pair_is_raw_io() {
        let (left, right) = mio::net::UnixStream::pair().unwrap();
        assert_eq!(
            send_nonblock(&left, b"ping").unwrap(),
            SendOutcome::Complete
        );

        let mut buf = [0u8; 8];
        let n = loop {
            match right.read_nonblock(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");
    }
}
