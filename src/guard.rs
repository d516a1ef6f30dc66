//! Single-drainer exclusion over the socket and the head chunk.
//!
//! Writers call [`DrainGuard::try_acquire`]; losing the race means somebody
//! else is draining and the writer should queue instead. The reactor's flush
//! path calls [`DrainGuard::acquire`], which waits only for the bounded
//! critical section of whichever writer currently holds the guard.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, MutexGuard, PoisonError, TryLockError,
};

use bytes::Bytes;

/// State only the guard holder may touch.
#[derive(Debug, Default)]
struct DrainState {
    /// Chunk currently being (partially) transmitted.
    head: Option<Bytes>,
}

#[derive(Debug, Default)]
pub struct DrainGuard {
    state: Mutex<DrainState>,
    head_bytes: AtomicUsize,
}

/// Proof of exclusive drain access. Released on drop.
pub struct DrainPermit<'a> {
    state: MutexGuard<'a, DrainState>,
    head_bytes: &'a AtomicUsize,
}

impl DrainGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires without waiting; `None` means another thread is draining.
    pub fn try_acquire(&self) -> Option<DrainPermit<'_>> {
        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return None,
            // a panicking holder leaves the head either whole or replaced by
            // its unsent tail, both valid
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Some(self.permit(state))
    }

    /// Waits for the current holder to release.
    pub fn acquire(&self) -> DrainPermit<'_> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.permit(state)
    }

    /// Size of the head chunk, readable without the guard.
    pub fn head_bytes(&self) -> usize {
        self.head_bytes.load(Ordering::SeqCst)
    }

    fn permit<'a>(&'a self, state: MutexGuard<'a, DrainState>) -> DrainPermit<'a> {
        DrainPermit {
            state,
            head_bytes: &self.head_bytes,
        }
    }
}

impl DrainPermit<'_> {
    pub fn set_head(&mut self, head: Option<Bytes>) {
        self.head_bytes
            .store(head.as_ref().map_or(0, Bytes::len), Ordering::SeqCst);
        self.state.head = head;
    }

    pub fn take_head(&mut self) -> Option<Bytes> {
        self.head_bytes.store(0, Ordering::SeqCst);
        self.state.head.take()
    }

    pub fn has_head(&self) -> bool {
        self.state.head.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{atomic::AtomicBool, Arc},
        thread,
        time::Duration,
    };

    #[test]
    fn test_try_acquire_fails_while_held() {
        let guard = DrainGuard::new();
        let permit = guard.try_acquire().unwrap();
        assert!(guard.try_acquire().is_none());
        drop(permit);
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_head_bytes_tracks_head() {
        let guard = DrainGuard::new();
        {
            let mut permit = guard.acquire();
            permit.set_head(Some(Bytes::from_static(b"tail")));
            assert!(permit.has_head());
        }
        assert_eq!(guard.head_bytes(), 4);

        let mut permit = guard.acquire();
        assert_eq!(permit.take_head().unwrap(), "tail");
        assert_eq!(guard.head_bytes(), 0);
    }

    #[test]
    fn test_acquire_waits_for_holder() {
        let guard = Arc::new(DrainGuard::new());
        let released = Arc::new(AtomicBool::new(false));

        let permit = guard.try_acquire().unwrap();
        let waiter = {
            let guard = guard.clone();
            let released = released.clone();
            thread::spawn(move || {
                let _permit = guard.acquire();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(permit);
        waiter.join().unwrap();
    }

    #[test]
    fn test_recovers_from_poisoned_holder() {
        let guard = Arc::new(DrainGuard::new());
        let g = guard.clone();
        let _ = thread::spawn(move || {
            let mut permit = g.acquire();
            permit.set_head(Some(Bytes::from_static(b"kept")));
            panic!("drainer died");
        })
        .join();

        let mut permit = guard.try_acquire().expect("guard is free after panic");
        assert_eq!(permit.take_head().unwrap(), "kept");
    }
}
