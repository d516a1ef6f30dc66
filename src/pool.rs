use std::{
    ops::{Deref, DerefMut},
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex, PoisonError,
    },
};

/// Recycles fixed-size receive buffers for the reactor's read path.
#[derive(Clone)]
pub struct BufferPool {
    sender: Sender<Vec<u8>>,
    receiver: Arc<Mutex<Receiver<Vec<u8>>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(initial_size: usize, buffer_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel();
        for _ in 0..initial_size {
            // the receiver is alive, sending cannot fail
            let _ = sender.send(vec![0; buffer_size]);
        }

        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            buffer_size,
        }
    }

    /// Takes a pooled buffer, allocating when the pool is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = {
            let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
            match receiver.try_recv() {
                Ok(buffer) => Some(buffer),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            }
        };

        let mut buffer = recycled.unwrap_or_default();
        buffer.resize(self.buffer_size, 0);

        PooledBuffer {
            buffer: Some(buffer),
            pool_sender: self.sender.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool_sender: Sender<Vec<u8>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let _ = self.pool_sender.send(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_sized_buffer() {
        let pool = BufferPool::new(2, 64);
        let buffer = pool.acquire();
        assert_eq!(buffer.len(), 64);
        assert_eq!(pool.buffer_size(), 64);
    }

    #[test]
    fn test_buffer_is_recycled() {
        let pool = BufferPool::new(0, 16);
        let ptr = {
            let mut buffer = pool.acquire();
            buffer[0] = 0xAB;
            buffer.as_ptr()
        };

        let buffer = pool.acquire();
        assert_eq!(buffer.as_ptr(), ptr);
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn test_grows_beyond_initial_size() {
        let pool = BufferPool::new(1, 8);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
    }
}
