use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

/// Fixed-size byte buffer pool. Buffers come back automatically when the
/// [`PooledBuf`] guard drops, whichever way the holder exits. The handle is
/// cheap to clone and share across tasks.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buf_len: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_len: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buf_len: buf_len.max(1),
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn acquire(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buf_len]);
        PooledBuf {
            pool: self.inner.clone(),
            buf: Some(buf),
        }
    }

    pub fn buf_len(&self) -> usize {
        self.inner.buf_len
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl PoolInner {
    fn release(&self, buf: Vec<u8>) {
        if buf.len() == self.buf_len {
            self.free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(buf);
        }
    }
}

#[derive(Debug)]
pub struct PooledBuf {
    pool: Arc<PoolInner>,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new(64);
        assert_eq!(pool.idle(), 0);
        {
            let a = pool.acquire();
            let b = pool.acquire();
            assert_eq!(a.len(), 64);
            assert_eq!(b.len(), 64);
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(32);
        let first_ptr = {
            let buf = pool.acquire();
            buf.as_ptr()
        };
        let again = pool.acquire();
        assert_eq!(again.as_ptr(), first_ptr);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn shared_handles_use_one_free_list() {
        let pool = BufferPool::new(16);
        let clone = pool.clone();
        drop(clone.acquire());
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.buf_len(), 16);
    }

    #[test]
    fn writes_survive_until_release() {
        let pool = BufferPool::new(16);
        let mut buf = pool.acquire();
        buf[..5].copy_from_slice(b"hello");
        assert_eq!(&buf[..5], b"hello");
    }
}
