use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fixed-length scratch buffers shared by all chunk fetches. A checked-out
/// buffer belongs to one fetch until its guard drops.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffer_size: usize,
    retain: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
}

impl PoolInner {
    fn free_list(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BufferPool {
    /// `retain` caps how many idle buffers are kept around.
    pub fn new(buffer_size: usize, retain: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size: buffer_size.max(1),
                retain,
                free: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn checkout(&self) -> PooledBuffer {
        let reused = self.inner.free_list().pop();
        let buf = match reused {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.inner.buffer_size)
            }
        };

        PooledBuffer { buf, pool: Arc::clone(&self.inner) }
    }

    #[cfg(test)]
    fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.pool.buffer_size
    }

    pub fn remaining(&self) -> usize {
        self.pool.buffer_size.saturating_sub(self.buf.len())
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut free = self.pool.free_list();
        if free.len() < self.pool.retain {
            free.push(buf);
        }
    }
}
