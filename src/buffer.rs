// src/buffer.rs
//
// Fixed-size refcounted buffer pool, built over a plain
// `ArrayQueue<Arc<Inner>>` with reference counting, a generation token for
// zero-copy send completion matching, elastic grow/shrink between
// watermarks, and a small control-class reservation.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner {
    data: BytesMut,
    refcount: AtomicUsize,
    generation: u64,
}

/// A pool-owned buffer. Cloning increments the refcount; dropping the last
/// clone returns the storage to the pool's free-list.
pub struct Buffer {
    inner: Arc<Inner>,
    pool: Arc<PoolShared>,
    len: usize,
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.inner.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.inner.data.capacity());
        self.len = len;
    }

    pub fn capacity(&self) -> usize {
        self.inner.data.capacity()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("as_mut_slice called on a buffer with outstanding clones");
        inner.data.resize(inner.data.capacity(), 0);
        &mut inner.data[..]
    }

    /// Drops the first `n` bytes, shifting the remainder down to offset 0.
    /// Used to strip a wire header (e.g. the 12-byte RTP header) after the
    /// payload has been read into the buffer.
    pub fn strip_prefix(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let n = n.min(self.len);
        let inner = Arc::get_mut(&mut self.inner)
            .expect("strip_prefix called on a buffer with outstanding clones");
        inner.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Generation token used by the send queue to match asynchronous
    /// completion notifications to held buffer references.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    fn refcount(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.inner.refcount.fetch_add(1, Ordering::AcqRel);
        Buffer {
            inner: self.inner.clone(),
            pool: self.pool.clone(),
            len: self.len,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.inner.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.release(self.inner.clone());
        }
    }
}

struct PoolShared {
    free: ArrayQueue<Arc<Inner>>,
    control_free: ArrayQueue<Arc<Inner>>,
    max_packet_size: usize,
    num_buffers: AtomicUsize,
    max_buffers: usize,
    low_watermark: usize,
    high_watermark: usize,
    next_generation: AtomicU64,
    grew_recently: std::sync::atomic::AtomicBool,
}

impl PoolShared {
    fn new_inner(&self) -> Arc<Inner> {
        Arc::new(Inner {
            data: BytesMut::with_capacity(self.max_packet_size),
            refcount: AtomicUsize::new(1),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn release(&self, mut inner: Arc<Inner>) {
        if let Some(i) = Arc::get_mut(&mut inner) {
            i.data.truncate(0);
        }
        if self.free.push(inner).is_err() {
            // Free-list is full (pool shrank under us); let it drop.
        }
    }
}

/// Buffer pool. Grows by doubling up to `max_buffers`; shrinks opportunistically
/// via `try_shrink`. Never releases a buffer whose refcount > 0 since `Buffer`
/// only returns to the free-list on `Drop` of the last clone.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(cfg: &crate::config::Pool) -> anyhow::Result<Self> {
        if cfg.low_watermark >= cfg.high_watermark {
            anyhow::bail!("low_watermark must be < high_watermark");
        }
        let shared = Arc::new(PoolShared {
            free: ArrayQueue::new(cfg.max_buffers),
            control_free: ArrayQueue::new(cfg.control_reserve.max(1)),
            max_packet_size: cfg.max_packet_size as usize,
            num_buffers: AtomicUsize::new(0),
            max_buffers: cfg.max_buffers,
            low_watermark: cfg.low_watermark,
            high_watermark: cfg.high_watermark,
            next_generation: AtomicU64::new(1),
            grew_recently: std::sync::atomic::AtomicBool::new(false),
        });
        for _ in 0..cfg.initial_buffers {
            let b = shared.new_inner();
            shared.num_buffers.fetch_add(1, Ordering::Relaxed);
            let _ = shared.free.push(b);
        }
        for _ in 0..cfg.control_reserve {
            let b = shared.new_inner();
            shared.num_buffers.fetch_add(1, Ordering::Relaxed);
            let _ = shared.control_free.push(b);
        }
        Ok(Self { shared })
    }

    pub fn num_buffers(&self) -> usize {
        self.shared.num_buffers.load(Ordering::Relaxed)
    }

    pub fn num_free(&self) -> usize {
        self.shared.free.len()
    }

    pub fn max_buffers(&self) -> usize {
        self.shared.max_buffers
    }

    pub fn utilization(&self) -> f64 {
        let total = self.shared.max_buffers.max(1) as f64;
        let used = (self.num_buffers() - self.num_free().min(self.num_buffers())) as f64;
        used / total
    }

    /// Acquire a buffer from the general pool, growing the pool (by doubling,
    /// capped at `max_buffers`) if the free-list is empty.
    pub fn acquire(&self) -> Option<Buffer> {
        if let Some(inner) = self.shared.free.pop() {
            inner.refcount.store(1, Ordering::Release);
            return Some(Buffer {
                inner,
                pool: self.shared.clone(),
                len: 0,
            });
        }
        self.try_grow();
        self.shared.free.pop().map(|inner| {
            inner.refcount.store(1, Ordering::Release);
            Buffer {
                inner,
                pool: self.shared.clone(),
                len: 0,
            }
        })
    }

    /// Acquire from the small control-class reservation (HTTP responses, SSE
    /// events, error payloads); falls back to the general pool if empty.
    pub fn acquire_control(&self) -> Option<Buffer> {
        if let Some(inner) = self.shared.control_free.pop() {
            inner.refcount.store(1, Ordering::Release);
            return Some(Buffer {
                inner,
                pool: self.shared.clone(),
                len: 0,
            });
        }
        self.acquire()
    }

    fn try_grow(&self) {
        let current = self.shared.num_buffers.load(Ordering::Relaxed);
        if current >= self.shared.max_buffers {
            return;
        }
        let grow_by = current.max(1).min(self.shared.max_buffers - current);
        for _ in 0..grow_by {
            if self.shared.num_buffers.load(Ordering::Relaxed) >= self.shared.max_buffers {
                break;
            }
            let b = self.shared.new_inner();
            self.shared.num_buffers.fetch_add(1, Ordering::Relaxed);
            if self.shared.free.push(b).is_err() {
                break;
            }
        }
        self.shared.grew_recently.store(true, Ordering::Relaxed);
    }

    /// Opportunistically release buffers back down, never below the pool's
    /// initial size. Called on connection close; a no-op unless the free-list
    /// exceeds the high watermark and no connection is currently slow.
    pub fn try_shrink(&self, any_connection_slow: bool, initial_buffers: usize) {
        if any_connection_slow {
            return;
        }
        if self.num_free() <= self.shared.high_watermark {
            return;
        }
        let floor = initial_buffers.max(self.shared.low_watermark);
        let mut released = 0usize;
        const SHRINK_BATCH: usize = 64;
        while released < SHRINK_BATCH
            && self.shared.num_buffers.load(Ordering::Relaxed) > floor
            && self.num_free() > self.shared.high_watermark
        {
            if self.shared.free.pop().is_some() {
                self.shared.num_buffers.fetch_sub(1, Ordering::Relaxed);
                released += 1;
            } else {
                break;
            }
        }
        if released > 0 {
            self.shared.grew_recently.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pool;

    fn cfg() -> Pool {
        Pool {
            max_packet_size: 2048,
            initial_buffers: 4,
            max_buffers: 16,
            low_watermark: 2,
            high_watermark: 8,
            control_reserve: 2,
        }
    }

    #[test]
    fn acquire_release_round_trip() {
        let pool = BufferPool::new(&cfg()).unwrap();
        let before_free = pool.num_free();
        let buf = pool.acquire().expect("buffer");
        assert_eq!(buf.refcount(), 1);
        assert_eq!(buf.len(), 0);
        drop(buf);
        assert_eq!(pool.num_free(), before_free);
    }

    #[test]
    fn clone_holds_extra_reference() {
        let pool = BufferPool::new(&cfg()).unwrap();
        let a = pool.acquire().unwrap();
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        drop(a);
        drop(b);
        // both released, pool is quiescent again
        assert_eq!(pool.num_free(), pool.num_buffers());
    }

    #[test]
    fn pool_grows_past_initial_when_exhausted() {
        let pool = BufferPool::new(&cfg()).unwrap();
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire().unwrap());
        }
        assert!(pool.num_buffers() > 4);
        assert!(pool.num_buffers() <= pool.max_buffers());
    }

    #[test]
    fn try_shrink_never_drops_below_initial() {
        let pool = BufferPool::new(&cfg()).unwrap();
        // Force growth then release everything.
        let held: Vec<_> = (0..16).map(|_| pool.acquire()).collect();
        drop(held);
        pool.try_shrink(false, 4);
        assert!(pool.num_buffers() >= 4);
    }

    #[test]
    fn control_reserve_is_isolated_from_general_pool() {
        let pool = BufferPool::new(&cfg()).unwrap();
        let general: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
        assert!(!general.is_empty());
        // Control path still has its own reservation even if the
        // general free-list (not counting max growth) is drained.
        drop(general);
        let ctrl = pool.acquire_control();
        assert!(ctrl.is_some());
    }
}
