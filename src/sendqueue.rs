// src/sendqueue.rs
//
// Zero-copy send queue. Entries move from a `ready` list into a `pending`
// list once the kernel takes async ownership of them, released only on
// completion notification; the batching-deadline idiom and generation-keyed
// completion bookkeeping follow the adaptive-wait tick-loop style and
// cache-aware ring idiom used elsewhere in this codebase.

use crate::buffer::Buffer;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::os::fd::RawFd;

pub enum Entry {
    Buf(Buffer),
    File { fd: RawFd, offset: u64, len: u64 },
}

impl Entry {
    fn len(&self) -> usize {
        match self {
            Entry::Buf(b) => b.len(),
            Entry::File { len, .. } => *len as usize,
        }
    }
}

struct Pending {
    generation: u64,
    entry: Entry,
}

pub enum DrainStatus {
    Blocked,
    Closed,
    Ok,
}

/// Per-connection zero-copy send queue: *ready* entries waiting to be handed
/// to the kernel, *pending* entries the kernel has taken ownership of
/// asynchronously and not yet confirmed via completion notification.
pub struct SendQueue {
    ready: VecDeque<Entry>,
    pending: Vec<Pending>,
    ready_bytes: usize,
    oldest_enqueue_ms: Option<u64>,
    flush_bytes: usize,
    flush_count: usize,
    flush_deadline_ms: u64,
}

impl SendQueue {
    pub fn new(flush_bytes: usize, flush_count: usize, flush_deadline_ms: u64) -> Self {
        Self {
            ready: VecDeque::new(),
            pending: Vec::new(),
            ready_bytes: 0,
            oldest_enqueue_ms: None,
            flush_bytes,
            flush_count,
            flush_deadline_ms,
        }
    }

    pub fn enqueue_buffer(&mut self, buf: Buffer, now_ms: u64) {
        self.ready_bytes += buf.len();
        self.ready.push_back(Entry::Buf(buf));
        self.oldest_enqueue_ms.get_or_insert(now_ms);
    }

    pub fn enqueue_file(&mut self, fd: RawFd, offset: u64, len: u64, now_ms: u64) {
        self.ready_bytes += len as usize;
        self.ready.push_back(Entry::File { fd, offset, len });
        self.oldest_enqueue_ms.get_or_insert(now_ms);
    }

    pub fn queued_bytes(&self) -> usize {
        self.ready_bytes + self.pending.iter().map(|p| p.entry.len()).sum::<usize>()
    }

    /// Batching gate: flush once ≥K entries or ≥T bytes have accumulated, or
    /// the oldest entry has waited ≥D ms.
    pub fn should_flush(&self, now_ms: u64) -> bool {
        if self.ready.is_empty() {
            return false;
        }
        if self.ready.len() >= self.flush_count || self.ready_bytes >= self.flush_bytes {
            return true;
        }
        if let Some(oldest) = self.oldest_enqueue_ms {
            return now_ms.saturating_sub(oldest) >= self.flush_deadline_ms;
        }
        false
    }

    pub fn pending_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    /// Builds up to 64 scatter-gather segments from `ready` and hands them to
    /// `sendv`, which returns `(bytes_accepted, took_ownership_async, would_block)`.
    /// `took_ownership_async` entries move to `pending` keyed by `next_generation()`;
    /// the rest release their references immediately.
    pub fn drain<F>(&mut self, mut sendv: F) -> DrainStatus
    where
        F: FnMut(&[&[u8]]) -> std::io::Result<(usize, bool)>,
    {
        const MAX_SEGMENTS: usize = 64;
        if self.ready.is_empty() {
            return DrainStatus::Ok;
        }

        let mut slices: SmallVec<[&[u8]; MAX_SEGMENTS]> = SmallVec::new();
        let mut owned_bufs: SmallVec<[&Buffer; MAX_SEGMENTS]> = SmallVec::new();
        for entry in self.ready.iter().take(MAX_SEGMENTS) {
            match entry {
                Entry::Buf(b) => {
                    slices.push(b.as_slice());
                    owned_bufs.push(b);
                }
                Entry::File { .. } => {
                    // File segments are sent via a separate sendfile-equivalent
                    // path by the caller; stop batching here so ordering (FIFO)
                    // is preserved across the file boundary.
                    break;
                }
            }
        }

        if slices.is_empty() {
            // Head of ready is a File entry: let the caller special-case it.
            return DrainStatus::Ok;
        }

        match sendv(&slices) {
            Ok((accepted, async_owned)) => {
                let mut remaining = accepted;
                while remaining > 0 {
                    match self.ready.front() {
                        Some(Entry::Buf(b)) if b.len() <= remaining => {
                            remaining -= b.len();
                            self.ready_bytes -= b.len();
                            let entry = self.ready.pop_front().unwrap();
                            if async_owned {
                                let generation = match &entry {
                                    Entry::Buf(b) => b.generation(),
                                    _ => unreachable!(),
                                };
                                self.pending.push(Pending { generation, entry });
                            }
                            // else: drop entry now, releasing the buffer reference.
                        }
                        _ => break,
                    }
                }
                if self.ready.is_empty() {
                    self.oldest_enqueue_ms = None;
                }
                DrainStatus::Ok
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => DrainStatus::Blocked,
            Err(_) => DrainStatus::Closed,
        }
    }

    /// Completion notification for a contiguous range of generation ids:
    /// every matching pending entry is removed and its reference released.
    pub fn on_completion(&mut self, from_generation: u64, to_generation: u64) {
        self.pending
            .retain(|p| !(p.generation >= from_generation && p.generation <= to_generation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::config::Pool;

    fn pool() -> BufferPool {
        BufferPool::new(&Pool {
            max_packet_size: 256,
            initial_buffers: 8,
            max_buffers: 16,
            low_watermark: 2,
            high_watermark: 6,
            control_reserve: 2,
        })
        .unwrap()
    }

    #[test]
    fn synchronous_send_releases_immediately() {
        let p = pool();
        let mut q = SendQueue::new(usize::MAX, 100, 100_000);
        let mut buf = p.acquire().unwrap();
        buf.as_mut_slice()[0] = 1;
        buf.set_len(10);
        q.enqueue_buffer(buf, 0);
        assert_eq!(q.queued_bytes(), 10);
        let status = q.drain(|slices| Ok((slices.iter().map(|s| s.len()).sum(), false)));
        assert!(matches!(status, DrainStatus::Ok));
        assert_eq!(q.queued_bytes(), 0);
        assert!(q.pending_empty());
    }

    #[test]
    fn async_send_moves_to_pending_until_completion() {
        let p = pool();
        let mut q = SendQueue::new(usize::MAX, 100, 100_000);
        let mut buf = p.acquire().unwrap();
        buf.set_len(5);
        let gen = buf.generation();
        q.enqueue_buffer(buf, 0);
        let _ = q.drain(|slices| Ok((slices.iter().map(|s| s.len()).sum(), true)));
        assert!(!q.pending_empty());
        q.on_completion(gen, gen);
        assert!(q.pending_empty());
    }

    #[test]
    fn would_block_keeps_entries_queued() {
        let p = pool();
        let mut q = SendQueue::new(usize::MAX, 100, 100_000);
        let mut buf = p.acquire().unwrap();
        buf.set_len(5);
        q.enqueue_buffer(buf, 0);
        let status = q.drain(|_| Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)));
        assert!(matches!(status, DrainStatus::Blocked));
        assert_eq!(q.queued_bytes(), 5);
    }

    #[test]
    fn should_flush_respects_count_bytes_and_deadline() {
        let p = pool();
        let mut q = SendQueue::new(1000, 3, 50);
        assert!(!q.should_flush(0));
        for _ in 0..3 {
            let mut b = p.acquire().unwrap();
            b.set_len(1);
            q.enqueue_buffer(b, 0);
        }
        assert!(q.should_flush(0)); // count threshold
        let mut q2 = SendQueue::new(1000, 100, 50);
        let mut b = p.acquire().unwrap();
        b.set_len(1);
        q2.enqueue_buffer(b, 0);
        assert!(!q2.should_flush(10));
        assert!(q2.should_flush(51)); // deadline threshold
    }
}
