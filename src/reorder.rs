// src/reorder.rs
//
// RTP reordering window: a fixed ring keyed by sequence number, over RTP's
// 16-bit wrapping sequence space.

use crate::buffer::Buffer;

/// Half the 16-bit sequence space; the wrap-tolerance split between "late
/// arrival" and "stream reset".
const WRAP_HALF: u16 = 0x8000;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReorderStats {
    pub out_of_order: u64,
    pub duplicates: u64,
    pub recovered: u64,
    pub drops: u64,
}

struct Slot {
    seq: u16,
    buf: Buffer,
}

/// Fixed 16-slot ring keyed by `seq mod W`, timeout-bounded hole filling.
pub struct ReorderWindow {
    window: usize, // W
    timeout_ms: u64,
    slots: Vec<Option<Slot>>,
    expected_seq: Option<u16>,
    waiting: bool,
    wait_start_ms: u64,
    pub stats: ReorderStats,
    pub enabled: bool,
}

/// Packets the window wants emitted, in order, as a result of one `push` call.
pub type Emitted = Vec<Buffer>;

impl ReorderWindow {
    pub fn new(window: usize, timeout_ms: u64) -> Self {
        let mut slots = Vec::with_capacity(window);
        slots.resize_with(window, || None);
        Self {
            window,
            timeout_ms,
            slots,
            expected_seq: None,
            waiting: false,
            wait_start_ms: 0,
            stats: ReorderStats::default(),
            enabled: true,
        }
    }

    fn slot_index(&self, seq: u16) -> usize {
        (seq as usize) % self.window
    }

    fn wrapping_delta(a: u16, b: u16) -> i32 {
        // a - b, wrap-aware, in [-32768, 32767]
        (a.wrapping_sub(b)) as i16 as i32
    }

    fn reset(&mut self, seq: u16) {
        for s in self.slots.iter_mut() {
            *s = None;
        }
        self.expected_seq = Some(seq);
        self.waiting = false;
    }

    /// Drain any contiguous run starting at `expected_seq` into `out`.
    fn flush_contiguous(&mut self, out: &mut Emitted) {
        loop {
            let expected = match self.expected_seq {
                Some(s) => s,
                None => return,
            };
            let idx = self.slot_index(expected);
            match self.slots[idx].take() {
                Some(slot) if slot.seq == expected => {
                    out.push(slot.buf);
                    self.expected_seq = Some(expected.wrapping_add(1));
                }
                Some(other) => {
                    // Slot held a stale/mismatched entry (shouldn't normally
                    // happen within window bounds); put it back untouched is
                    // not meaningful since it's not `expected` — drop it.
                    self.slots[idx] = Some(other);
                    return;
                }
                None => return,
            }
        }
    }

    /// `now_ms` is a monotonic millisecond clock, used only for the
    /// hole-filling timeout; RTSP-over-TCP disables reordering entirely
    /// (`enabled = false`) since TCP already orders bytes for us.
    pub fn push(&mut self, seq: u16, buf: Buffer, now_ms: u64) -> Emitted {
        let mut out = Emitted::new();
        if !self.enabled {
            out.push(buf);
            return out;
        }

        let expected = match self.expected_seq {
            None => {
                self.expected_seq = Some(seq);
                out.push(buf);
                return out;
            }
            Some(e) => e,
        };

        let delta = Self::wrapping_delta(seq, expected);

        if delta == 0 {
            out.push(buf);
            self.expected_seq = Some(expected.wrapping_add(1));
            self.flush_contiguous(&mut out);
            return out;
        }

        if delta > 0 && (delta as usize) < self.window {
            // Ahead, within the window: buffer it.
            let idx = self.slot_index(seq);
            if self.slots[idx].is_some() {
                self.stats.duplicates += 1;
                return out;
            }
            self.slots[idx] = Some(Slot { seq, buf });
            self.stats.out_of_order += 1;
            if !self.waiting {
                self.waiting = true;
                self.wait_start_ms = now_ms;
            }
            return out;
        }

        if delta < 0 && delta > -(WRAP_HALF as i32) {
            // Behind (late arrival / duplicate), within grace.
            self.stats.duplicates += 1;
            return out;
        }

        // Too far ahead, or far behind past the ±W/2 wrap-tolerance split:
        // treat as a stream reset.
        self.reset(seq);
        out.push(buf);
        out
    }

    /// Called once per worker tick; declares the held gap lost once
    /// `RTP_REORDER_TIMEOUT_MS` has elapsed since the first hole was observed.
    pub fn tick(&mut self, now_ms: u64) -> Emitted {
        let mut out = Emitted::new();
        if !self.waiting {
            return out;
        }
        if now_ms.saturating_sub(self.wait_start_ms) < self.timeout_ms {
            return out;
        }
        // Declare the missing packet lost: advance past the gap, counted as
        // a drop, then flush whatever is now contiguous.
        if let Some(expected) = self.expected_seq {
            self.stats.drops += 1;
            self.expected_seq = Some(expected.wrapping_add(1));
            self.stats.recovered += 1;
        }
        self.flush_contiguous(&mut out);
        self.waiting = self.slots.iter().any(|s| s.is_some());
        if self.waiting {
            self.wait_start_ms = now_ms;
        }
        out
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
            initial_buffers: 32,
            max_buffers: 64,
            low_watermark: 4,
            high_watermark: 16,
            control_reserve: 2,
        })
        .unwrap()
    }

    fn tag(pool: &BufferPool, seq: u16) -> Buffer {
        let mut b = pool.acquire().unwrap();
        b.as_mut_slice()[0..2].copy_from_slice(&seq.to_be_bytes());
        b.set_len(2);
        b
    }

    fn seq_of(b: &Buffer) -> u16 {
        u16::from_be_bytes([b.as_slice()[0], b.as_slice()[1]])
    }

    #[test]
    fn in_order_passes_straight_through() {
        let p = pool();
        let mut w = ReorderWindow::new(16, 50);
        for s in 100u16..105 {
            let out = w.push(s, tag(&p, s), 0);
            assert_eq!(out.len(), 1);
            assert_eq!(seq_of(&out[0]), s);
        }
        assert_eq!(w.stats.out_of_order, 0);
    }

    #[test]
    fn reorders_within_window() {
        let p = pool();
        let mut w = ReorderWindow::new(16, 50);
        let mut emitted = Vec::new();
        for s in [100u16, 101, 103, 102, 104] {
            emitted.extend(w.push(s, tag(&p, s), 0));
        }
        let seqs: Vec<u16> = emitted.iter().map(seq_of).collect();
        assert_eq!(seqs, vec![100, 101, 102, 103, 104]);
        assert_eq!(w.stats.out_of_order, 1);
        assert_eq!(w.stats.recovered, 0);
    }

    #[test]
    fn timeout_declares_loss_and_advances() {
        let p = pool();
        let mut w = ReorderWindow::new(16, 50);
        let mut emitted = Vec::new();
        for s in [200u16, 201, 203] {
            emitted.extend(w.push(s, tag(&p, s), 0));
        }
        // seq 202 missing; advance clock past the timeout.
        emitted.extend(w.tick(51));
        let seqs: Vec<u16> = emitted.iter().map(seq_of).collect();
        assert_eq!(seqs, vec![200, 201, 203]);
        assert_eq!(w.stats.drops, 1);
    }

    #[test]
    fn sequence_wrap_is_treated_as_expected_next() {
        let p = pool();
        let mut w = ReorderWindow::new(16, 50);
        let a = w.push(0xFFFF, tag(&p, 0xFFFF), 0);
        assert_eq!(a.len(), 1);
        let b = w.push(0x0000, tag(&p, 0x0000), 0);
        assert_eq!(b.len(), 1);
        assert_eq!(seq_of(&b[0]), 0x0000);
        assert_eq!(w.stats.out_of_order, 0);
    }

    #[test]
    fn far_behind_is_treated_as_stream_reset() {
        let p = pool();
        let mut w = ReorderWindow::new(16, 50);
        let _ = w.push(1000, tag(&p, 1000), 0);
        // jump far behind (more than W/2 back, wrap-aware) -> reset, not dup
        let out = w.push(1000u16.wrapping_sub(40000), tag(&p, 1000u16.wrapping_sub(40000)), 0);
        assert_eq!(out.len(), 1);
    }
}
