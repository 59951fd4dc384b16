// src/status.rs
//
// Per-client status table + HTML/SSE/admin surface (the `/<status-route>`
// family). Distinct from the ambient `/metrics` exporter in `metrics.rs`:
// this module is the core's own HTTP surface, routed through each worker's
// own connection handling rather than a separate server.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct StatusCell {
    pub in_use: AtomicBool,
    pub remote_addr: std::sync::Mutex<String>,
    pub display_url: std::sync::Mutex<String>,
    pub bytes_sent: AtomicU64,
    pub bandwidth_bps: AtomicU64,
    pub queue_depth_bytes: AtomicU64,
    pub high_watermark_bytes: AtomicU64,
    pub drops: AtomicU64,
    pub slow: AtomicBool,
    pub disconnect_requested: AtomicBool,
}

/// Fixed-size, single-writer-per-cell table (one worker owns each client's
/// cell; an in-process approximation of a shared-memory status region, see
/// DESIGN.md "Worker process model"). `-1` means unregistered.
pub struct StatusTable {
    cells: Vec<StatusCell>,
    next_free_hint: AtomicI64,
}

impl StatusTable {
    pub fn new(capacity: usize) -> Arc<Self> {
        let mut cells = Vec::with_capacity(capacity);
        cells.resize_with(capacity, StatusCell::default);
        Arc::new(Self {
            cells,
            next_free_hint: AtomicI64::new(0),
        })
    }

    /// Registers a client, returning its index, or −1 if the table is full.
    pub fn register(&self, remote_addr: &str, display_url: &str) -> i64 {
        let start = self.next_free_hint.load(Ordering::Relaxed).max(0) as usize;
        for offset in 0..self.cells.len() {
            let idx = (start + offset) % self.cells.len();
            let cell = &self.cells[idx];
            if cell
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *cell.remote_addr.lock().unwrap() = remote_addr.to_string();
                *cell.display_url.lock().unwrap() = display_url.to_string();
                cell.bytes_sent.store(0, Ordering::Relaxed);
                cell.bandwidth_bps.store(0, Ordering::Relaxed);
                cell.queue_depth_bytes.store(0, Ordering::Relaxed);
                cell.high_watermark_bytes.store(0, Ordering::Relaxed);
                cell.drops.store(0, Ordering::Relaxed);
                cell.slow.store(false, Ordering::Relaxed);
                cell.disconnect_requested.store(false, Ordering::Relaxed);
                self.next_free_hint.store((idx + 1) as i64, Ordering::Relaxed);
                return idx as i64;
            }
        }
        -1
    }

    pub fn unregister(&self, index: i64) {
        if let Some(cell) = self.cell(index) {
            cell.in_use.store(false, Ordering::Release);
        }
    }

    pub fn cell(&self, index: i64) -> Option<&StatusCell> {
        if index < 0 {
            return None;
        }
        self.cells.get(index as usize)
    }

    pub fn update(
        &self,
        index: i64,
        bytes_sent: u64,
        bandwidth_bps: u64,
        queue_depth_bytes: u64,
        drops: u64,
        slow: bool,
    ) {
        if let Some(cell) = self.cell(index) {
            cell.bytes_sent.store(bytes_sent, Ordering::Relaxed);
            cell.bandwidth_bps.store(bandwidth_bps, Ordering::Relaxed);
            cell.queue_depth_bytes.store(queue_depth_bytes, Ordering::Relaxed);
            let hw = cell.high_watermark_bytes.load(Ordering::Relaxed);
            if queue_depth_bytes > hw {
                cell.high_watermark_bytes.store(queue_depth_bytes, Ordering::Relaxed);
            }
            cell.drops.store(drops, Ordering::Relaxed);
            cell.slow.store(slow, Ordering::Relaxed);
        }
    }

    pub fn active_count(&self) -> usize {
        self.cells.iter().filter(|c| c.in_use.load(Ordering::Acquire)).count()
    }

    pub fn request_disconnect(&self, index: i64) -> bool {
        match self.cell(index) {
            Some(cell) if cell.in_use.load(Ordering::Acquire) => {
                cell.disconnect_requested.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn render_html(&self) -> String {
        let mut out = String::from(
            "<html><head><title>rtp2httpd-rs status</title></head><body><table border=1>\n\
             <tr><th>#</th><th>remote</th><th>url</th><th>bytes</th><th>bw</th>\
             <th>queue</th><th>hwm</th><th>drops</th><th>slow</th></tr>\n",
        );
        for (i, cell) in self.cells.iter().enumerate() {
            if !cell.in_use.load(Ordering::Acquire) {
                continue;
            }
            let _ = writeln!(
                out,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                i,
                cell.remote_addr.lock().unwrap(),
                cell.display_url.lock().unwrap(),
                cell.bytes_sent.load(Ordering::Relaxed),
                cell.bandwidth_bps.load(Ordering::Relaxed),
                cell.queue_depth_bytes.load(Ordering::Relaxed),
                cell.high_watermark_bytes.load(Ordering::Relaxed),
                cell.drops.load(Ordering::Relaxed),
                cell.slow.load(Ordering::Relaxed),
            );
        }
        out.push_str("</table></body></html>\n");
        out
    }

    pub fn render_sse_event(&self) -> String {
        let mut payload = String::from("{\"clients\":[");
        let mut first = true;
        for (i, cell) in self.cells.iter().enumerate() {
            if !cell.in_use.load(Ordering::Acquire) {
                continue;
            }
            if !first {
                payload.push(',');
            }
            first = false;
            let _ = write!(
                payload,
                "{{\"index\":{},\"bytes_sent\":{},\"bandwidth_bps\":{},\"slow\":{}}}",
                i,
                cell.bytes_sent.load(Ordering::Relaxed),
                cell.bandwidth_bps.load(Ordering::Relaxed),
                cell.slow.load(Ordering::Relaxed),
            );
        }
        payload.push_str("]}");
        format!("data: {}\n\n", payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister_frees_the_cell() {
        let t = StatusTable::new(4);
        let idx = t.register("1.2.3.4:1000", "/ch1");
        assert!(idx >= 0);
        t.unregister(idx);
        let idx2 = t.register("5.6.7.8:2000", "/ch2");
        assert!(idx2 >= 0);
    }

    #[test]
    fn table_exhaustion_returns_negative_one() {
        let t = StatusTable::new(1);
        let a = t.register("a", "/a");
        assert!(a >= 0);
        let b = t.register("b", "/b");
        assert_eq!(b, -1);
    }

    #[test]
    fn disconnect_request_is_visible_after_registration() {
        let t = StatusTable::new(2);
        let idx = t.register("a", "/a");
        assert!(t.request_disconnect(idx));
        assert!(t.cell(idx).unwrap().disconnect_requested.load(Ordering::Relaxed));
        assert!(!t.request_disconnect(-1));
    }

    #[test]
    fn html_render_includes_registered_client() {
        let t = StatusTable::new(2);
        let idx = t.register("9.9.9.9:1", "/ch1");
        t.update(idx, 1000, 500, 200, 1, false);
        let html = t.render_html();
        assert!(html.contains("9.9.9.9:1"));
        assert!(html.contains("/ch1"));
    }
}
