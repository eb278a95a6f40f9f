//! Process-wide, mutex-protected stats counters and the `stats` report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonically increasing counters plus a handful of gauges, all behind
/// plain atomics rather than a single mutex: the counters never need a
/// consistent joint snapshot, so there is no reason to serialize unrelated
/// increments behind one lock.
#[derive(Debug, Default)]
pub struct Stats {
    pub curr_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub connection_structures: AtomicU64,
    pub cmd_get: AtomicU64,
    pub cmd_set: AtomicU64,
    pub cmd_delete: AtomicU64,
    pub slow_cmd: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    started: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        let stats = Self::default();
        stats.started.store(now_secs(), Ordering::Relaxed);
        stats
    }

    pub fn conn_opened(&self) {
        self.curr_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.curr_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn conn_struct_allocated(&self) {
        self.connection_structures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self, hit: bool) {
        self.cmd_get.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.get_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_set(&self) {
        self.cmd_set.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.cmd_delete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_cmd(&self) {
        self.slow_cmd.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> u64 {
        now_secs().saturating_sub(self.started.load(Ordering::Relaxed))
    }

    /// Reset the monotonic counters to zero, as `stats reset` requires.
    /// Gauges (`curr_connections`) are left untouched.
    pub fn reset(&self) {
        self.total_connections.store(0, Ordering::Relaxed);
        self.connection_structures.store(0, Ordering::Relaxed);
        self.cmd_get.store(0, Ordering::Relaxed);
        self.cmd_set.store(0, Ordering::Relaxed);
        self.cmd_delete.store(0, Ordering::Relaxed);
        self.slow_cmd.store(0, Ordering::Relaxed);
        self.get_hits.store(0, Ordering::Relaxed);
        self.get_misses.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Resource usage as reported by `getrusage(RUSAGE_SELF, ...)`.
pub struct Rusage {
    pub user_secs: f64,
    pub system_secs: f64,
    pub maxrss_kb: i64,
}

pub fn rusage_self() -> Rusage {
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        let rc = libc::getrusage(libc::RUSAGE_SELF, &mut usage);
        if rc != 0 {
            return Rusage {
                user_secs: 0.0,
                system_secs: 0.0,
                maxrss_kb: 0,
            };
        }
        Rusage {
            user_secs: usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1_000_000.0,
            system_secs: usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1_000_000.0,
            // glibc reports ru_maxrss in KiB already, unlike BSD/macOS bytes.
            maxrss_kb: usage.ru_maxrss,
        }
    }
}

/// Render the full `stats` report as a single buffer of `STAT name value\r\n`
/// lines terminated by `END\r\n`, in the mandated metric order.
#[allow(clippy::too_many_arguments)]
pub fn render_report(
    stats: &Stats,
    item_buf_size: usize,
    curr_items: u64,
    total_items: u64,
    avail_space: u64,
    total_space: u64,
    threads: usize,
) -> Vec<u8> {
    let rusage = rusage_self();
    let now = now_secs();
    let mut out = Vec::with_capacity(1024);
    macro_rules! stat_line {
        ($name:expr, $val:expr) => {
            out.extend_from_slice(format!("STAT {} {}\r\n", $name, $val).as_bytes())
        };
    }

    stat_line!("pid", std::process::id());
    stat_line!("uptime", stats.uptime());
    stat_line!("time", now);
    stat_line!("version", "1.0.0");
    stat_line!("pointer_size", std::mem::size_of::<usize>() * 8);
    stat_line!("rusage_user", format!("{:.6}", rusage.user_secs));
    stat_line!("rusage_system", format!("{:.6}", rusage.system_secs));
    stat_line!("rusage_maxrss", rusage.maxrss_kb);
    stat_line!("item_buf_size", item_buf_size);
    stat_line!(
        "curr_connections",
        stats.curr_connections.load(Ordering::Relaxed)
    );
    stat_line!(
        "total_connections",
        stats.total_connections.load(Ordering::Relaxed)
    );
    stat_line!(
        "connection_structures",
        stats.connection_structures.load(Ordering::Relaxed)
    );
    stat_line!("cmd_get", stats.cmd_get.load(Ordering::Relaxed));
    stat_line!("cmd_set", stats.cmd_set.load(Ordering::Relaxed));
    stat_line!("cmd_delete", stats.cmd_delete.load(Ordering::Relaxed));
    stat_line!("slow_cmd", stats.slow_cmd.load(Ordering::Relaxed));
    stat_line!("get_hits", stats.get_hits.load(Ordering::Relaxed));
    stat_line!("get_misses", stats.get_misses.load(Ordering::Relaxed));
    stat_line!("curr_items", curr_items);
    stat_line!("total_items", total_items);
    stat_line!("avail_space", avail_space);
    stat_line!("total_space", total_space);
    stat_line!("bytes_read", stats.bytes_read.load(Ordering::Relaxed));
    stat_line!("bytes_written", stats.bytes_written.load(Ordering::Relaxed));
    stat_line!("threads", threads);
    out.extend_from_slice(b"END\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_open_close_tracks_current_and_total() {
        let stats = Stats::new();
        stats.conn_opened();
        stats.conn_opened();
        stats.conn_closed();
        assert_eq!(stats.curr_connections.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn record_get_splits_hits_and_misses() {
        let stats = Stats::new();
        stats.record_get(true);
        stats.record_get(false);
        stats.record_get(false);
        assert_eq!(stats.cmd_get.load(Ordering::Relaxed), 3);
        assert_eq!(stats.get_hits.load(Ordering::Relaxed), 1);
        assert_eq!(stats.get_misses.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn reset_clears_counters_but_not_curr_connections() {
        let stats = Stats::new();
        stats.conn_opened();
        stats.record_set();
        stats.reset();
        assert_eq!(stats.cmd_set.load(Ordering::Relaxed), 0);
        assert_eq!(stats.curr_connections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn render_report_ends_with_end_marker() {
        let stats = Stats::new();
        let report = render_report(&stats, 16384, 0, 0, 0, 0, 4);
        let text = String::from_utf8(report).unwrap();
        assert!(text.ends_with("END\r\n"));
        assert!(text.starts_with("STAT pid "));
    }
}
