//! Process-wide request counters.
//!
//! Hot fields are atomics touched on every command; a mutex guards only the
//! snapshot/reset path so the `stats` command sees a coherent view.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters exposed by the `stats` command.
pub struct Stats {
    pub curr_conns: AtomicU32,
    pub total_conns: AtomicU32,
    pub conn_structs: AtomicU32,
    pub get_cmds: AtomicU64,
    pub set_cmds: AtomicU64,
    pub delete_cmds: AtomicU64,
    pub slow_cmds: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Unix time the process came up, skewed 2s into the past so uptime is
    /// never reported as zero.
    pub started: i64,
    snapshot_lock: Mutex<()>,
}

/// A consistent copy of the counters, taken under the snapshot lock.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub curr_conns: u32,
    pub total_conns: u32,
    pub conn_structs: u32,
    pub get_cmds: u64,
    pub set_cmds: u64,
    pub delete_cmds: u64,
    pub slow_cmds: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub started: i64,
}

impl Stats {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Stats {
            curr_conns: AtomicU32::new(0),
            total_conns: AtomicU32::new(0),
            conn_structs: AtomicU32::new(0),
            get_cmds: AtomicU64::new(0),
            set_cmds: AtomicU64::new(0),
            delete_cmds: AtomicU64::new(0),
            slow_cmds: AtomicU64::new(0),
            get_hits: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            started: now - 2,
            snapshot_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let _guard = self.snapshot_lock.lock().unwrap_or_else(|e| e.into_inner());
        StatsSnapshot {
            curr_conns: self.curr_conns.load(Ordering::Relaxed),
            total_conns: self.total_conns.load(Ordering::Relaxed),
            conn_structs: self.conn_structs.load(Ordering::Relaxed),
            get_cmds: self.get_cmds.load(Ordering::Relaxed),
            set_cmds: self.set_cmds.load(Ordering::Relaxed),
            delete_cmds: self.delete_cmds.load(Ordering::Relaxed),
            slow_cmds: self.slow_cmds.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            started: self.started,
        }
    }

    /// Zero the resettable counters (`stats reset`). Connection gauges and
    /// the start time survive a reset.
    pub fn reset(&self) {
        let _guard = self.snapshot_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.total_conns.store(0, Ordering::Relaxed);
        self.get_cmds.store(0, Ordering::Relaxed);
        self.set_cmds.store(0, Ordering::Relaxed);
        self.delete_cmds.store(0, Ordering::Relaxed);
        self.slow_cmds.store(0, Ordering::Relaxed);
        self.get_hits.store(0, Ordering::Relaxed);
        self.get_misses.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
