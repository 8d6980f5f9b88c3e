use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-session traffic counters.
///
/// Updated by the pump tasks, read by the stats publisher and (on shutdown)
/// the final report. Plain atomics: writers never contend, readers are
/// wait-free and may observe the two directions at slightly different points
/// in time.
#[derive(Debug, Default)]
pub struct SessionCounters {
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    packets_tx: AtomicU64,
    packets_rx: AtomicU64,
    errors: AtomicU64,
    connect_count: AtomicU64,
    last_connect_unix: AtomicI64,
    last_disconnect_unix: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub packets_tx: u64,
    pub packets_rx: u64,
    pub errors: u64,
    pub connect_count: u64,
    pub last_connect_unix: i64,
    pub last_disconnect_unix: i64,
}

impl SessionCounters {
    pub fn record_tx(&self, bytes: u64) {
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: u64) {
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        self.last_connect_unix.store(unix_now(), Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.last_disconnect_unix
            .store(unix_now(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connect_count: self.connect_count.load(Ordering::Relaxed),
            last_connect_unix: self.last_connect_unix.load(Ordering::Relaxed),
            last_disconnect_unix: self.last_disconnect_unix.load(Ordering::Relaxed),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
