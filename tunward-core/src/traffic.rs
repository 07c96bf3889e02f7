//! Process-wide traffic counters.
//!
//! Constructed once at tunnel start and passed by handle to every
//! component that records traffic; the status reporter polls
//! `snapshot()` on its own schedule.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    connections_proxy: AtomicU64,
    connections_direct: AtomicU64,
    connections_blocked: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero all counters (called at tunnel start)
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.packets_in.store(0, Ordering::Relaxed);
        self.packets_out.store(0, Ordering::Relaxed);
        self.connections_proxy.store(0, Ordering::Relaxed);
        self.connections_direct.store(0, Ordering::Relaxed);
        self.connections_blocked.store(0, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_packet_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_proxy_connection(&self) {
        self.connections_proxy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_direct_connection(&self) {
        self.connections_direct.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_blocked_connection(&self) {
        self.connections_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn connections_blocked(&self) -> u64 {
        self.connections_blocked.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            connections_proxy: self.connections_proxy.load(Ordering::Relaxed),
            connections_direct: self.connections_direct.load(Ordering::Relaxed),
            connections_blocked: self.connections_blocked.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub connections_proxy: u64,
    pub connections_direct: u64,
    pub connections_blocked: u64,
}

impl std::fmt::Display for TrafficSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "up {} / down {}, {} proxied, {} direct, {} blocked",
            format_bytes(self.bytes_out),
            format_bytes(self.bytes_in),
            self.connections_proxy,
            self.connections_direct,
            self.connections_blocked
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = TrafficStats::new();
        stats.add_bytes_in(100);
        stats.add_bytes_in(50);
        stats.add_bytes_out(1024);
        stats.add_packet_in();
        stats.add_packet_out();
        stats.add_proxy_connection();
        stats.add_direct_connection();
        stats.add_blocked_connection();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_in, 150);
        assert_eq!(snap.bytes_out, 1024);
        assert_eq!(snap.packets_in, 1);
        assert_eq!(snap.packets_out, 1);
        assert_eq!(snap.connections_proxy, 1);
        assert_eq!(snap.connections_direct, 1);
        assert_eq!(snap.connections_blocked, 1);
    }

    #[test]
    fn test_reset() {
        let stats = TrafficStats::new();
        stats.add_bytes_in(999);
        stats.reset();
        assert_eq!(stats.snapshot().bytes_in, 0);
    }

    #[test]
    fn test_format_bytes_thresholds() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }
}
