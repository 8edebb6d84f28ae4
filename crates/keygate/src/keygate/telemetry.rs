use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;

/// In-process counters for the two proxy planes.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    active: AtomicI64,
    total: AtomicU64,
    bytes_ingress: AtomicU64,
    bytes_egress: AtomicU64,
    udp_forwarded: AtomicU64,
    udp_dropped: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, ingress: u64, egress: u64) {
        self.bytes_ingress.fetch_add(ingress, Ordering::Relaxed);
        self.bytes_egress.fetch_add(egress, Ordering::Relaxed);
    }

    pub fn inc_udp_forwarded(&self) {
        self.udp_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_udp_dropped(&self) {
        self.udp_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active.load(Ordering::Relaxed),
            total_connections_handled: self.total.load(Ordering::Relaxed),
            bytes_ingress: self.bytes_ingress.load(Ordering::Relaxed),
            bytes_egress: self.bytes_egress.load(Ordering::Relaxed),
            udp_forwarded: self.udp_forwarded.load(Ordering::Relaxed),
            udp_dropped: self.udp_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub total_connections_handled: u64,
    pub bytes_ingress: u64,
    pub bytes_egress: u64,
    pub udp_forwarded: u64,
    pub udp_dropped: u64,
}

/// One live login splice.
#[derive(Debug, Clone)]
pub struct LoginSession {
    /// Canonical name the login was rewritten to.
    pub player: String,
    /// Hostname the client dialed (token + base domain).
    pub host: String,
    pub client: String,
    /// Unix seconds at splice start.
    pub started_unix: u64,
}

/// Live login sessions keyed by a registry-assigned id. Ids grow with
/// insertion order, so snapshots come back oldest first.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    live: DashMap<u64, LoginSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session; the returned id retires it again.
    pub fn open(&self, player: &str, host: &str, client: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let started_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.live.insert(
            id,
            LoginSession {
                player: player.to_string(),
                host: host.to_string(),
                client: client.to_string(),
                started_unix,
            },
        );
        id
    }

    pub fn close(&self, id: u64) {
        self.live.remove(&id);
    }

    pub fn snapshot(&self) -> Vec<(u64, LoginSession)> {
        let mut out: Vec<_> = self
            .live
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }
}

pub type SharedMetrics = Arc<MetricsCollector>;
pub type SharedSessions = Arc<SessionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsCollector::new();
        m.inc_active();
        m.inc_active();
        m.dec_active();
        m.add_bytes(100, 40);
        m.inc_udp_forwarded();
        m.inc_udp_dropped();
        m.inc_udp_dropped();

        let s = m.snapshot();
        assert_eq!(s.active_connections, 1);
        assert_eq!(s.total_connections_handled, 2);
        assert_eq!(s.bytes_ingress, 100);
        assert_eq!(s.bytes_egress, 40);
        assert_eq!(s.udp_forwarded, 1);
        assert_eq!(s.udp_dropped, 2);
    }

    #[test]
    fn registry_assigns_ids_in_order() {
        let reg = SessionRegistry::new();
        let a = reg.open("RealOne", "tokABC.play.example.com", "127.0.0.1:5000");
        let b = reg.open("Other_99", "tokXYZ.play.example.com", "127.0.0.1:5001");
        assert!(a < b);

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, a);
        assert_eq!(snap[0].1.player, "RealOne");
        assert_eq!(snap[1].1.host, "tokXYZ.play.example.com");

        reg.close(a);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, b);

        // closing an already-closed id is harmless
        reg.close(a);
        assert_eq!(reg.snapshot().len(), 1);
    }
}
