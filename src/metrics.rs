//! Lightweight Prometheus-compatible metrics for a chat peer.
//!
//! Uses atomic counters for lock-free instrumentation from the accept,
//! receive and discovery threads. Rendered in Prometheus text exposition
//! format by the console's `/stats` command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by the registry and the discovery service.
pub struct Metrics {
    /// TCP links registered, inbound and outbound (counter)
    pub connections_opened_total: AtomicU64,
    /// TCP links torn down (counter)
    pub connections_closed_total: AtomicU64,
    /// Links approved, locally or by the remote side (counter)
    pub handshakes_accepted_total: AtomicU64,
    /// Links refused, locally or by the remote side (counter)
    pub handshakes_rejected_total: AtomicU64,
    /// Chat messages written to approved links (counter)
    pub chat_sent_total: AtomicU64,
    /// Chat messages delivered to the observer (counter)
    pub chat_received_total: AtomicU64,
    /// Frames dropped: malformed, oversize, or chat on an unapproved link (counter)
    pub frames_dropped_total: AtomicU64,
    /// Distinct peers found by discovery (counter)
    pub peers_discovered_total: AtomicU64,
    /// Peer start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_opened_total: AtomicU64::new(0),
            connections_closed_total: AtomicU64::new(0),
            handshakes_accepted_total: AtomicU64::new(0),
            handshakes_rejected_total: AtomicU64::new(0),
            chat_sent_total: AtomicU64::new(0),
            chat_received_total: AtomicU64::new(0),
            frames_dropped_total: AtomicU64::new(0),
            peers_discovered_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters = [
            ("connections_opened_total", "TCP links registered", &self.connections_opened_total),
            ("connections_closed_total", "TCP links torn down", &self.connections_closed_total),
            ("handshakes_accepted_total", "Links approved", &self.handshakes_accepted_total),
            ("handshakes_rejected_total", "Links refused", &self.handshakes_rejected_total),
            ("chat_sent_total", "Chat messages sent", &self.chat_sent_total),
            ("chat_received_total", "Chat messages received", &self.chat_received_total),
            ("frames_dropped_total", "Frames dropped", &self.frames_dropped_total),
            ("peers_discovered_total", "Peers found by discovery", &self.peers_discovered_total),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP lan_chat_{name} {help}\n\
                 # TYPE lan_chat_{name} counter\n\
                 lan_chat_{name} {}\n",
                value.load(Ordering::Relaxed),
            ));
        }
        out.push_str(&format!(
            "# HELP lan_chat_uptime_seconds Peer uptime in seconds\n\
             # TYPE lan_chat_uptime_seconds gauge\n\
             lan_chat_uptime_seconds {}\n",
            self.start_time.elapsed().as_secs(),
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        m.chat_sent_total.fetch_add(42, Ordering::Relaxed);
        m.connections_opened_total.fetch_add(3, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("lan_chat_chat_sent_total 42"));
        assert!(output.contains("lan_chat_connections_opened_total 3"));
        assert!(output.contains("lan_chat_frames_dropped_total 0"));
        assert!(output.contains("# TYPE lan_chat_handshakes_rejected_total counter"));
        assert!(output.contains("# TYPE lan_chat_uptime_seconds gauge"));
    }

    #[test]
    fn test_metrics_incr() {
        let m = Metrics::new();
        Metrics::incr(&m.peers_discovered_total);
        Metrics::incr(&m.peers_discovered_total);
        assert_eq!(m.peers_discovered_total.load(Ordering::Relaxed), 2);
    }
}
