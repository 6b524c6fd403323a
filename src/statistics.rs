//! Per-session traffic accounting.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(u64),
    ReceivedFrames(u64),
    SendBytes(u64),
    SendFrames(u64),
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Session-scoped counters.
#[derive(Default)]
pub struct Counts<T> {
    pub received_bytes: T,
    pub received_frames: T,
    pub send_bytes: T,
    pub send_frames: T,
}

impl Counts<Count> {
    fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedFrames(v) => self.received_frames.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendFrames(v) => self.send_frames.add(*v),
        }
    }
}

/// Peer-keyed statistics shared by the service and its sessions.
#[derive(Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<String, Counts<Count>>>>);

impl Default for Statistics {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(16))))
    }
}

impl Statistics {
    /// Add a peer to the watch list.
    pub fn register(&self, peer: &str) {
        self.0.write().insert(peer.to_string(), Counts::default());
    }

    /// Remove a peer from the watch list.
    pub fn unregister(&self, peer: &str) {
        self.0.write().remove(peer);
    }

    pub fn get(&self, peer: &str) -> Option<Counts<u64>> {
        self.0.read().get(peer).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_frames: counts.received_frames.get(),
            send_bytes: counts.send_bytes.get(),
            send_frames: counts.send_frames.get(),
        })
    }

    pub fn get_reporter(&self) -> StatisticsReporter {
        StatisticsReporter(self.0.clone())
    }
}

/// Held by sessions; feeds the shared counters.
#[derive(Clone)]
pub struct StatisticsReporter(Arc<RwLock<AHashMap<String, Counts<Count>>>>);

impl StatisticsReporter {
    pub fn send(&self, peer: &str, reports: &[Stats]) {
        if let Some(counts) = self.0.read().get(peer) {
            for item in reports {
                counts.add(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_peer() {
        let statistics = Statistics::default();
        statistics.register("zone-a");

        let reporter = statistics.get_reporter();
        reporter.send("zone-a", &[Stats::ReceivedBytes(100), Stats::ReceivedFrames(1)]);
        reporter.send("zone-a", &[Stats::ReceivedBytes(20)]);
        // Unknown peers are ignored.
        reporter.send("zone-b", &[Stats::ReceivedBytes(999)]);

        let counts = statistics.get("zone-a").unwrap();
        assert_eq!(counts.received_bytes, 120);
        assert_eq!(counts.received_frames, 1);
        assert!(statistics.get("zone-b").is_none());

        statistics.unregister("zone-a");
        assert!(statistics.get("zone-a").is_none());
    }
}
