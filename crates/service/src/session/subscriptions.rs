//! Per-session subscription state.
//!
//! Two tables per session: `served` subscriptions were created by peer
//! SUBSCRIBE requests and feed the notification dispatcher; `watched`
//! subscriptions are ones this side created on the peer, keyed by the
//! id our client allocated for them. Ids are allocated by the
//! subscribing side from an atomic monotonic counter, so each
//! direction's id space is independent.
//!
//! The dispatcher runs one task per served subscription. Changes
//! coalesce last-writer-wins while the min-interval gate is closed;
//! the max interval forces an unconditional heartbeat even when
//! nothing changed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use ciborium::Value;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use codec::message::Notification;

/// One subscription, either direction.
///
/// An empty attribute list matches every attribute of the feature.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u32,
    pub endpoint: u8,
    pub feature: u8,
    pub attributes: Vec<u16>,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Subscription {
    /// # Test
    ///
    /// ```
    /// use std::time::Duration;
    /// use mash_service::session::subscriptions::Subscription;
    ///
    /// let sub = Subscription {
    ///     id: 1,
    ///     endpoint: 1,
    ///     feature: 2,
    ///     attributes: vec![],
    ///     min_interval: Duration::ZERO,
    ///     max_interval: Duration::ZERO,
    /// };
    ///
    /// assert!(sub.matches(1, 2, 77));
    /// assert!(!sub.matches(1, 3, 77));
    /// ```
    pub fn matches(&self, endpoint: u8, feature: u8, attribute: u16) -> bool {
        self.endpoint == endpoint
            && self.feature == feature
            && (self.attributes.is_empty() || self.attributes.contains(&attribute))
    }
}

struct ServedEntry {
    info: Subscription,
    changes: mpsc::UnboundedSender<(u16, Value)>,
    task: JoinHandle<()>,
}

/// The session's subscription tables.
pub struct SubscriptionTables {
    served: RwLock<HashMap<u32, ServedEntry>>,
    watched: RwLock<HashMap<u32, Subscription>>,
    next_watched_id: AtomicU32,
}

impl Default for SubscriptionTables {
    fn default() -> Self {
        Self {
            served: RwLock::new(HashMap::new()),
            watched: RwLock::new(HashMap::new()),
            next_watched_id: AtomicU32::new(0),
        }
    }
}

impl SubscriptionTables {
    /// Registers a peer-created subscription and spawns its dispatcher
    /// task. Notifications flow into `sink`.
    pub fn insert_served(&self, info: Subscription, sink: mpsc::UnboundedSender<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(dispatch(info.clone(), rx, sink));

        // A re-subscribe with an id already in the table replaces the
        // old entry; its dispatcher winds down with the dropped sender.
        if let Some(previous) = self.served.write().insert(
            info.id,
            ServedEntry {
                info,
                changes: tx,
                task,
            },
        ) {
            previous.task.abort();
        }
    }

    pub fn remove_served(&self, id: u32) -> bool {
        match self.served.write().remove(&id) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Allocates the id for a subscription this side is about to
    /// create on the peer.
    pub fn allocate_watched_id(&self) -> u32 {
        self.next_watched_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert_watched(&self, info: Subscription) {
        self.watched.write().insert(info.id, info);
    }

    pub fn remove_watched(&self, id: u32) -> Option<Subscription> {
        self.watched.write().remove(&id)
    }

    pub fn watched(&self, id: u32) -> Option<Subscription> {
        self.watched.read().get(&id).cloned()
    }

    /// Routes one attribute change to every matching served
    /// subscription. Separate subscriptions to the same feature are
    /// independent; each gets its own copy.
    pub fn notify_change(&self, endpoint: u8, feature: u8, attribute: u16, value: &Value) {
        for entry in self.served.read().values() {
            if entry.info.matches(endpoint, feature, attribute) {
                let _ = entry.changes.send((attribute, value.clone()));
            }
        }
    }

    pub fn served_count(&self) -> usize {
        self.served.read().len()
    }

    /// Drops both tables; dispatcher tasks stop with their senders.
    pub fn clear(&self) {
        let mut served = self.served.write();
        for (_, entry) in served.drain() {
            entry.task.abort();
        }

        self.watched.write().clear();
    }
}

/// The per-subscription dispatcher.
///
/// Coalesces within `min_interval` (a monotonic next-emit-at gate),
/// emits an unconditional heartbeat every `max_interval`, and winds
/// down when the change sender disappears.
async fn dispatch(
    sub: Subscription,
    mut rx: mpsc::UnboundedReceiver<(u16, Value)>,
    sink: mpsc::UnboundedSender<Notification>,
) {
    let mut pending: BTreeMap<u16, Value> = BTreeMap::new();

    // The priming report at subscribe time counts as the first
    // emission, so the gate starts one min-interval out.
    let mut last_emit = Instant::now();
    let mut next_emit_at = last_emit + sub.min_interval;

    loop {
        if pending.is_empty() {
            let heartbeat_at = last_emit + sub.max_interval;

            tokio::select! {
                change = rx.recv() => match change {
                    Some((attribute, value)) => {
                        pending.insert(attribute, value);
                    }
                    None => break,
                },
                _ = sleep_until(heartbeat_at), if !sub.max_interval.is_zero() => {
                    emit(&sub, &mut pending, &sink);
                    last_emit = Instant::now();
                    next_emit_at = last_emit + sub.min_interval;
                }
            }
        } else {
            tokio::select! {
                change = rx.recv() => match change {
                    Some((attribute, value)) => {
                        // Last writer wins per attribute while the
                        // gate is closed.
                        pending.insert(attribute, value);
                    }
                    None => break,
                },
                _ = sleep_until(next_emit_at) => {
                    emit(&sub, &mut pending, &sink);
                    last_emit = Instant::now();
                    next_emit_at = last_emit + sub.min_interval;
                }
            }
        }
    }
}

fn emit(
    sub: &Subscription,
    pending: &mut BTreeMap<u16, Value>,
    sink: &mpsc::UnboundedSender<Notification>,
) {
    let changes = std::mem::take(pending).into_iter().collect();

    let _ = sink.send(Notification {
        subscription_id: sub.id,
        endpoint_id: sub.endpoint,
        feature_id: sub.feature,
        changes,
    });
}
