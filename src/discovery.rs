//! Seams toward the advertise/browse layer.
//!
//! The concrete mDNS-like machinery lives outside this crate; the
//! service only needs these two traits. The in-memory implementations
//! here back tests and headless deployments.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

/// A controller soliciting pairing on the local network.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub discriminator: u16,
    pub zone_id: String,
    pub zone_name: String,
}

#[derive(Debug, Clone)]
pub struct CommissionableInfo {
    pub device_name: String,
    pub discriminator: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OperationalInfo {
    pub device_id: String,
    pub zone_id: String,
}

pub trait Advertiser: Send + Sync {
    fn advertise_commissionable(&self, info: &CommissionableInfo);
    fn advertise_operational(&self, info: &OperationalInfo);
    fn stop_commissionable(&self);
    fn stop_operational(&self, zone_id: &str);
    fn stop_all(&self);
}

pub type PairingCallback = Arc<dyn Fn(PairingRequest) + Send + Sync>;

pub trait Browser: Send + Sync {
    /// Starts delivering discovered pairing requests to `callback`.
    /// May return immediately; delivery stops when `cancel` flips or
    /// `stop` is called.
    fn browse_pairing_requests(&self, cancel: watch::Receiver<bool>, callback: PairingCallback);

    fn stop(&self);
}

/// Advertiser that only keeps state; real deployments plug the mDNS
/// layer in here.
#[derive(Default)]
pub struct NullAdvertiser {
    commissionable: AtomicBool,
    commissionable_count: AtomicUsize,
    operational: Mutex<Vec<String>>,
}

impl NullAdvertiser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_commissionable(&self) -> bool {
        self.commissionable.load(Ordering::Acquire)
    }

    /// How many times commissionable advertising was started.
    pub fn commissionable_count(&self) -> usize {
        self.commissionable_count.load(Ordering::Acquire)
    }

    pub fn operational_zones(&self) -> Vec<String> {
        self.operational.lock().clone()
    }
}

impl Advertiser for NullAdvertiser {
    fn advertise_commissionable(&self, info: &CommissionableInfo) {
        log::info!(
            "advertise commissionable: name={}, discriminator={}",
            info.device_name,
            info.discriminator
        );

        self.commissionable.store(true, Ordering::Release);
        self.commissionable_count.fetch_add(1, Ordering::Release);
    }

    fn advertise_operational(&self, info: &OperationalInfo) {
        log::info!(
            "advertise operational: device={}, zone={}",
            info.device_id,
            info.zone_id
        );

        let mut zones = self.operational.lock();
        if !zones.contains(&info.zone_id) {
            zones.push(info.zone_id.clone());
        }
    }

    fn stop_commissionable(&self) {
        self.commissionable.store(false, Ordering::Release);
    }

    fn stop_operational(&self, zone_id: &str) {
        self.operational.lock().retain(|it| it != zone_id);
    }

    fn stop_all(&self) {
        self.stop_commissionable();
        self.operational.lock().clear();
    }
}

/// Browser fed by hand; tests inject pairing requests through it.
#[derive(Default)]
pub struct ManualBrowser {
    sinks: Mutex<Vec<(watch::Receiver<bool>, PairingCallback)>>,
    stopped: AtomicBool,
}

impl ManualBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers a pairing request to every live browse callback.
    pub fn inject(&self, request: PairingRequest) {
        let mut sinks = self.sinks.lock();
        sinks.retain(|(cancel, _)| !*cancel.borrow());

        for (_, callback) in sinks.iter() {
            callback(request.clone());
        }
    }

    pub fn browse_count(&self) -> usize {
        let mut sinks = self.sinks.lock();
        sinks.retain(|(cancel, _)| !*cancel.borrow());
        sinks.len()
    }
}

impl Browser for ManualBrowser {
    fn browse_pairing_requests(&self, cancel: watch::Receiver<bool>, callback: PairingCallback) {
        self.stopped.store(false, Ordering::Release);
        self.sinks.lock().push((cancel, callback));
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.sinks.lock().clear();
    }
}
