//! Operational certificate storage.
//!
//! The store is the only durable state the protocol core relies on.
//! All operations are synchronous and idempotent; durability beyond
//! this contract is the embedder's concern.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

use crate::model::{Zone, ZoneType};

/// An operational certificate as issued at commissioning time.
///
/// The certificate embeds the controller-assigned device id in its
/// CommonName and chains to `zone_ca`.
#[derive(Debug, Clone)]
pub struct OperationalCert {
    pub cert: Vec<u8>,
    pub private_key: Vec<u8>,
    pub zone_id: String,
    pub zone_type: ZoneType,
    pub zone_ca: Vec<u8>,
}

pub trait CertStore: Send + Sync {
    fn set_operational_cert(&self, cert: OperationalCert);

    fn get_operational_cert(&self, zone_id: &str) -> Option<OperationalCert>;

    fn get_zone_ca_cert(&self, zone_id: &str) -> Option<Vec<u8>>;

    /// All zones the device belongs to, connected flag unset; runtime
    /// connectivity is roster state, not store state.
    fn list_zones(&self) -> Vec<Zone>;

    fn remove_zone(&self, zone_id: &str);
}

/// In-memory store, the default for tests and ephemeral devices.
#[derive(Default)]
pub struct MemoryCertStore(RwLock<HashMap<String, OperationalCert>>);

impl MemoryCertStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(RwLock::new(HashMap::new())))
    }
}

impl CertStore for MemoryCertStore {
    fn set_operational_cert(&self, cert: OperationalCert) {
        self.0.write().insert(cert.zone_id.clone(), cert);
    }

    fn get_operational_cert(&self, zone_id: &str) -> Option<OperationalCert> {
        self.0.read().get(zone_id).cloned()
    }

    fn get_zone_ca_cert(&self, zone_id: &str) -> Option<Vec<u8>> {
        self.0.read().get(zone_id).map(|it| it.zone_ca.clone())
    }

    fn list_zones(&self) -> Vec<Zone> {
        self.0
            .read()
            .values()
            .map(|it| Zone {
                zone_id: it.zone_id.clone(),
                kind: it.zone_type,
                connected: false,
                zone_ca: it.zone_ca.clone(),
            })
            .collect()
    }

    fn remove_zone(&self, zone_id: &str) {
        self.0.write().remove(zone_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(zone_id: &str, zone_type: ZoneType) -> OperationalCert {
        OperationalCert {
            cert: vec![1],
            private_key: vec![2],
            zone_id: zone_id.to_string(),
            zone_type,
            zone_ca: vec![3],
        }
    }

    #[test]
    fn set_is_idempotent() {
        let store = MemoryCertStore::new();
        store.set_operational_cert(cert("aabbccdd00112233", ZoneType::Local));
        store.set_operational_cert(cert("aabbccdd00112233", ZoneType::Local));

        assert_eq!(store.list_zones().len(), 1);
    }

    #[test]
    fn remove_destroys_the_cert() {
        let store = MemoryCertStore::new();
        store.set_operational_cert(cert("aabbccdd00112233", ZoneType::Grid));
        store.remove_zone("aabbccdd00112233");
        store.remove_zone("aabbccdd00112233");

        assert!(store.get_operational_cert("aabbccdd00112233").is_none());
        assert!(store.get_zone_ca_cert("aabbccdd00112233").is_none());
    }
}
