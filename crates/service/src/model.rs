//! The device model subset the protocol core consumes.
//!
//! A device owns a root endpoint (id 0) plus any number of additional
//! endpoints; endpoints group features; features expose attributes and
//! commands. Runtime attribute values are CBOR values so the model
//! stays agnostic of feature semantics.

use std::collections::BTreeMap;

use ciborium::Value;
use codec::message::Status;

use crate::message_key;

/// Every device has a root endpoint with this id.
pub const ROOT_ENDPOINT_ID: u8 = 0;

pub const ENDPOINT_TYPE_DEVICE_ROOT: u8 = 0;
pub const ENDPOINT_TYPE_EV_CHARGER: u8 = 1;
pub const ENDPOINT_TYPE_INVERTER: u8 = 2;
pub const ENDPOINT_TYPE_PV_STRING: u8 = 3;
pub const ENDPOINT_TYPE_GRID_CONNECTION: u8 = 4;
pub const ENDPOINT_TYPE_BATTERY: u8 = 5;

/// Static identity of a device, fixed at manufacture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
}

/// The local device model.
///
/// `device_id` is empty until the first commissioning assigns one and
/// is immutable afterwards.
#[derive(Debug, Clone)]
pub struct Device {
    device_id: String,
    pub identity: DeviceIdentity,
    endpoints: BTreeMap<u8, Endpoint>,
}

impl Device {
    pub fn new(identity: DeviceIdentity) -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            ROOT_ENDPOINT_ID,
            Endpoint::new(ROOT_ENDPOINT_ID, ENDPOINT_TYPE_DEVICE_ROOT, "root"),
        );

        Self {
            device_id: String::new(),
            identity,
            endpoints,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Records the controller-assigned id. The first assignment wins,
    /// later calls with a different id are ignored.
    pub fn assign_device_id(&mut self, device_id: &str) {
        if self.device_id.is_empty() {
            self.device_id = device_id.to_string();
        }
    }

    /// Adds an endpoint; ids are unique per device.
    pub fn add_endpoint(&mut self, endpoint: Endpoint) -> bool {
        if self.endpoints.contains_key(&endpoint.id) {
            return false;
        }

        self.endpoints.insert(endpoint.id, endpoint);
        true
    }

    pub fn endpoint(&self, id: u8) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn endpoint_mut(&mut self, id: u8) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&id)
    }

    /// Endpoints in ascending id order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn feature(&self, endpoint: u8, feature: u8) -> Option<&Feature> {
        self.endpoints.get(&endpoint)?.feature(feature)
    }

    pub fn feature_mut(&mut self, endpoint: u8, feature: u8) -> Option<&mut Feature> {
        self.endpoints.get_mut(&endpoint)?.feature_mut(feature)
    }
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: u8,
    pub kind: u8,
    pub label: String,
    features: BTreeMap<u8, Feature>,
}

impl Endpoint {
    pub fn new(id: u8, kind: u8, label: &str) -> Self {
        Self {
            id,
            kind,
            label: label.to_string(),
            features: BTreeMap::new(),
        }
    }

    pub fn add_feature(&mut self, id: u8, feature: Feature) -> bool {
        if self.features.contains_key(&id) {
            return false;
        }

        self.features.insert(id, feature);
        true
    }

    pub fn feature(&self, id: u8) -> Option<&Feature> {
        self.features.get(&id)
    }

    pub fn feature_mut(&mut self, id: u8) -> Option<&mut Feature> {
        self.features.get_mut(&id)
    }

    /// Features in ascending feature-id order.
    pub fn features(&self) -> impl Iterator<Item = (&u8, &Feature)> {
        self.features.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub type_id: u16,
    pub feature_map: u32,
    pub attribute_list: Vec<u16>,
    pub command_list: Vec<u8>,
    attributes: BTreeMap<u16, Value>,
}

impl Feature {
    pub fn new(type_id: u16, feature_map: u32) -> Self {
        Self {
            type_id,
            feature_map,
            attribute_list: Vec::new(),
            command_list: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: &[u16]) -> Self {
        self.attribute_list = attributes.to_vec();
        self
    }

    pub fn with_commands(mut self, commands: &[u8]) -> Self {
        self.command_list = commands.to_vec();
        self
    }

    pub fn attribute(&self, id: u16) -> Option<&Value> {
        self.attributes.get(&id)
    }

    /// Sets an attribute value; unknown attribute ids are rejected so
    /// the attribute list stays authoritative.
    pub fn set_attribute(&mut self, id: u16, value: Value) -> Status {
        if !self.attribute_list.contains(&id) {
            return Status::NotFound;
        }

        self.attributes.insert(id, value);
        Status::Success
    }

    /// Current values of the given attributes, all of them when the
    /// filter is empty.
    pub fn attribute_values(&self, filter: &[u16]) -> Vec<(u16, Value)> {
        self.attributes
            .iter()
            .filter(|(id, _)| filter.is_empty() || filter.contains(id))
            .map(|(id, value)| (*id, value.clone()))
            .collect()
    }
}

/// Trust domain membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    Grid,
    Local,
    Test,
}

impl ZoneType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Grid),
            1 => Some(Self::Local),
            2 => Some(Self::Test),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Grid => 0,
            Self::Local => 1,
            Self::Test => 2,
        }
    }

    /// Test zones never count against the zone limit.
    pub fn counts_against_limit(&self) -> bool {
        !matches!(self, Self::Test)
    }
}

#[derive(Debug, Clone)]
pub struct Zone {
    pub zone_id: String,
    pub kind: ZoneType,
    pub connected: bool,
    pub zone_ca: Vec<u8>,
}

/// Compile-time choice for the key style of zone-removal response
/// payloads. Both integer-keyed and string-keyed encodings exist in
/// the field; services pick one via the type parameter.
pub trait ZoneRemovalEncoding: Send + Sync + 'static {
    fn encode(zone_id: &str, status: Status) -> Value;
}

/// Integer-keyed removal payload: `{1: zone_id, 2: status}`.
pub struct IntKeys;

impl ZoneRemovalEncoding for IntKeys {
    fn encode(zone_id: &str, status: Status) -> Value {
        Value::Map(vec![
            (message_key(1), Value::Text(zone_id.to_string())),
            (message_key(2), Value::Integer((u8::from(status) as u64).into())),
        ])
    }
}

/// String-keyed removal payload: `{"zone_id": …, "status": …}`.
pub struct StringKeys;

impl ZoneRemovalEncoding for StringKeys {
    fn encode(zone_id: &str, status: Status) -> Value {
        Value::Map(vec![
            (
                Value::Text("zone_id".to_string()),
                Value::Text(zone_id.to_string()),
            ),
            (
                Value::Text("status".to_string()),
                Value::Integer((u8::from(status) as u64).into()),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Device {
        let mut device = Device::new(DeviceIdentity {
            vendor_id: 0x1234,
            product_id: 0x0001,
            serial: "EVC-001".to_string(),
        });

        let mut charger = Endpoint::new(1, ENDPOINT_TYPE_EV_CHARGER, "charger");
        charger.add_feature(
            1,
            Feature::new(0x0041, 0b11)
                .with_attributes(&[1, 2, 3])
                .with_commands(&[1]),
        );
        device.add_endpoint(charger);
        device
    }

    #[test]
    fn root_endpoint_always_exists() {
        let device = test_device();
        assert_eq!(
            device.endpoint(ROOT_ENDPOINT_ID).unwrap().kind,
            ENDPOINT_TYPE_DEVICE_ROOT
        );
    }

    #[test]
    fn endpoint_ids_are_unique() {
        let mut device = test_device();
        assert!(!device.add_endpoint(Endpoint::new(1, ENDPOINT_TYPE_BATTERY, "dup")));
    }

    #[test]
    fn device_id_is_immutable_once_assigned() {
        let mut device = test_device();
        assert_eq!(device.device_id(), "");

        device.assign_device_id("00112233aabbccdd");
        device.assign_device_id("ffffffffffffffff");
        assert_eq!(device.device_id(), "00112233aabbccdd");
    }

    #[test]
    fn attribute_writes_respect_the_attribute_list() {
        let mut device = test_device();
        let feature = device.feature_mut(1, 1).unwrap();

        assert_eq!(
            feature.set_attribute(2, Value::Integer(16.into())),
            Status::Success
        );
        assert_eq!(
            feature.set_attribute(9, Value::Integer(16.into())),
            Status::NotFound
        );
    }

    #[test]
    fn int_keyed_removal_payload_shape() {
        let Value::Map(entries) = IntKeys::encode("aabbccdd00112233", Status::Success) else {
            panic!("expected a map payload");
        };

        assert_eq!(
            entries,
            vec![
                (
                    Value::Integer(1.into()),
                    Value::Text("aabbccdd00112233".to_string()),
                ),
                (Value::Integer(2.into()), Value::Integer(0.into())),
            ]
        );
    }

    #[test]
    fn string_keyed_removal_payload_shape() {
        let Value::Map(entries) = StringKeys::encode("aabbccdd00112233", Status::NotFound) else {
            panic!("expected a map payload");
        };

        assert_eq!(
            entries,
            vec![
                (
                    Value::Text("zone_id".to_string()),
                    Value::Text("aabbccdd00112233".to_string()),
                ),
                (
                    Value::Text("status".to_string()),
                    Value::Integer((u8::from(Status::NotFound) as u64).into()),
                ),
            ]
        );
    }

    #[test]
    fn empty_filter_reads_all_attributes() {
        let mut device = test_device();
        let feature = device.feature_mut(1, 1).unwrap();
        feature.set_attribute(1, Value::Integer(6.into()));
        feature.set_attribute(2, Value::Integer(16.into()));

        assert_eq!(feature.attribute_values(&[]).len(), 2);
        assert_eq!(feature.attribute_values(&[2]).len(), 1);
    }
}
