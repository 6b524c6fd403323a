//! Interaction messages.
//!
//! Requests, responses and notifications are CBOR maps with integer
//! keys. Key 0 discriminates the kind: an integer opcode for requests,
//! the text markers `"R"` and `"N"` for responses and notifications.

pub mod commissioning;

use ciborium::Value;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, MessageType, peek_message_type};

use self::commissioning::CommissioningMessage;

pub(crate) const KEY_KIND: u64 = 0;
pub(crate) const KEY_ID: u64 = 1;
pub(crate) const KEY_STATUS: u64 = 2;
pub(crate) const KEY_ENDPOINT: u64 = 3;
pub(crate) const KEY_FEATURE: u64 = 4;
pub(crate) const KEY_PAYLOAD: u64 = 5;
pub(crate) const KEY_CHANGES: u64 = 6;

const KIND_RESPONSE: &str = "R";
const KIND_NOTIFICATION: &str = "N";

/// Request operations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Op {
    Read = 1,
    Write = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    Invoke = 5,
}

/// Response status codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Status {
    Success = 0,
    InvalidParameter = 1,
    Unsupported = 2,
    Busy = 3,
    NotFound = 4,
    PermissionDenied = 5,
    Failed = 6,
    Timeout = 7,
    SessionClosed = 8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub op: Op,
    pub message_id: u32,
    pub endpoint_id: u8,
    pub feature_id: u8,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub message_id: u32,
    pub status: Status,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub subscription_id: u32,
    pub endpoint_id: u8,
    pub feature_id: u8,
    /// Attribute id to new value, last writer wins per attribute.
    pub changes: Vec<(u16, Value)>,
}

/// Any decodable frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Request(Request),
    Response(Response),
    Notification(Notification),
    Commissioning(CommissioningMessage),
}

impl WireMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(match peek_message_type(bytes)? {
            MessageType::Request => Self::Request(Request::decode(bytes)?),
            MessageType::Response => Self::Response(Response::decode(bytes)?),
            MessageType::Notification => Self::Notification(Notification::decode(bytes)?),
            MessageType::Commissioning(_) => {
                Self::Commissioning(CommissioningMessage::decode(bytes)?)
            }
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Request(it) => it.encode(),
            Self::Response(it) => it.encode(),
            Self::Notification(it) => it.encode(),
            Self::Commissioning(it) => it.encode(),
        }
    }
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        encode_map(vec![
            (key(KEY_KIND), uint(u8::from(self.op) as u64)),
            (key(KEY_ID), uint(self.message_id as u64)),
            (key(KEY_ENDPOINT), uint(self.endpoint_id as u64)),
            (key(KEY_FEATURE), uint(self.feature_id as u64)),
            (key(KEY_PAYLOAD), self.payload.clone()),
        ])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let map = decode_map(bytes)?;

        let op = as_u8(require(&map, KEY_KIND)?).ok_or(Error::UnexpectedValue(KEY_KIND as u8))?;

        Ok(Self {
            op: Op::try_from(op).map_err(|_| Error::UnknownOp)?,
            message_id: require_u32(&map, KEY_ID)?,
            endpoint_id: require_u8(&map, KEY_ENDPOINT)?,
            feature_id: require_u8(&map, KEY_FEATURE)?,
            payload: get(&map, KEY_PAYLOAD).cloned().unwrap_or(Value::Null),
        })
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        encode_map(vec![
            (key(KEY_KIND), Value::Text(KIND_RESPONSE.to_string())),
            (key(KEY_ID), uint(self.message_id as u64)),
            (key(KEY_STATUS), uint(u8::from(self.status) as u64)),
            (key(KEY_PAYLOAD), self.payload.clone()),
        ])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let map = decode_map(bytes)?;

        let status =
            as_u8(require(&map, KEY_STATUS)?).ok_or(Error::UnexpectedValue(KEY_STATUS as u8))?;

        Ok(Self {
            message_id: require_u32(&map, KEY_ID)?,
            status: Status::try_from(status).map_err(|_| Error::UnknownStatus)?,
            payload: get(&map, KEY_PAYLOAD).cloned().unwrap_or(Value::Null),
        })
    }
}

impl Notification {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let changes = self
            .changes
            .iter()
            .map(|(id, value)| (uint(*id as u64), value.clone()))
            .collect();

        encode_map(vec![
            (key(KEY_KIND), Value::Text(KIND_NOTIFICATION.to_string())),
            (key(KEY_ID), uint(self.subscription_id as u64)),
            (key(KEY_ENDPOINT), uint(self.endpoint_id as u64)),
            (key(KEY_FEATURE), uint(self.feature_id as u64)),
            (key(KEY_CHANGES), Value::Map(changes)),
        ])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let map = decode_map(bytes)?;

        let changes = match require(&map, KEY_CHANGES)? {
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| {
                    as_u64(k)
                        .and_then(|it| u16::try_from(it).ok())
                        .map(|id| (id, v.clone()))
                        .ok_or(Error::UnexpectedValue(KEY_CHANGES as u8))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(Error::UnexpectedValue(KEY_CHANGES as u8)),
        };

        Ok(Self {
            subscription_id: require_u32(&map, KEY_ID)?,
            endpoint_id: require_u8(&map, KEY_ENDPOINT)?,
            feature_id: require_u8(&map, KEY_FEATURE)?,
            changes,
        })
    }
}

pub(crate) fn key(value: u64) -> Value {
    Value::Integer(value.into())
}

pub(crate) fn uint(value: u64) -> Value {
    Value::Integer(value.into())
}

pub(crate) fn encode_map(entries: Vec<(Value, Value)>) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(64);
    ciborium::ser::into_writer(&Value::Map(entries), &mut out)?;
    Ok(out)
}

pub(crate) fn decode_map(bytes: &[u8]) -> Result<Vec<(Value, Value)>, Error> {
    match ciborium::de::from_reader::<Value, _>(bytes)? {
        Value::Map(entries) => Ok(entries),
        _ => Err(Error::InvalidInput),
    }
}

/// Looks an integer key up in a decoded CBOR map.
pub fn get(map: &[(Value, Value)], key: u64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| as_u64(k) == Some(key))
        .map(|(_, v)| v)
}

pub(crate) fn require(map: &[(Value, Value)], key: u64) -> Result<&Value, Error> {
    get(map, key).ok_or(Error::MissingKey(key as u8))
}

pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(it) => u64::try_from(*it).ok(),
        _ => None,
    }
}

pub fn as_u8(value: &Value) -> Option<u8> {
    as_u64(value).and_then(|it| u8::try_from(it).ok())
}

pub(crate) fn require_u8(map: &[(Value, Value)], key: u64) -> Result<u8, Error> {
    as_u8(require(map, key)?).ok_or(Error::UnexpectedValue(key as u8))
}

pub(crate) fn require_u32(map: &[(Value, Value)], key: u64) -> Result<u32, Error> {
    as_u64(require(map, key)?)
        .and_then(|it| u32::try_from(it).ok())
        .ok_or(Error::UnexpectedValue(key as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = Request {
            op: Op::Write,
            message_id: 42,
            endpoint_id: 1,
            feature_id: 9,
            payload: Value::Map(vec![(uint(4), Value::Integer(16000.into()))]),
        };

        let bytes = request.encode().unwrap();
        assert_eq!(Request::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn response_round_trip() {
        let response = Response {
            message_id: 42,
            status: Status::PermissionDenied,
            payload: Value::Null,
        };

        let bytes = response.encode().unwrap();
        assert_eq!(Response::decode(&bytes).unwrap(), response);
    }

    #[test]
    fn notification_round_trip() {
        let notification = Notification {
            subscription_id: 3,
            endpoint_id: 1,
            feature_id: 2,
            changes: vec![
                (1, Value::Integer(230.into())),
                (2, Value::Text("charging".to_string())),
            ],
        };

        let bytes = notification.encode().unwrap();
        assert_eq!(Notification::decode(&bytes).unwrap(), notification);
    }

    #[test]
    fn missing_keys_are_reported() {
        // {0: 1, 1: 7} - a request without endpoint and feature ids.
        let bytes = encode_map(vec![(key(0), uint(1)), (key(1), uint(7))]).unwrap();

        assert!(matches!(
            Request::decode(&bytes),
            Err(Error::MissingKey(3))
        ));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let bytes = encode_map(vec![
            (key(0), uint(99)),
            (key(1), uint(7)),
            (key(3), uint(0)),
            (key(4), uint(1)),
        ])
        .unwrap();

        assert!(matches!(Request::decode(&bytes), Err(Error::UnknownOp)));
    }
}
