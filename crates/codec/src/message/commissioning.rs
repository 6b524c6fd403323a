//! Commissioning message namespace.
//!
//! These maps carry their message type at key 1 and never contain key 0
//! or key 4, which is what keeps them distinguishable from interaction
//! requests without a full decode.

use ciborium::Value;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

use super::{
    KEY_ID, Status, as_u8, decode_map, encode_map, get, key, require, require_u32, uint,
};

const KEY_BODY: u64 = 2;
const KEY_EXTRA: u64 = 3;
const KEY_ZONE_TYPE: u64 = 5;

/// Commissioning nonces are always 32 bytes.
pub const NONCE_SIZE: usize = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum CommissioningMsgType {
    PaseRequest = 1,
    PaseResponse = 2,
    CommissioningError = 3,
    CertRenewalRequest = 4,
    CertRenewalCsr = 5,
    CertRenewalInstall = 6,
    CertRenewalAck = 7,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommissioningMessage {
    PaseRequest {
        pake_message: Vec<u8>,
        client_identity: String,
    },
    PaseResponse {
        pake_message: Vec<u8>,
    },
    Error {
        code: Status,
        /// Zero means the condition is persistent, anything else the
        /// number of seconds after which another attempt may succeed.
        retry_after_secs: u32,
    },
    CertRenewalRequest {
        nonce: [u8; NONCE_SIZE],
        zone_ca: Vec<u8>,
        zone_type: u8,
    },
    CertRenewalCsr {
        csr: Vec<u8>,
    },
    CertRenewalInstall {
        cert: Vec<u8>,
        sequence: u32,
    },
    CertRenewalAck {
        status: Status,
    },
}

impl CommissioningMessage {
    pub fn msg_type(&self) -> CommissioningMsgType {
        match self {
            Self::PaseRequest { .. } => CommissioningMsgType::PaseRequest,
            Self::PaseResponse { .. } => CommissioningMsgType::PaseResponse,
            Self::Error { .. } => CommissioningMsgType::CommissioningError,
            Self::CertRenewalRequest { .. } => CommissioningMsgType::CertRenewalRequest,
            Self::CertRenewalCsr { .. } => CommissioningMsgType::CertRenewalCsr,
            Self::CertRenewalInstall { .. } => CommissioningMsgType::CertRenewalInstall,
            Self::CertRenewalAck { .. } => CommissioningMsgType::CertRenewalAck,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut entries = vec![(key(KEY_ID), uint(u8::from(self.msg_type()) as u64))];

        match self {
            Self::PaseRequest {
                pake_message,
                client_identity,
            } => {
                entries.push((key(KEY_BODY), Value::Bytes(pake_message.clone())));
                entries.push((key(KEY_EXTRA), Value::Text(client_identity.clone())));
            }
            Self::PaseResponse { pake_message } => {
                entries.push((key(KEY_BODY), Value::Bytes(pake_message.clone())));
            }
            Self::Error {
                code,
                retry_after_secs,
            } => {
                entries.push((key(KEY_BODY), uint(u8::from(*code) as u64)));
                entries.push((key(KEY_EXTRA), uint(*retry_after_secs as u64)));
            }
            Self::CertRenewalRequest {
                nonce,
                zone_ca,
                zone_type,
            } => {
                entries.push((key(KEY_BODY), Value::Bytes(nonce.to_vec())));
                entries.push((key(KEY_EXTRA), Value::Bytes(zone_ca.clone())));
                entries.push((key(KEY_ZONE_TYPE), uint(*zone_type as u64)));
            }
            Self::CertRenewalCsr { csr } => {
                entries.push((key(KEY_BODY), Value::Bytes(csr.clone())));
            }
            Self::CertRenewalInstall { cert, sequence } => {
                entries.push((key(KEY_BODY), Value::Bytes(cert.clone())));
                entries.push((key(KEY_EXTRA), uint(*sequence as u64)));
            }
            Self::CertRenewalAck { status } => {
                entries.push((key(KEY_BODY), uint(u8::from(*status) as u64)));
            }
        }

        encode_map(entries)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let map = decode_map(bytes)?;

        let msg_type = as_u8(require(&map, KEY_ID)?).ok_or(Error::UnknownMessageType)?;
        let msg_type =
            CommissioningMsgType::try_from(msg_type).map_err(|_| Error::UnknownMessageType)?;

        Ok(match msg_type {
            CommissioningMsgType::PaseRequest => Self::PaseRequest {
                pake_message: require_bytes(&map, KEY_BODY)?,
                client_identity: require_text(&map, KEY_EXTRA)?,
            },
            CommissioningMsgType::PaseResponse => Self::PaseResponse {
                pake_message: require_bytes(&map, KEY_BODY)?,
            },
            CommissioningMsgType::CommissioningError => {
                let code = as_u8(require(&map, KEY_BODY)?)
                    .ok_or(Error::UnexpectedValue(KEY_BODY as u8))?;

                Self::Error {
                    code: Status::try_from(code).map_err(|_| Error::UnknownStatus)?,
                    retry_after_secs: require_u32(&map, KEY_EXTRA)?,
                }
            }
            CommissioningMsgType::CertRenewalRequest => {
                let nonce = require_bytes(&map, KEY_BODY)?;

                Self::CertRenewalRequest {
                    nonce: nonce
                        .as_slice()
                        .try_into()
                        .map_err(|_| Error::UnexpectedValue(KEY_BODY as u8))?,
                    zone_ca: require_bytes(&map, KEY_EXTRA)?,
                    zone_type: get(&map, KEY_ZONE_TYPE)
                        .and_then(as_u8)
                        .ok_or(Error::MissingKey(KEY_ZONE_TYPE as u8))?,
                }
            }
            CommissioningMsgType::CertRenewalCsr => Self::CertRenewalCsr {
                csr: require_bytes(&map, KEY_BODY)?,
            },
            CommissioningMsgType::CertRenewalInstall => Self::CertRenewalInstall {
                cert: require_bytes(&map, KEY_BODY)?,
                sequence: require_u32(&map, KEY_EXTRA)?,
            },
            CommissioningMsgType::CertRenewalAck => {
                let status = as_u8(require(&map, KEY_BODY)?)
                    .ok_or(Error::UnexpectedValue(KEY_BODY as u8))?;

                Self::CertRenewalAck {
                    status: Status::try_from(status).map_err(|_| Error::UnknownStatus)?,
                }
            }
        })
    }
}

fn require_bytes(map: &[(Value, Value)], k: u64) -> Result<Vec<u8>, Error> {
    match require(map, k)? {
        Value::Bytes(it) => Ok(it.clone()),
        _ => Err(Error::UnexpectedValue(k as u8)),
    }
}

fn require_text(map: &[(Value, Value)], k: u64) -> Result<String, Error> {
    match require(map, k)? {
        Value::Text(it) => Ok(it.clone()),
        _ => Err(Error::UnexpectedValue(k as u8)),
    }
}
