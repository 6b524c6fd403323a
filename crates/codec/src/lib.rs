//! ## MASH wire codec
//!
//! Every MASH message travels as a single length-prefixed frame whose
//! payload is a CBOR map with integer keys. Two namespaces share the
//! wire:
//!
//! - interaction messages (request / response / notification), which
//!   always carry key 0 and, for requests, key 4 (the feature id);
//! - commissioning messages, which carry their message type at key 1 and
//!   never contain key 0 or key 4.
//!
//! The codec is sans-I/O: callers feed it byte slices and it hands back
//! typed messages. [`peek_message_type`] classifies a payload from the
//! map head alone so the session read loop can route frames without a
//! full decode.

pub mod frame;
pub mod message;

use self::message::commissioning::CommissioningMsgType;

use std::{array::TryFromSliceError, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    EmptyFrame,
    FrameOversize,
    UnknownMessageType,
    UnknownOp,
    UnknownStatus,
    MissingKey(u8),
    UnexpectedValue(u8),
    Decode(String),
    Encode(String),
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(value: ciborium::de::Error<std::io::Error>) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(value: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::Encode(value.to_string())
    }
}

/// Top-level classification of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Commissioning(CommissioningMsgType),
}

/// Classify a CBOR payload without decoding it.
///
/// Scans the map header and the entry keys only, skipping values in
/// place. Commissioning messages are told apart from requests by the
/// absence of key 0 and key 4; renewal messages never carry a feature
/// id, regular requests always do.
///
/// # Test
///
/// ```
/// use mash_codec::{peek_message_type, MessageType};
/// use mash_codec::message::{Op, Request};
///
/// let request = Request {
///     op: Op::Read,
///     message_id: 1,
///     endpoint_id: 0,
///     feature_id: 2,
///     payload: ciborium::Value::Null,
/// };
///
/// let bytes = request.encode().unwrap();
///
/// assert_eq!(peek_message_type(&bytes).unwrap(), MessageType::Request);
/// ```
pub fn peek_message_type(bytes: &[u8]) -> Result<MessageType, Error> {
    let mut cursor = Cursor::new(bytes);

    let entries = cursor.map_head()?;

    let mut kind: Option<PeekKind> = None;
    let mut msg_type: Option<u64> = None;
    let mut has_feature = false;

    for _ in 0..entries {
        let key = cursor.uint()?;
        match key {
            0 => {
                kind = Some(cursor.peek_kind()?);
                cursor.skip_value()?;
            }
            1 => {
                msg_type = Some(cursor.uint()?);
            }
            4 => {
                has_feature = true;
                cursor.skip_value()?;
            }
            _ => {
                cursor.skip_value()?;
            }
        }
    }

    match kind {
        Some(PeekKind::Text(b'R')) => Ok(MessageType::Response),
        Some(PeekKind::Text(b'N')) => Ok(MessageType::Notification),
        Some(PeekKind::Uint) => Ok(MessageType::Request),
        Some(_) => Err(Error::UnknownMessageType),
        // No key 0: a request always carries a feature id, a
        // commissioning message never does.
        None if has_feature => Ok(MessageType::Request),
        None => {
            let value = msg_type.ok_or(Error::UnknownMessageType)?;
            let value = u8::try_from(value).map_err(|_| Error::UnknownMessageType)?;

            Ok(MessageType::Commissioning(
                CommissioningMsgType::try_from(value).map_err(|_| Error::UnknownMessageType)?,
            ))
        }
    }
}

enum PeekKind {
    Uint,
    Text(u8),
    Other,
}

/// A minimal CBOR scanner over a byte slice.
///
/// Understands just enough of the encoding to walk map entries and skip
/// values; anything indefinite-length is rejected, the encoder never
/// produces it.
struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn byte(&mut self) -> Result<u8, Error> {
        let value = *self.bytes.get(self.offset).ok_or(Error::InvalidInput)?;
        self.offset += 1;
        Ok(value)
    }

    /// Reads a CBOR head, returning (major type, argument).
    fn head(&mut self) -> Result<(u8, u64), Error> {
        let initial = self.byte()?;
        let major = initial >> 5;
        let additional = initial & 0x1f;

        let arg = match additional {
            0..=23 => additional as u64,
            24 => self.byte()? as u64,
            25 => {
                let hi = self.byte()? as u64;
                let lo = self.byte()? as u64;
                (hi << 8) | lo
            }
            26 => {
                let mut arg = 0u64;
                for _ in 0..4 {
                    arg = (arg << 8) | self.byte()? as u64;
                }
                arg
            }
            27 => {
                let mut arg = 0u64;
                for _ in 0..8 {
                    arg = (arg << 8) | self.byte()? as u64;
                }
                arg
            }
            _ => return Err(Error::InvalidInput),
        };

        Ok((major, arg))
    }

    fn map_head(&mut self) -> Result<u64, Error> {
        match self.head()? {
            (5, entries) => Ok(entries),
            _ => Err(Error::InvalidInput),
        }
    }

    fn uint(&mut self) -> Result<u64, Error> {
        match self.head()? {
            (0, value) => Ok(value),
            _ => Err(Error::InvalidInput),
        }
    }

    /// Looks at the next value's head without consuming it.
    fn peek_kind(&mut self) -> Result<PeekKind, Error> {
        let initial = *self.bytes.get(self.offset).ok_or(Error::InvalidInput)?;
        Ok(match initial >> 5 {
            0 => PeekKind::Uint,
            3 => {
                let len = (initial & 0x1f) as usize;
                if len == 1 {
                    PeekKind::Text(*self.bytes.get(self.offset + 1).ok_or(Error::InvalidInput)?)
                } else {
                    PeekKind::Other
                }
            }
            _ => PeekKind::Other,
        })
    }

    fn skip_value(&mut self) -> Result<(), Error> {
        let (major, arg) = self.head()?;
        match major {
            // Integers carry their value in the head.
            0 | 1 => {}
            // Byte and text strings.
            2 | 3 => {
                let len = arg as usize;
                if self.offset + len > self.bytes.len() {
                    return Err(Error::InvalidInput);
                }
                self.offset += len;
            }
            4 => {
                for _ in 0..arg {
                    self.skip_value()?;
                }
            }
            5 => {
                for _ in 0..arg {
                    self.skip_value()?;
                    self.skip_value()?;
                }
            }
            6 => self.skip_value()?,
            7 => {
                // Simple values live in the head; halfs, floats and
                // doubles consumed their width through the argument
                // decoding above.
            }
            _ => return Err(Error::InvalidInput),
        }

        Ok(())
    }
}
