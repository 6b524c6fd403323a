//! Password-authenticated session establishment.
//!
//! A thin shell around the `spake2` crate: the controller is side A,
//! the device side B, the setup code is the password and both sides
//! bind their role identity into the exchange. The derived secret
//! keys the zone id.

use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::certs::zone_id_from_secret;

pub const DEVICE_IDENTITY_PREFIX: &str = "mash-device:";
pub const CONTROLLER_IDENTITY_PREFIX: &str = "mash-controller:";

#[derive(Debug)]
pub enum PaseError {
    Pake(spake2::Error),
}

impl std::error::Error for PaseError {}

impl std::fmt::Display for PaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pake(e) => write!(f, "pake: {}", e),
        }
    }
}

/// The PASE output: shared secret plus the derived zone id.
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn zone_id(&self) -> String {
        zone_id_from_secret(&self.0)
    }
}

pub fn device_identity(device_id: &str) -> String {
    format!("{}{}", DEVICE_IDENTITY_PREFIX, device_id)
}

pub fn controller_identity(controller_name: &str) -> String {
    format!("{}{}", CONTROLLER_IDENTITY_PREFIX, controller_name)
}

fn password(setup_code: u32) -> Password {
    Password::new(setup_code.to_string().into_bytes())
}

/// Controller side (A). `start` yields the message carried in
/// `PASERequest`; `finish` consumes the device's `PASEResponse`.
pub struct PaseInitiator(Spake2<Ed25519Group>);

impl PaseInitiator {
    pub fn start(setup_code: u32, controller_name: &str, device_id: &str) -> (Self, Vec<u8>) {
        let (state, message) = Spake2::<Ed25519Group>::start_a(
            &password(setup_code),
            &Identity::new(controller_identity(controller_name).as_bytes()),
            &Identity::new(device_identity(device_id).as_bytes()),
        );

        (Self(state), message)
    }

    pub fn finish(self, peer_message: &[u8]) -> Result<SharedSecret, PaseError> {
        self.0
            .finish(peer_message)
            .map(SharedSecret)
            .map_err(PaseError::Pake)
    }
}

/// Device side (B). The client identity arrives inside `PASERequest`.
pub struct PaseResponder(Spake2<Ed25519Group>);

impl PaseResponder {
    pub fn start(setup_code: u32, client_identity: &str, device_id: &str) -> (Self, Vec<u8>) {
        let (state, message) = Spake2::<Ed25519Group>::start_b(
            &password(setup_code),
            &Identity::new(client_identity.as_bytes()),
            &Identity::new(device_identity(device_id).as_bytes()),
        );

        (Self(state), message)
    }

    pub fn finish(self, peer_message: &[u8]) -> Result<SharedSecret, PaseError> {
        self.0
            .finish(peer_message)
            .map(SharedSecret)
            .map_err(PaseError::Pake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let (initiator, msg_a) = PaseInitiator::start(20252025, "hems", "");
        let (responder, msg_b) =
            PaseResponder::start(20252025, &controller_identity("hems"), "");

        let controller = initiator.finish(&msg_b).unwrap();
        let device = responder.finish(&msg_a).unwrap();

        assert_eq!(controller.as_bytes(), device.as_bytes());
        assert_eq!(controller.zone_id(), device.zone_id());
        assert_eq!(controller.zone_id().len(), 16);
    }

    #[test]
    fn wrong_setup_code_diverges() {
        let (initiator, msg_a) = PaseInitiator::start(20252025, "hems", "");
        let (responder, msg_b) =
            PaseResponder::start(11111111, &controller_identity("hems"), "");

        let controller = initiator.finish(&msg_b).unwrap();
        let device = responder.finish(&msg_a).unwrap();

        assert_ne!(controller.as_bytes(), device.as_bytes());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let (_, msg_a) = PaseInitiator::start(20252025, "hems", "");
        let (responder, _) = PaseResponder::start(20252025, &controller_identity("hems"), "");

        assert!(responder.finish(&msg_a[..msg_a.len() - 1]).is_err());
    }
}
