//! The commissioning handshake.
//!
//! One lock-step exchange per connection: PASE first, then certificate
//! issuance and installation. The device side answers a controller
//! driving the same sequence from the other end. Admission gating
//! (busy, cooldown, zone caps) is the embedder's job; this module only
//! speaks the protocol once a connection has been let through.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use ahash::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use codec::message::Status;
use codec::message::commissioning::{CommissioningMessage, NONCE_SIZE};

use crate::{
    ServiceError,
    certs::{self, ZoneAuthority},
    model::{DeviceIdentity, ZoneType},
    pase::{PaseInitiator, PaseResponder},
    session::framed::Framed,
    store::{CertStore, OperationalCert},
};

/// Fixed retry hint handed out while another PASE attempt holds the
/// lock.
pub const BUSY_RETRY_HINT_SECS: u32 = 5;

/// Commissioning progress, device and controller view combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningState {
    Connected,
    AwaitingPaseRequest,
    Computing,
    AwaitingCsr,
    Signing,
    AwaitingInstallAck,
    Commissioned,
    Busy,
    Failed,
}

/// At most one PASE handshake runs per device, ever. The guard is
/// handed to whichever connection wins the flag and released on drop,
/// covering every failure path.
#[derive(Default)]
pub struct CommissioningLock(Arc<AtomicBool>);

impl CommissioningLock {
    pub fn try_acquire(&self) -> Option<CommissioningGuard> {
        if self.0.swap(true, Ordering::AcqRel) {
            return None;
        }

        Some(CommissioningGuard(self.0.clone()))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct CommissioningGuard(Arc<AtomicBool>);

impl Drop for CommissioningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything the device side needs to answer one commissioning
/// attempt.
pub struct DeviceCommissioningContext {
    pub identity: DeviceIdentity,
    /// Empty before the first commissioning.
    pub device_id: String,
    pub setup_code: u32,
    pub store: Arc<dyn CertStore>,
    /// Highest install sequence accepted so far, per zone. Sequences
    /// are monotonic per controller-to-device direction, so each zone
    /// tracks its own floor.
    pub install_sequence_floors: Arc<Mutex<HashMap<String, u32>>>,
}

/// The result of a successful device-side handshake.
#[derive(Debug, Clone)]
pub struct CommissionedZone {
    pub zone_id: String,
    pub zone_type: ZoneType,
    pub device_id: String,
}

/// Sends a busy envelope and leaves the connection to be closed by the
/// caller. `retry_after_secs` of zero marks the condition terminal.
pub async fn reject_busy<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    retry_after_secs: u32,
) -> Result<(), ServiceError> {
    framed
        .write_commissioning(&CommissioningMessage::Error {
            code: Status::Busy,
            retry_after_secs,
        })
        .await
}

/// Runs the device side of the handshake on an admitted connection.
///
/// The caller holds the commissioning lock for the duration. On any
/// error the connection is simply dropped; nothing is persisted until
/// the installed certificate has been verified, and the success ack is
/// the last write.
pub async fn respond<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    ctx: &DeviceCommissioningContext,
) -> Result<CommissionedZone, ServiceError> {
    let mut state = CommissioningState::AwaitingPaseRequest;
    log::debug!("commissioning: state={:?}", state);

    let (pake_message, client_identity) = match framed.read_commissioning().await? {
        CommissioningMessage::PaseRequest {
            pake_message,
            client_identity,
        } => (pake_message, client_identity),
        other => {
            log::warn!(
                "commissioning: unexpected message, type={:?}",
                other.msg_type()
            );
            return Err(ServiceError::Protocol(codec::Error::UnknownMessageType));
        }
    };

    state = CommissioningState::Computing;
    log::debug!("commissioning: state={:?}, client={}", state, client_identity);

    let (responder, response_message) =
        PaseResponder::start(ctx.setup_code, &client_identity, &ctx.device_id);

    let secret = match responder.finish(&pake_message) {
        Ok(secret) => secret,
        Err(e) => {
            log::warn!("commissioning: pase failed, err={}", e);
            let _ = framed
                .write_commissioning(&CommissioningMessage::Error {
                    code: Status::Failed,
                    retry_after_secs: BUSY_RETRY_HINT_SECS,
                })
                .await;
            return Err(ServiceError::Fatal("pase failure".to_string()));
        }
    };

    framed
        .write_commissioning(&CommissioningMessage::PaseResponse {
            pake_message: response_message,
        })
        .await?;

    let zone_id = secret.zone_id();
    log::info!("commissioning: pase complete, zone={}", zone_id);

    let (zone_ca, zone_type) = match framed.read_commissioning().await? {
        CommissioningMessage::CertRenewalRequest {
            nonce: _,
            zone_ca,
            zone_type,
        } => {
            let Some(zone_type) = ZoneType::from_u8(zone_type) else {
                return Err(ServiceError::Protocol(codec::Error::InvalidInput));
            };

            (zone_ca, zone_type)
        }
        _ => return Err(ServiceError::Protocol(codec::Error::UnknownMessageType)),
    };

    let (csr, private_key) = certs::build_csr(&ctx.identity, &zone_id)
        .map_err(|e| ServiceError::Fatal(e.to_string()))?;

    framed
        .write_commissioning(&CommissioningMessage::CertRenewalCsr { csr })
        .await?;

    let (cert, sequence) = match framed.read_commissioning().await? {
        CommissioningMessage::CertRenewalInstall { cert, sequence } => (cert, sequence),
        _ => return Err(ServiceError::Protocol(codec::Error::UnknownMessageType)),
    };

    // Install ordering is protected by a strictly monotonic sequence;
    // a regression is an invariant violation, not a protocol slip.
    {
        let mut floors = ctx.install_sequence_floors.lock();
        let floor = floors.get(&zone_id).copied().unwrap_or(0);
        if sequence <= floor {
            return Err(ServiceError::Fatal(format!(
                "install sequence regression: floor={}, got={}",
                floor, sequence
            )));
        }
        floors.insert(zone_id.clone(), sequence);
    }

    if let Err(e) = certs::verify_signed_by(&cert, &zone_ca) {
        log::warn!("commissioning: install rejected, err={}", e);
        framed
            .write_commissioning(&CommissioningMessage::CertRenewalAck {
                status: Status::Failed,
            })
            .await?;
        return Err(ServiceError::Fatal("untrusted operational cert".to_string()));
    }

    let device_id =
        certs::extract_device_id(&cert).map_err(|e| ServiceError::Fatal(e.to_string()))?;

    // Persist, then ack. If the ack cannot be written the peer never
    // learned of the install, so the cert is rolled back.
    ctx.store.set_operational_cert(OperationalCert {
        cert,
        private_key,
        zone_id: zone_id.clone(),
        zone_type,
        zone_ca,
    });

    if let Err(e) = framed
        .write_commissioning(&CommissioningMessage::CertRenewalAck {
            status: Status::Success,
        })
        .await
    {
        ctx.store.remove_zone(&zone_id);
        return Err(e);
    }

    state = CommissioningState::Commissioned;
    log::info!(
        "commissioning: state={:?}, zone={}, device={}",
        state,
        zone_id,
        device_id
    );

    Ok(CommissionedZone {
        zone_id,
        zone_type,
        device_id,
    })
}

/// The controller side: dials are the embedder's job, this drives the
/// exchange over an established stream.
pub struct Commissioner {
    pub controller_name: String,
    pub setup_code: u32,
    pub zone_type: ZoneType,
    pub authority: ZoneAuthority,
    sequence: AtomicU32,
}

/// A successfully commissioned device, as seen by the controller.
#[derive(Debug, Clone)]
pub struct CommissionedDevice {
    pub device_id: String,
    pub zone_id: String,
    pub cert: Vec<u8>,
}

impl Commissioner {
    pub fn new(
        controller_name: &str,
        setup_code: u32,
        zone_type: ZoneType,
        authority: ZoneAuthority,
    ) -> Self {
        Self {
            controller_name: controller_name.to_string(),
            setup_code,
            zone_type,
            authority,
            sequence: AtomicU32::new(0),
        }
    }

    pub async fn commission<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        device_id_hint: &str,
    ) -> Result<CommissionedDevice, ServiceError> {
        let mut state = CommissioningState::Connected;
        log::debug!("commission: state={:?}", state);

        let (initiator, pake_message) =
            PaseInitiator::start(self.setup_code, &self.controller_name, device_id_hint);

        framed
            .write_commissioning(&CommissioningMessage::PaseRequest {
                pake_message,
                client_identity: crate::pase::controller_identity(&self.controller_name),
            })
            .await?;

        state = CommissioningState::Computing;
        log::debug!("commission: state={:?}", state);

        let secret = match framed.read_commissioning().await? {
            CommissioningMessage::PaseResponse { pake_message } => initiator
                .finish(&pake_message)
                .map_err(|e| ServiceError::Fatal(e.to_string()))?,
            CommissioningMessage::Error {
                code: _,
                retry_after_secs,
            } => {
                return Err(ServiceError::Busy { retry_after_secs });
            }
            _ => return Err(ServiceError::Protocol(codec::Error::UnknownMessageType)),
        };

        let zone_id = secret.zone_id();

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce);

        framed
            .write_commissioning(&CommissioningMessage::CertRenewalRequest {
                nonce,
                zone_ca: self.authority.ca_der(),
                zone_type: self.zone_type.as_u8(),
            })
            .await?;

        state = CommissioningState::AwaitingCsr;
        log::debug!("commission: state={:?}, zone={}", state, zone_id);

        let csr = match framed.read_commissioning().await? {
            CommissioningMessage::CertRenewalCsr { csr } => csr,
            _ => return Err(ServiceError::Protocol(codec::Error::UnknownMessageType)),
        };

        // The CSR carries the zone id the device derived from its own
        // PASE secret. A mismatch means the setup code did not match;
        // nothing gets issued.
        let csr_zone = certs::csr_zone_id(&csr).map_err(|e| ServiceError::Fatal(e.to_string()))?;
        if csr_zone != zone_id {
            let _ = framed
                .write_commissioning(&CommissioningMessage::Error {
                    code: Status::Failed,
                    retry_after_secs: BUSY_RETRY_HINT_SECS,
                })
                .await;
            return Err(ServiceError::Fatal("pase secret mismatch".to_string()));
        }

        state = CommissioningState::Signing;
        log::debug!("commission: state={:?}", state);

        let issued = self
            .authority
            .sign_csr(&csr)
            .map_err(|e| ServiceError::Fatal(e.to_string()))?;

        framed
            .write_commissioning(&CommissioningMessage::CertRenewalInstall {
                cert: issued.cert.clone(),
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            })
            .await?;

        state = CommissioningState::AwaitingInstallAck;
        log::debug!("commission: state={:?}", state);

        match framed.read_commissioning().await? {
            CommissioningMessage::CertRenewalAck {
                status: Status::Success,
            } => {}
            CommissioningMessage::CertRenewalAck { status } => {
                return Err(ServiceError::Fatal(format!(
                    "install rejected: status={:?}",
                    status
                )));
            }
            _ => return Err(ServiceError::Protocol(codec::Error::UnknownMessageType)),
        }

        state = CommissioningState::Commissioned;
        log::info!(
            "commission: state={:?}, zone={}, device={}",
            state,
            zone_id,
            issued.device_id
        );

        Ok(CommissionedDevice {
            device_id: issued.device_id,
            zone_id,
            cert: issued.cert,
        })
    }
}
