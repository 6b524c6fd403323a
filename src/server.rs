//! The TLS listener: admission, classification, reaping.
//!
//! One listener serves both commissioning and operational traffic. The
//! client certificate decides the path: a cert chaining to a known
//! zone CA routes to the operational session, everything else lands in
//! the commissioning handler with its busy gating. A connection counts
//! against the admission cap from before the TLS handshake until its
//! task finishes, whatever the exit path.

use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use service::certs::{self, TlsIdentity};
use service::model::ZoneRemovalEncoding;
use service::store::{CertStore, OperationalCert};

use crate::device::DeviceService;

/// Client-side TLS dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The concurrent-connection cap, `max_zones + 1`.
///
/// The counter is bumped before the TLS handshake and released by the
/// guard's drop on every exit path.
pub struct ConnectionLimiter {
    active: AtomicUsize,
    cap: usize,
}

impl ConnectionLimiter {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            cap,
        })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        if self.active.fetch_add(1, Ordering::AcqRel) >= self.cap {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        Some(ConnectionGuard(self.clone()))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

pub struct ConnectionGuard(Arc<ConnectionLimiter>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Tracked {
    last_activity: Arc<Mutex<Instant>>,
    close: Arc<Notify>,
}

/// Connections the reaper watches: everything from accept until a
/// session is registered into a zone, which removes the entry.
#[derive(Default)]
pub struct ConnectionTracker {
    map: Mutex<AHashMap<u64, Tracked>>,
    next: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, activity: Arc<Mutex<Instant>>, close: Arc<Notify>) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.map.lock().insert(
            id,
            Tracked {
                last_activity: activity,
                close,
            },
        );
        id
    }

    pub fn remove(&self, id: u64) {
        self.map.lock().remove(&id);
    }

    pub fn tracked(&self) -> usize {
        self.map.lock().len()
    }

    /// Closes every tracked connection idle longer than `older_than`.
    pub fn reap(&self, older_than: Duration) -> usize {
        let mut reaped = 0;
        let mut map = self.map.lock();

        map.retain(|id, tracked| {
            if tracked.last_activity.lock().elapsed() <= older_than {
                return true;
            }

            log::info!("stale connection reaped: id={}", id);
            tracked.close.notify_waiters();
            reaped += 1;
            false
        });

        reaped
    }
}

/// The listener accept loop. Exits when the service's shutdown signal
/// fires.
pub async fn run<Z: ZoneRemovalEncoding>(service: Arc<DeviceService<Z>>, listener: TcpListener) {
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("get tcp listener local addr failed: err={}", e);
            return;
        }
    };

    let acceptor = match server_tls_config(&service) {
        Ok(config) => TlsAcceptor::from(Arc::new(config)),
        Err(e) => {
            log::error!("tls config failed: err={}", e);
            return;
        }
    };

    let mut shutdown = service.shutdown_signal();

    log::info!("device service listening: addr={}", local_addr);

    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(it) => it,
                Err(e) => {
                    log::warn!("accept failed: err={}", e);
                    continue;
                }
            },
        };

        // Over the cap: the TCP socket is closed before any TLS work.
        let Some(guard) = service.limiter().try_acquire() else {
            log::warn!("connection cap reached: addr={}", addr);
            drop(socket);
            continue;
        };

        log::info!("connection accepted: addr={}", addr);

        let activity = Arc::new(Mutex::new(Instant::now()));
        let close = Arc::new(Notify::new());
        let id = service.tracker().insert(activity.clone(), close.clone());

        let service = service.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = close.notified() => {
                    log::debug!("connection closed by reaper: addr={}", addr);
                }
                _ = serve_connection(&service, acceptor, socket, addr, id, activity) => {}
            }

            service.tracker().remove(id);
            drop(guard);
        });
    }

    log::info!("device service stopped: addr={}", local_addr);
}

async fn serve_connection<Z: ZoneRemovalEncoding>(
    service: &Arc<DeviceService<Z>>,
    acceptor: TlsAcceptor,
    socket: TcpStream,
    addr: SocketAddr,
    id: u64,
    activity: Arc<Mutex<Instant>>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        log::warn!("set nodelay failed: addr={}, err={}", addr, e);
    }

    let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::debug!("tls handshake failed: addr={}, err={}", addr, e);
            return;
        }
        Err(_) => {
            log::debug!("tls handshake timed out: addr={}", addr);
            return;
        }
    };

    *activity.lock() = Instant::now();

    match classify(service.store().as_ref(), &stream) {
        Some(zone_id) => {
            log::info!("operational connection: addr={}, zone={}", addr, zone_id);

            // Upgraded connections leave the reaper's tracking set;
            // the admission slot stays held until the session closes.
            service.tracker().remove(id);
            service.serve_operational(zone_id, stream, addr).await;
        }
        None => {
            log::info!("commissioning connection: addr={}", addr);
            service.serve_commissioning(stream, activity).await;
        }
    }
}

/// A client certificate chaining to a known zone CA selects the
/// operational path for that zone.
fn classify(store: &dyn CertStore, stream: &server::TlsStream<TcpStream>) -> Option<String> {
    let certs = stream.get_ref().1.peer_certificates()?;
    let peer = certs.first()?;

    store
        .list_zones()
        .into_iter()
        .find(|zone| certs::verify_signed_by(peer, &zone.zone_ca).is_ok())
        .map(|zone| zone.zone_id)
}

fn server_tls_config<Z: ZoneRemovalEncoding>(
    service: &Arc<DeviceService<Z>>,
) -> anyhow::Result<ServerConfig> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let verifier = Arc::new(CaptureClientCerts {
        provider: provider.clone(),
    });

    let resolver = Arc::new(ZoneCertResolver {
        commissioning: service.commissioning_tls_identity(),
        store: service.store().clone(),
    });

    Ok(
        ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(resolver),
    )
}

/// Accepts any client certificate at handshake time; trust is decided
/// afterwards against the zone CA set. Commissioning clients present
/// nothing at all.
struct CaptureClientCerts {
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for CaptureClientCerts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CaptureClientCerts")
    }
}

impl ClientCertVerifier for CaptureClientCerts {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }
}

/// Picks the server identity by SNI: operational dials name
/// `<device_id>.<zone_id>.mash.arpa` and get that zone's operational
/// cert, everything else gets the ephemeral commissioning identity.
struct ZoneCertResolver {
    commissioning: Arc<Mutex<TlsIdentity>>,
    store: Arc<dyn CertStore>,
}

impl std::fmt::Debug for ZoneCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ZoneCertResolver")
    }
}

impl ZoneCertResolver {
    fn zone_key(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let zone_id = server_name.split('.').nth(1)?;
        let cert = self.store.get_operational_cert(zone_id)?;
        certified_key(&cert.cert, &cert.private_key).ok()
    }
}

impl ResolvesServerCert for ZoneCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = client_hello.server_name().and_then(|it| self.zone_key(it)) {
            return Some(key);
        }

        let identity = self.commissioning.lock().clone();
        certified_key(&identity.cert, &identity.private_key).ok()
    }
}

fn certified_key(cert: &[u8], private_key: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let key = aws_lc_rs::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
        PrivatePkcs8KeyDer::from(private_key.to_vec()),
    ))?;

    Ok(Arc::new(CertifiedKey::new(
        vec![CertificateDer::from(cert.to_vec())],
        key,
    )))
}

/// Dials the device for commissioning: TLS 1.3, no client certificate,
/// and no verification of the ephemeral server identity.
pub async fn dial_commissioning(addr: SocketAddr) -> anyhow::Result<client::TlsStream<TcpStream>> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
        .with_no_client_auth();

    dial(addr, config, "commissioning.mash.arpa").await
}

/// Dials the device operationally: mutual TLS under the zone CA.
pub async fn dial_operational(
    addr: SocketAddr,
    device_id: &str,
    credentials: &OperationalCert,
) -> anyhow::Result<client::TlsStream<TcpStream>> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let mut roots = rustls::RootCertStore::empty();
    roots.add(CertificateDer::from(credentials.zone_ca.clone()))?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_client_auth_cert(
            vec![CertificateDer::from(credentials.cert.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(credentials.private_key.clone())),
        )?;

    let server_name = format!("{}.{}.mash.arpa", device_id, credentials.zone_id);
    dial(addr, config, &server_name).await
}

async fn dial(
    addr: SocketAddr,
    config: ClientConfig,
    server_name: &str,
) -> anyhow::Result<client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server_name.to_string())?;

    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await??;
    stream.set_nodelay(true)?;

    Ok(tokio::time::timeout(DIAL_TIMEOUT, connector.connect(name, stream)).await??)
}

/// The commissioning server cert is ephemeral and unverifiable by
/// construction; the PASE exchange carries the trust.
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for SkipServerVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SkipServerVerification")
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_enforces_the_cap() {
        let limiter = ConnectionLimiter::new(2);

        let a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.active(), 2);

        drop(a);
        assert_eq!(limiter.active(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn every_acquire_pairs_with_one_release() {
        let limiter = ConnectionLimiter::new(8);

        for _ in 0..100 {
            let guard = limiter.try_acquire().unwrap();
            drop(guard);
        }

        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn tracker_reaps_only_stale_entries() {
        let tracker = ConnectionTracker::new();

        let fresh = Arc::new(Mutex::new(Instant::now()));
        let stale = Arc::new(Mutex::new(Instant::now() - Duration::from_secs(120)));

        let fresh_close = Arc::new(Notify::new());
        let stale_close = Arc::new(Notify::new());

        tracker.insert(fresh, fresh_close);
        let stale_id = tracker.insert(stale, stale_close.clone());

        let notified = {
            let stale_close = stale_close.clone();
            tokio::spawn(async move { stale_close.notified().await })
        };
        // Give the waiter a chance to park before reaping.
        tokio::task::yield_now().await;

        assert_eq!(tracker.reap(Duration::from_secs(60)), 1);
        assert_eq!(tracker.tracked(), 1);
        notified.await.unwrap();

        // Idempotent on the already reaped id.
        tracker.remove(stale_id);
    }
}
