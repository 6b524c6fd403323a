//! The device service.
//!
//! Owns everything with a lifetime: the device model, the zone roster,
//! the cert store, the commissioning window/lock/cooldown, the pairing
//! listener, the advertiser and the event bus. The TLS listener in
//! `server` feeds classified connections into `serve_commissioning`
//! and `serve_operational`.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use ahash::{AHashMap, HashMapExt};
use ciborium::Value;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use codec::message;
use codec::message::Status;

use service::certs::{self, TlsIdentity};
use service::commissioning::{
    self, BUSY_RETRY_HINT_SECS, CommissionedZone, CommissioningLock, DeviceCommissioningContext,
};
use service::model::{
    Device, DeviceIdentity, Feature, IntKeys, ROOT_ENDPOINT_ID, ZoneRemovalEncoding, ZoneType,
};
use service::session::subscriptions::Subscription;
use service::session::{Session, SessionHandler, SessionOptions, framed::Framed};
use service::store::CertStore;
use service::usecase::{self, DeviceProfile, MatchResult, UseCaseDef};
use service::{ServiceError, snapshot::Snapshot};

use crate::config::Config;
use crate::discovery::{Advertiser, Browser, CommissionableInfo, OperationalInfo, PairingRequest};
use crate::events::{Event, EventBus, EventKind};
use crate::pairing::PairingListener;
use crate::server::{self, ConnectionLimiter, ConnectionTracker};
use crate::statistics::{Statistics, StatisticsReporter, Stats};

/// The root endpoint feature carrying zone management.
pub const ZONE_MANAGEMENT_FEATURE: u8 = 0;
pub const ZONE_MANAGEMENT_FEATURE_TYPE: u16 = 0x0030;
pub const CMD_REMOVE_ZONE: u8 = 1;

const REMOVE_KEY_ZONE: u64 = 1;
const REMOVE_KEY_ENABLE_KEY: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct ServiceOptions {
    pub config: Arc<Config>,
    pub device: Device,
    pub store: Arc<dyn CertStore>,
    pub advertiser: Arc<dyn Advertiser>,
    pub browser: Arc<dyn Browser>,
    /// Required for non-self zone removal over the wire.
    pub enable_key: Option<Vec<u8>>,
}

struct ZoneSessionEntry {
    kind: ZoneType,
    session: Session,
}

pub struct DeviceService<Z: ZoneRemovalEncoding = IntKeys> {
    config: Arc<Config>,
    device: Arc<RwLock<Device>>,
    store: Arc<dyn CertStore>,
    advertiser: Arc<dyn Advertiser>,
    events: EventBus,
    statistics: Statistics,
    enable_key: Option<Vec<u8>>,

    state: Mutex<ServiceState>,
    zones: RwLock<AHashMap<String, ZoneSessionEntry>>,
    limiter: Arc<ConnectionLimiter>,
    tracker: Arc<ConnectionTracker>,

    commissioning_lock: CommissioningLock,
    commissioning_identity: Arc<Mutex<TlsIdentity>>,
    window_until: Mutex<Option<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
    last_attempt: Mutex<Option<Instant>>,
    install_floors: Arc<parking_lot::Mutex<ahash::HashMap<String, u32>>>,

    pairing: PairingListener,
    shutdown: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    _encoding: PhantomData<fn() -> Z>,
}

impl<Z: ZoneRemovalEncoding> DeviceService<Z> {
    pub fn new(options: ServiceOptions) -> anyhow::Result<Arc<Self>> {
        let mut device = options.device;

        // The root endpoint always carries the zone management
        // feature; embedders do not have to remember it.
        if device
            .endpoint(ROOT_ENDPOINT_ID)
            .and_then(|it| it.feature(ZONE_MANAGEMENT_FEATURE))
            .is_none()
        {
            if let Some(root) = device.endpoint_mut(ROOT_ENDPOINT_ID) {
                root.add_feature(
                    ZONE_MANAGEMENT_FEATURE,
                    Feature::new(ZONE_MANAGEMENT_FEATURE_TYPE, 0)
                        .with_commands(&[CMD_REMOVE_ZONE]),
                );
            }
        }

        let identity = certs::commissioning_identity("mash-commissioning")
            .map_err(|e| anyhow::anyhow!("commissioning identity: {}", e))?;

        let cap = options.config.device.max_zones + 1;

        Ok(Arc::new(Self {
            device: Arc::new(RwLock::new(device)),
            store: options.store,
            advertiser: options.advertiser,
            events: EventBus::new(),
            statistics: Statistics::default(),
            enable_key: options.enable_key,
            state: Mutex::new(ServiceState::New),
            zones: RwLock::new(AHashMap::new()),
            limiter: ConnectionLimiter::new(cap),
            tracker: ConnectionTracker::new(),
            commissioning_lock: CommissioningLock::default(),
            commissioning_identity: Arc::new(Mutex::new(identity)),
            window_until: Mutex::new(None),
            cooldown_until: Mutex::new(None),
            last_attempt: Mutex::new(None),
            install_floors: Arc::new(parking_lot::Mutex::new(ahash::HashMap::new())),
            pairing: PairingListener::new(options.browser),
            shutdown: watch::channel(false).0,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            config: options.config,
            _encoding: PhantomData,
        }))
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on_event(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.events.on_event(handler);
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn device(&self) -> &Arc<RwLock<Device>> {
        &self.device
    }

    pub fn store(&self) -> &Arc<dyn CertStore> {
        &self.store
    }

    pub(crate) fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }

    pub fn active_connections(&self) -> usize {
        self.limiter.active()
    }

    pub(crate) fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn commissioning_tls_identity(&self) -> Arc<Mutex<TlsIdentity>> {
        self.commissioning_identity.clone()
    }

    /// The bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn pairing_listener_active(&self) -> bool {
        self.pairing.is_active()
    }

    fn device_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.config.identity.vendor_id,
            product_id: self.config.identity.product_id,
            serial: self.config.identity.serial.clone(),
        }
    }

    fn commissionable_info(&self) -> CommissionableInfo {
        CommissionableInfo {
            device_name: self.config.identity.name.clone(),
            discriminator: self.config.device.discriminator,
            vendor_id: self.config.identity.vendor_id,
            product_id: self.config.identity.product_id,
            categories: self.config.device.categories.clone(),
        }
    }

    /// Binds the listener, wires the reaper and the pairing listener,
    /// and moves to `Running`.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::New {
                anyhow::bail!("service already started: state={:?}", *state);
            }
            *state = ServiceState::Starting;
        }

        let listener = TcpListener::bind(self.config.device.listen_address).await?;
        *self.local_addr.lock() = Some(listener.local_addr()?);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(server::run(self.clone(), listener)));

        if self.config.device.stale_connection_timeout_secs > 0 {
            tasks.push(tokio::spawn(reaper(self.clone())));
        }

        // Zones from a previous run become reachable again.
        let device_id = self.device.read().device_id().to_string();
        for zone in self.store.list_zones() {
            self.advertiser.advertise_operational(&OperationalInfo {
                device_id: device_id.clone(),
                zone_id: zone.zone_id,
            });
        }

        self.tasks.lock().extend(tasks);

        *self.state.lock() = ServiceState::Running;
        self.update_pairing();

        log::info!(
            "device service running: addr={:?}, zones={}",
            self.local_addr(),
            self.store.list_zones().len()
        );

        Ok(())
    }

    /// Cancels the root signal, waits for the background tasks, closes
    /// the sessions and stops all advertising.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ServiceState::Stopping | ServiceState::Stopped) {
                return;
            }
            *state = ServiceState::Stopping;
        }

        let _ = self.shutdown.send(true);
        self.pairing.stop();
        self.close_commissioning_window();

        // Connections still in commissioning or mid-handshake are cut
        // along with the root signal.
        self.tracker.reap(std::time::Duration::ZERO);

        let sessions: Vec<Session> = self
            .zones
            .write()
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();
        for session in sessions {
            session.close();
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.advertiser.stop_all();
        *self.state.lock() = ServiceState::Stopped;
        log::info!("device service stopped");
    }

    /// Opens the commissioning window. Idempotent while a window is
    /// already open; rejected once the service stopped.
    pub fn enter_commissioning_mode(self: &Arc<Self>) -> Result<(), ServiceError> {
        {
            let state = self.state.lock();
            if matches!(*state, ServiceState::Stopping | ServiceState::Stopped) {
                return Err(ServiceError::Fatal("service stopped".to_string()));
            }
        }

        if self.commissioning_window_open() {
            return Ok(());
        }

        // A fresh in-memory TLS identity per window; it never touches
        // the store.
        match certs::commissioning_identity("mash-commissioning") {
            Ok(identity) => *self.commissioning_identity.lock() = identity,
            Err(e) => log::warn!("commissioning identity rotation failed: err={}", e),
        }

        let window = self.config.device.commissioning_window();
        let deadline = Instant::now() + window;
        *self.window_until.lock() = Some(deadline);

        self.advertiser
            .advertise_commissionable(&self.commissionable_info());
        self.emit(EventKind::CommissioningOpened, "");

        log::info!(
            "commissioning window opened: duration={}s",
            window.as_secs()
        );

        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            if let Some(this) = this.upgrade() {
                // Only close the window this task belongs to.
                if *this.window_until.lock() == Some(deadline) {
                    this.close_commissioning_window();
                }
            }
        });

        Ok(())
    }

    pub fn close_commissioning_window(&self) {
        if self.window_until.lock().take().is_some() {
            self.advertiser.stop_commissionable();
            self.emit(EventKind::CommissioningClosed, "");
            log::info!("commissioning window closed");
        }
    }

    pub fn commissioning_window_open(&self) -> bool {
        self.window_until
            .lock()
            .is_some_and(|deadline| deadline > Instant::now())
    }

    pub fn last_commissioning_attempt(&self) -> Option<Instant> {
        *self.last_attempt.lock()
    }

    /// Matches the current device model against a use-case registry.
    pub fn match_use_cases(&self, registry: &[UseCaseDef]) -> MatchResult {
        usecase::match_profile(&DeviceProfile::from(&*self.device.read()), registry)
    }

    pub fn non_test_zone_count(&self) -> usize {
        self.store
            .list_zones()
            .iter()
            .filter(|zone| zone.kind.counts_against_limit())
            .count()
    }

    fn cooldown_remaining(&self) -> Option<u32> {
        let until = (*self.cooldown_until.lock())?;
        let now = Instant::now();

        (until > now).then(|| (until - now).as_secs().max(1) as u32)
    }

    /// The commissioning path for an admitted, TLS-established
    /// connection without a zone client certificate.
    pub(crate) async fn serve_commissioning<S>(
        self: &Arc<Self>,
        stream: S,
        activity: Arc<Mutex<Instant>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(stream);

        // Busy gating happens before any read; the envelope tells the
        // controller whether waiting can help.
        if self.non_test_zone_count() >= self.config.device.max_zones {
            let _ = commissioning::reject_busy(&mut framed, 0).await;
            return;
        }

        if !self.commissioning_window_open() {
            let _ = commissioning::reject_busy(&mut framed, BUSY_RETRY_HINT_SECS).await;
            return;
        }

        if let Some(remaining) = self.cooldown_remaining() {
            let _ = commissioning::reject_busy(&mut framed, remaining).await;
            return;
        }

        let Some(_guard) = self.commissioning_lock.try_acquire() else {
            let _ = commissioning::reject_busy(&mut framed, BUSY_RETRY_HINT_SECS).await;
            return;
        };

        *self.last_attempt.lock() = Some(Instant::now());

        let ctx = DeviceCommissioningContext {
            identity: self.device_identity(),
            device_id: self.device.read().device_id().to_string(),
            setup_code: self.config.device.setup_code,
            store: self.store.clone(),
            install_sequence_floors: self.install_floors.clone(),
        };

        match commissioning::respond(&mut framed, &ctx).await {
            Ok(zone) => {
                *activity.lock() = Instant::now();
                self.on_commissioned(zone);
            }
            Err(e) => {
                if self.config.device.connection_cooldown_secs > 0 {
                    *self.cooldown_until.lock() =
                        Some(Instant::now() + self.config.device.connection_cooldown());
                }

                if matches!(e, ServiceError::Fatal(_)) {
                    self.events.emit(
                        Event::new(EventKind::Error, self.device.read().device_id(), "")
                            .with_detail(&e.to_string()),
                    );
                }

                log::warn!("commissioning failed: err={}", e);
            }
        }
    }

    fn on_commissioned(self: &Arc<Self>, zone: CommissionedZone) {
        // Test-mode devices keep their zones out of the cap.
        if self.config.device.test_mode && zone.zone_type.counts_against_limit() {
            if let Some(mut cert) = self.store.get_operational_cert(&zone.zone_id) {
                cert.zone_type = ZoneType::Test;
                self.store.set_operational_cert(cert);
            }
        }

        self.device.write().assign_device_id(&zone.device_id);

        self.advertiser.advertise_operational(&OperationalInfo {
            device_id: zone.device_id.clone(),
            zone_id: zone.zone_id.clone(),
        });

        self.emit(EventKind::Connected, &zone.zone_id);
        self.close_commissioning_window();
        self.update_pairing();

        log::info!(
            "zone commissioned: zone={}, type={:?}, device={}",
            zone.zone_id,
            zone.zone_type,
            zone.device_id
        );
    }

    /// The operational path: wraps the stream in a session, registers
    /// it in the roster and parks until the session closes so the
    /// admission slot stays occupied for the connection's lifetime.
    pub(crate) async fn serve_operational<S>(
        self: &Arc<Self>,
        zone_id: String,
        stream: S,
        addr: SocketAddr,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let kind = match self.store.get_operational_cert(&zone_id) {
            Some(cert) => cert.zone_type,
            None => {
                log::warn!("zone vanished during connect: zone={}", zone_id);
                return;
            }
        };

        let handler = Arc::new(ServiceSessionHandler {
            service: Arc::downgrade(self),
            reporter: self.statistics.get_reporter(),
        });

        self.statistics.register(&zone_id);

        let session = Session::spawn(
            stream,
            self.device.clone(),
            handler,
            SessionOptions::new(&zone_id),
        );

        // Reconnects replace the previous session for the zone.
        let previous = self.zones.write().insert(
            zone_id.clone(),
            ZoneSessionEntry {
                kind,
                session: session.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.session.close();
        }

        self.emit(EventKind::ZoneConnected, &zone_id);
        log::info!("zone session started: zone={}, addr={}", zone_id, addr);

        session.wait_closed().await;
    }

    fn on_session_closed(&self, zone_id: &str) {
        let removed = {
            let mut zones = self.zones.write();
            match zones.get(zone_id) {
                Some(entry) if entry.session.is_closed() => {
                    zones.remove(zone_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.statistics.unregister(zone_id);
            self.emit(EventKind::Disconnected, zone_id);
        }
    }

    /// Destroys the zone: cert, session, advertisement. Wire callers
    /// may only remove their own zone unless they present the enable
    /// key.
    pub fn remove_zone(
        self: &Arc<Self>,
        zone_id: &str,
        caller_zone: Option<&str>,
        enable_key: Option<&[u8]>,
    ) -> Result<(), ServiceError> {
        let authorized = match caller_zone {
            // Local administrative calls are unrestricted.
            None => true,
            Some(caller) => {
                caller == zone_id
                    || matches!(
                        (&self.enable_key, enable_key),
                        (Some(expected), Some(given)) if expected.as_slice() == given
                    )
            }
        };

        if !authorized {
            log::warn!(
                "zone removal denied: zone={}, caller={:?}",
                zone_id,
                caller_zone
            );
            return Err(ServiceError::PermissionDenied);
        }

        if self.store.get_operational_cert(zone_id).is_none() {
            return Err(ServiceError::NotFound);
        }

        self.store.remove_zone(zone_id);

        if let Some(entry) = self.zones.write().remove(zone_id) {
            // A self-removal response rides the session being torn
            // down; the close waits until the ack has had a chance to
            // flush.
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                entry.session.close();
            });
            self.statistics.unregister(zone_id);
        }

        self.advertiser.stop_operational(zone_id);
        self.emit(EventKind::ZoneDisconnected, zone_id);
        self.emit(EventKind::DeviceRemoved, zone_id);
        self.update_pairing();

        log::info!("zone removed: zone={}", zone_id);
        Ok(())
    }

    /// Applies a local attribute change and fans it out to every zone
    /// session's matching subscriptions.
    pub fn update_attribute(&self, endpoint: u8, feature: u8, attribute: u16, value: Value) -> Status {
        let status = match self.device.write().feature_mut(endpoint, feature) {
            Some(it) => it.set_attribute(attribute, value.clone()),
            None => Status::NotFound,
        };

        if status == Status::Success {
            for entry in self.zones.read().values() {
                entry
                    .session
                    .notify_attribute_change(endpoint, feature, attribute, &value);
            }
        }

        status
    }

    /// Zones with a live session, test zones included.
    pub fn connected_zones(&self) -> Vec<(String, ZoneType)> {
        self.zones
            .read()
            .iter()
            .map(|(zone_id, entry)| (zone_id.clone(), entry.kind))
            .collect()
    }

    fn update_pairing(self: &Arc<Self>) {
        let should = self.state() == ServiceState::Running
            && self.config.device.listen_for_pairing_requests
            && self.non_test_zone_count() < self.config.device.max_zones;

        let weak = Arc::downgrade(self);
        self.pairing.update(
            should,
            Arc::new(move |request| {
                if let Some(service) = weak.upgrade() {
                    service.on_pairing_request(request);
                }
            }),
        );
    }

    fn on_pairing_request(self: &Arc<Self>, request: PairingRequest) {
        if request.discriminator != self.config.device.discriminator {
            log::debug!(
                "pairing request ignored: discriminator={}, ours={}",
                request.discriminator,
                self.config.device.discriminator
            );
            return;
        }

        // A window already open also rate-limits repeated requests.
        if self.commissioning_window_open() {
            log::debug!("pairing request ignored: window already open");
            return;
        }

        if self.non_test_zone_count() >= self.config.device.max_zones {
            log::debug!("pairing request ignored: zones full");
            return;
        }

        log::info!(
            "pairing request accepted: zone={}, name={}",
            request.zone_id,
            request.zone_name
        );

        let _ = self.enter_commissioning_mode();
    }

    fn emit(&self, kind: EventKind, zone_id: &str) {
        let device_id = self.device.read().device_id().to_string();
        self.events.emit(Event::new(kind, &device_id, zone_id));
    }
}

async fn reaper<Z: ZoneRemovalEncoding>(service: Arc<DeviceService<Z>>) {
    let timeout = service.config.device.stale_connection_timeout();
    let mut ticker = tokio::time::interval(service.config.device.reaper_interval());
    let mut shutdown = service.shutdown_signal();

    log::info!(
        "reaper running: timeout={}s, interval={}s",
        timeout.as_secs(),
        service.config.device.reaper_interval_secs
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let reaped = service.tracker.reap(timeout);
                if reaped > 0 {
                    log::info!("reaper pass: closed={}", reaped);
                }
            }
        }
    }
}

/// The session-to-service bridge: model writes, zone management
/// invokes, traffic accounting and roster upkeep.
struct ServiceSessionHandler<Z: ZoneRemovalEncoding> {
    service: std::sync::Weak<DeviceService<Z>>,
    reporter: StatisticsReporter,
}

impl<Z: ZoneRemovalEncoding> SessionHandler for ServiceSessionHandler<Z> {
    fn write(&self, _peer: &str, endpoint: u8, feature: u8, attribute: u16, value: &Value) -> Status {
        match self.service.upgrade() {
            Some(service) => service.update_attribute(endpoint, feature, attribute, value.clone()),
            None => Status::Failed,
        }
    }

    fn invoke(
        &self,
        peer: &str,
        endpoint: u8,
        feature: u8,
        command: u8,
        payload: &Value,
    ) -> Result<Value, Status> {
        let Some(service) = self.service.upgrade() else {
            return Err(Status::Failed);
        };

        if endpoint != ROOT_ENDPOINT_ID
            || feature != ZONE_MANAGEMENT_FEATURE
            || command != CMD_REMOVE_ZONE
        {
            return Err(Status::Unsupported);
        }

        let Value::Map(entries) = payload else {
            return Err(Status::InvalidParameter);
        };

        let target = match message::get(entries, REMOVE_KEY_ZONE) {
            Some(Value::Text(it)) => it.clone(),
            _ => return Err(Status::InvalidParameter),
        };

        let enable_key = match message::get(entries, REMOVE_KEY_ENABLE_KEY) {
            Some(Value::Bytes(it)) => Some(it.clone()),
            _ => None,
        };

        match service.remove_zone(&target, Some(peer), enable_key.as_deref()) {
            Ok(()) => Ok(Z::encode(&target, Status::Success)),
            Err(e) => Err(e.status()),
        }
    }

    fn notification(&self, peer: &str, subscription: &Subscription, changes: &[(u16, Value)]) {
        log::debug!(
            "notification: peer={}, subscription={}, changes={}",
            peer,
            subscription.id,
            changes.len()
        );
    }

    fn snapshot(&self, peer: &str, snapshot: &Snapshot) {
        log::debug!(
            "snapshot: peer={}, endpoints={}",
            peer,
            snapshot.endpoints.len()
        );
    }

    fn activity(&self, peer: &str, bytes: usize) {
        self.reporter.send(
            peer,
            &[Stats::ReceivedBytes(bytes as u64), Stats::ReceivedFrames(1)],
        );
    }

    fn closed(&self, peer: &str) {
        if let Some(service) = self.service.upgrade() {
            service.on_session_closed(peer);
        }
    }
}
