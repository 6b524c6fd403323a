//! One session per connected, authenticated peer.
//!
//! A session multiplexes four concerns over one framed stream: inbound
//! request dispatch against the local device model, the outbound
//! request client, the subscription dispatcher and periodic capability
//! snapshots. The zone session on a device and the device session on a
//! controller are the same type; only the handler behind it differs.

pub mod client;
pub mod framed;
pub mod subscriptions;

use std::collections::BTreeSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use ciborium::Value;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use codec::message::{Notification, Op, Request, Response, Status};
use codec::{MessageType, peek_message_type};

use crate::ServiceError;
use crate::model::Device;
use crate::snapshot::{Clock, Snapshot, SnapshotPolicy, SnapshotTracker, SystemClock};

use self::client::{DEFAULT_REQUEST_TIMEOUT, InteractionClient};
use self::framed::{FrameReader, write_frame};
use self::subscriptions::{Subscription, SubscriptionTables};

// Subscribe payload keys.
const SUB_KEY_ID: u64 = 1;
const SUB_KEY_ATTRIBUTES: u64 = 2;
const SUB_KEY_MIN_MS: u64 = 3;
const SUB_KEY_MAX_MS: u64 = 4;

// Invoke payload keys.
const INVOKE_KEY_COMMAND: u64 = 1;
const INVOKE_KEY_ARGS: u64 = 2;

/// Callbacks a session makes into its owner.
///
/// A `write` returning `Success` means the handler applied the value
/// to the model (and fanned the change out to whatever sessions watch
/// it); the session itself never mutates the device model.
pub trait SessionHandler: Send + Sync + 'static {
    fn write(&self, peer: &str, endpoint: u8, feature: u8, attribute: u16, value: &Value) -> Status {
        let _ = (peer, endpoint, feature, attribute, value);
        Status::Unsupported
    }

    fn invoke(
        &self,
        peer: &str,
        endpoint: u8,
        feature: u8,
        command: u8,
        payload: &Value,
    ) -> Result<Value, Status> {
        let _ = (peer, endpoint, feature, command, payload);
        Err(Status::Unsupported)
    }

    /// An inbound notification for a subscription this side created.
    fn notification(
        &self,
        peer: &str,
        subscription: &Subscription,
        changes: &[(u16, Value)],
    ) {
        let _ = (peer, subscription, changes);
    }

    /// A capability snapshot was emitted for this session.
    fn snapshot(&self, peer: &str, snapshot: &Snapshot) {
        let _ = (peer, snapshot);
    }

    /// A frame arrived; the hook feeds traffic accounting.
    fn activity(&self, peer: &str, bytes: usize) {
        let _ = (peer, bytes);
    }

    fn closed(&self, peer: &str) {
        let _ = peer;
    }
}

pub struct SessionOptions {
    pub peer_id: String,
    pub request_timeout: Duration,
    pub snapshot_policy: SnapshotPolicy,
    pub clock: Arc<dyn Clock>,
}

impl SessionOptions {
    pub fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            snapshot_policy: SnapshotPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

struct SessionInner {
    peer_id: String,
    device: Arc<RwLock<Device>>,
    handler: Arc<dyn SessionHandler>,
    client: InteractionClient,
    subscriptions: SubscriptionTables,
    /// Encoded frame payloads on their way to the writer task.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Sink handed to every served-subscription dispatcher.
    notifications: mpsc::UnboundedSender<Notification>,
    snapshots: SnapshotTracker,
    remote_seen: Mutex<BTreeSet<(u8, u8)>>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    closed_signal: tokio::sync::watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wires a session onto an authenticated stream and spawns its
    /// reader, writer and notification tasks.
    pub fn spawn<S>(
        stream: S,
        device: Arc<RwLock<Device>>,
        handler: Arc<dyn SessionHandler>,
        options: SessionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel::<Notification>();

        let inner = Arc::new(SessionInner {
            peer_id: options.peer_id,
            device,
            handler,
            client: InteractionClient::new(options.request_timeout),
            subscriptions: SubscriptionTables::default(),
            outbound: out_tx.clone(),
            notifications: notif_tx,
            snapshots: SnapshotTracker::new(options.snapshot_policy, options.clock),
            remote_seen: Mutex::new(BTreeSet::new()),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            closed_signal: tokio::sync::watch::channel(false).0,
            tasks: Mutex::new(Vec::with_capacity(3)),
        });

        let session = Self { inner };

        let writer = tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                if write_frame(&mut write_half, &payload).await.is_err() {
                    break;
                }
            }
        });

        let pump = tokio::spawn(async move {
            while let Some(notification) = notif_rx.recv().await {
                let Ok(payload) = notification.encode() else {
                    continue;
                };

                if out_tx.send(payload).is_err() {
                    break;
                }
            }
        });

        let reader_session = session.clone();
        let reader = tokio::spawn(async move {
            let mut frames = FrameReader::new(read_half);

            loop {
                match frames.next().await {
                    Ok(Some(frame)) => {
                        if let Err(e) = reader_session.inner.on_frame(&frame) {
                            log::warn!(
                                "session error: peer={}, err={}",
                                reader_session.peer_id(),
                                e
                            );
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!(
                            "session read failed: peer={}, err={}",
                            reader_session.peer_id(),
                            e
                        );
                        break;
                    }
                }
            }

            reader_session.close();
        });

        {
            let mut tasks = session.inner.tasks.lock();
            tasks.push(writer);
            tasks.push(pump);
            tasks.push(reader);
        }

        session.inner.emit_snapshot();
        session
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// How long since the last frame arrived; the reaper's input.
    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    /// Fans a local attribute change out to every served subscription
    /// that matches it.
    pub fn notify_attribute_change(&self, endpoint: u8, feature: u8, attribute: u16, value: &Value) {
        self.inner
            .subscriptions
            .notify_change(endpoint, feature, attribute, value);
    }

    pub fn served_subscriptions(&self) -> usize {
        self.inner.subscriptions.served_count()
    }

    /// Idempotent. Cancels in-flight requests with `SessionClosed`,
    /// clears the subscription tables and releases the transport.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.client.close();
        self.inner.subscriptions.clear();
        self.inner.handler.closed(&self.inner.peer_id);

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let _ = self.inner.closed_signal.send(true);
        log::info!("session closed: peer={}", self.inner.peer_id);
    }

    /// Resolves once the session has closed, however that happened.
    pub async fn wait_closed(&self) {
        let mut signal = self.inner.closed_signal.subscribe();

        while !*signal.borrow() {
            if signal.changed().await.is_err() {
                break;
            }
        }
    }

    /// READ on the peer.
    pub async fn read(
        &self,
        endpoint: u8,
        feature: u8,
        attributes: &[u16],
    ) -> Result<Vec<(u16, Value)>, ServiceError> {
        let payload = if attributes.is_empty() {
            Value::Null
        } else {
            Value::Array(
                attributes
                    .iter()
                    .map(|it| Value::Integer((*it).into()))
                    .collect(),
            )
        };

        let response = self.request(Op::Read, endpoint, feature, payload).await?;
        expect_success(&response)?;
        decode_attribute_map(&response.payload)
    }

    /// WRITE on the peer.
    pub async fn write(
        &self,
        endpoint: u8,
        feature: u8,
        values: &[(u16, Value)],
    ) -> Result<(), ServiceError> {
        let payload = Value::Map(
            values
                .iter()
                .map(|(id, value)| (Value::Integer((*id).into()), value.clone()))
                .collect(),
        );

        let response = self.request(Op::Write, endpoint, feature, payload).await?;
        expect_success(&response).map(|_| ())
    }

    /// SUBSCRIBE on the peer. The subscription id is allocated on this
    /// side; returns it together with the priming report.
    pub async fn subscribe(
        &self,
        endpoint: u8,
        feature: u8,
        attributes: &[u16],
        min_interval: Duration,
        max_interval: Duration,
    ) -> Result<(u32, Vec<(u16, Value)>), ServiceError> {
        let id = self.inner.subscriptions.allocate_watched_id();

        let payload = Value::Map(vec![
            (crate::message_key(SUB_KEY_ID), Value::Integer(id.into())),
            (
                crate::message_key(SUB_KEY_ATTRIBUTES),
                Value::Array(
                    attributes
                        .iter()
                        .map(|it| Value::Integer((*it).into()))
                        .collect(),
                ),
            ),
            (
                crate::message_key(SUB_KEY_MIN_MS),
                Value::Integer((min_interval.as_millis() as u64).into()),
            ),
            (
                crate::message_key(SUB_KEY_MAX_MS),
                Value::Integer((max_interval.as_millis() as u64).into()),
            ),
        ]);

        let response = self
            .request(Op::Subscribe, endpoint, feature, payload)
            .await?;
        expect_success(&response)?;

        self.inner.subscriptions.insert_watched(Subscription {
            id,
            endpoint,
            feature,
            attributes: attributes.to_vec(),
            min_interval,
            max_interval,
        });

        Ok((id, decode_attribute_map(&response.payload)?))
    }

    /// UNSUBSCRIBE on the peer.
    pub async fn unsubscribe(&self, id: u32) -> Result<(), ServiceError> {
        let subscription = self
            .inner
            .subscriptions
            .watched(id)
            .ok_or(ServiceError::NotFound)?;

        let payload = Value::Map(vec![(
            crate::message_key(SUB_KEY_ID),
            Value::Integer(id.into()),
        )]);

        let response = self
            .request(
                Op::Unsubscribe,
                subscription.endpoint,
                subscription.feature,
                payload,
            )
            .await?;
        expect_success(&response)?;

        self.inner.subscriptions.remove_watched(id);
        Ok(())
    }

    /// INVOKE on the peer.
    pub async fn invoke(
        &self,
        endpoint: u8,
        feature: u8,
        command: u8,
        args: Value,
    ) -> Result<Value, ServiceError> {
        let payload = Value::Map(vec![
            (
                crate::message_key(INVOKE_KEY_COMMAND),
                Value::Integer(command.into()),
            ),
            (crate::message_key(INVOKE_KEY_ARGS), args),
        ]);

        let response = self.request(Op::Invoke, endpoint, feature, payload).await?;
        expect_success(&response)?;
        Ok(response.payload)
    }

    async fn request(
        &self,
        op: Op,
        endpoint: u8,
        feature: u8,
        payload: Value,
    ) -> Result<Response, ServiceError> {
        if self.is_closed() {
            return Err(ServiceError::SessionClosed);
        }

        let (message_id, rx) = self.inner.client.allocate()?;

        let request = Request {
            op,
            message_id,
            endpoint_id: endpoint,
            feature_id: feature,
            payload,
        };

        let bytes = request.encode()?;
        if self.inner.outbound.send(bytes).is_err() {
            self.inner.client.abandon(message_id);
            return Err(ServiceError::SessionClosed);
        }

        self.inner.client.wait(message_id, rx).await
    }
}

impl SessionInner {
    fn on_frame(&self, frame: &[u8]) -> Result<(), ServiceError> {
        *self.last_activity.lock() = Instant::now();
        self.handler.activity(&self.peer_id, frame.len());

        if self.snapshots.on_message() {
            self.emit_snapshot();
        }

        match peek_message_type(frame)? {
            MessageType::Request => {
                let response = match Request::decode(frame) {
                    Ok(request) => self.handle_request(&request),
                    // The message id did not survive decoding, there
                    // is nothing to answer onto.
                    Err(e) => return Err(ServiceError::Protocol(e)),
                };

                let bytes = response.encode()?;
                if self.outbound.send(bytes).is_err() {
                    return Err(ServiceError::SessionClosed);
                }

                Ok(())
            }
            MessageType::Response => {
                let response = Response::decode(frame)?;
                if !self.client.complete(response.message_id, response) {
                    log::debug!("late response dropped: peer={}", self.peer_id);
                }

                Ok(())
            }
            MessageType::Notification => {
                let notification = Notification::decode(frame)?;

                self.remote_seen
                    .lock()
                    .insert((notification.endpoint_id, notification.feature_id));

                match self.subscriptions.watched(notification.subscription_id) {
                    Some(subscription) => {
                        self.handler.notification(
                            &self.peer_id,
                            &subscription,
                            &notification.changes,
                        );
                    }
                    None => {
                        log::debug!(
                            "notification for unknown subscription: peer={}, id={}",
                            self.peer_id,
                            notification.subscription_id
                        );
                    }
                }

                Ok(())
            }
            // Commissioning traffic has no business on an operational
            // session.
            MessageType::Commissioning(_) => {
                Err(ServiceError::Protocol(codec::Error::UnknownMessageType))
            }
        }
    }

    fn handle_request(&self, request: &Request) -> Response {
        let status_only = |status: Status| Response {
            message_id: request.message_id,
            status,
            payload: Value::Null,
        };

        match request.op {
            Op::Read => {
                let filter = match attribute_filter(&request.payload) {
                    Ok(filter) => filter,
                    Err(_) => return status_only(Status::InvalidParameter),
                };

                let device = self.device.read();
                let Some(feature) = device.feature(request.endpoint_id, request.feature_id)
                else {
                    return status_only(Status::NotFound);
                };

                Response {
                    message_id: request.message_id,
                    status: Status::Success,
                    payload: encode_attribute_map(&feature.attribute_values(&filter)),
                }
            }
            Op::Write => {
                let Value::Map(entries) = &request.payload else {
                    return status_only(Status::InvalidParameter);
                };

                if self
                    .device
                    .read()
                    .feature(request.endpoint_id, request.feature_id)
                    .is_none()
                {
                    return status_only(Status::NotFound);
                }

                for (key, value) in entries {
                    let Some(attribute) = value_as_u16(key) else {
                        return status_only(Status::InvalidParameter);
                    };

                    let status = self.handler.write(
                        &self.peer_id,
                        request.endpoint_id,
                        request.feature_id,
                        attribute,
                        value,
                    );

                    if status != Status::Success {
                        return status_only(status);
                    }
                }

                status_only(Status::Success)
            }
            Op::Subscribe => self.handle_subscribe(request),
            Op::Unsubscribe => {
                let id = match payload_u32(&request.payload, SUB_KEY_ID) {
                    Some(id) => id,
                    None => return status_only(Status::InvalidParameter),
                };

                if self.subscriptions.remove_served(id) {
                    status_only(Status::Success)
                } else {
                    status_only(Status::NotFound)
                }
            }
            Op::Invoke => {
                let Value::Map(entries) = &request.payload else {
                    return status_only(Status::InvalidParameter);
                };

                let command = codec::message::get(entries, INVOKE_KEY_COMMAND)
                    .and_then(codec::message::as_u8);
                let Some(command) = command else {
                    return status_only(Status::InvalidParameter);
                };

                let args = codec::message::get(entries, INVOKE_KEY_ARGS)
                    .cloned()
                    .unwrap_or(Value::Null);

                if self
                    .device
                    .read()
                    .feature(request.endpoint_id, request.feature_id)
                    .is_none()
                {
                    return status_only(Status::NotFound);
                }

                match self.handler.invoke(
                    &self.peer_id,
                    request.endpoint_id,
                    request.feature_id,
                    command,
                    &args,
                ) {
                    Ok(payload) => Response {
                        message_id: request.message_id,
                        status: Status::Success,
                        payload,
                    },
                    Err(status) => status_only(status),
                }
            }
        }
    }

    fn handle_subscribe(&self, request: &Request) -> Response {
        let status_only = |status: Status| Response {
            message_id: request.message_id,
            status,
            payload: Value::Null,
        };

        let Value::Map(entries) = &request.payload else {
            return status_only(Status::InvalidParameter);
        };

        let Some(id) = codec::message::get(entries, SUB_KEY_ID)
            .and_then(codec::message::as_u64)
            .and_then(|it| u32::try_from(it).ok())
        else {
            return status_only(Status::InvalidParameter);
        };

        let attributes = match codec::message::get(entries, SUB_KEY_ATTRIBUTES) {
            None => Vec::new(),
            Some(value) => match attribute_filter(value) {
                Ok(filter) => filter,
                Err(_) => return status_only(Status::InvalidParameter),
            },
        };

        let min_interval = payload_millis(entries, SUB_KEY_MIN_MS);
        let max_interval = payload_millis(entries, SUB_KEY_MAX_MS);

        let priming = {
            let device = self.device.read();
            let Some(feature) = device.feature(request.endpoint_id, request.feature_id) else {
                return status_only(Status::NotFound);
            };

            feature.attribute_values(&attributes)
        };

        self.subscriptions.insert_served(
            Subscription {
                id,
                endpoint: request.endpoint_id,
                feature: request.feature_id,
                attributes,
                min_interval,
                max_interval,
            },
            self.notifications.clone(),
        );

        Response {
            message_id: request.message_id,
            status: Status::Success,
            payload: encode_attribute_map(&priming),
        }
    }

    fn emit_snapshot(&self) {
        let snapshot = {
            let device = self.device.read();
            let remote = self.remote_seen.lock();
            Snapshot::build(&device, &remote)
        };

        log::debug!(
            "capability snapshot: peer={}, size={}",
            self.peer_id,
            snapshot.encode().len()
        );

        self.handler.snapshot(&self.peer_id, &snapshot);
    }
}

fn expect_success(response: &Response) -> Result<&Response, ServiceError> {
    match response.status {
        Status::Success => Ok(response),
        Status::NotFound => Err(ServiceError::NotFound),
        Status::PermissionDenied => Err(ServiceError::PermissionDenied),
        Status::Busy => Err(ServiceError::Busy { retry_after_secs: 0 }),
        Status::Timeout => Err(ServiceError::Timeout),
        Status::SessionClosed => Err(ServiceError::SessionClosed),
        other => Err(ServiceError::Fatal(format!("request failed: {:?}", other))),
    }
}

fn attribute_filter(payload: &Value) -> Result<Vec<u16>, ()> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::Array(values) => values
            .iter()
            .map(|value| value_as_u16(value).ok_or(()))
            .collect(),
        _ => Err(()),
    }
}

fn value_as_u16(value: &Value) -> Option<u16> {
    match value {
        Value::Integer(it) => u64::try_from(*it).ok().and_then(|it| u16::try_from(it).ok()),
        _ => None,
    }
}

fn payload_u32(payload: &Value, key: u64) -> Option<u32> {
    match payload {
        Value::Map(entries) => codec::message::get(entries, key)
            .and_then(codec::message::as_u64)
            .and_then(|it| u32::try_from(it).ok()),
        _ => None,
    }
}

fn payload_millis(entries: &[(Value, Value)], key: u64) -> Duration {
    codec::message::get(entries, key)
        .and_then(codec::message::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

fn encode_attribute_map(values: &[(u16, Value)]) -> Value {
    Value::Map(
        values
            .iter()
            .map(|(id, value)| (Value::Integer((*id).into()), value.clone()))
            .collect(),
    )
}

fn decode_attribute_map(payload: &Value) -> Result<Vec<(u16, Value)>, ServiceError> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::Map(entries) => entries
            .iter()
            .map(|(key, value)| {
                value_as_u16(key)
                    .map(|id| (id, value.clone()))
                    .ok_or(ServiceError::Protocol(codec::Error::InvalidInput))
            })
            .collect(),
        _ => Err(ServiceError::Protocol(codec::Error::InvalidInput)),
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
