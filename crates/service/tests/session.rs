use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ciborium::Value;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use codec::message::Status;

use mash_service::ServiceError;
use mash_service::model::{
    Device, DeviceIdentity, ENDPOINT_TYPE_EV_CHARGER, Endpoint, Feature,
};
use mash_service::session::subscriptions::Subscription;
use mash_service::session::{Session, SessionHandler, SessionOptions};

const FEATURE_MEASUREMENT: u8 = 1;
const ATTR_POWER: u16 = 1;
const ATTR_STATE: u16 = 2;
const CMD_START: u8 = 1;

fn charger_device() -> Arc<RwLock<Device>> {
    let mut device = Device::new(DeviceIdentity {
        vendor_id: 0x1234,
        product_id: 0x0001,
        serial: "EVC-001".to_string(),
    });

    let mut endpoint = Endpoint::new(1, ENDPOINT_TYPE_EV_CHARGER, "charger");
    endpoint.add_feature(
        FEATURE_MEASUREMENT,
        Feature::new(0x0041, 0)
            .with_attributes(&[ATTR_POWER, ATTR_STATE])
            .with_commands(&[CMD_START]),
    );
    device.add_endpoint(endpoint);

    {
        let feature = device.feature_mut(1, FEATURE_MEASUREMENT).unwrap();
        feature.set_attribute(ATTR_POWER, Value::Integer(0.into()));
        feature.set_attribute(ATTR_STATE, Value::Text("idle".to_string()));
    }

    Arc::new(RwLock::new(device))
}

/// Device-side handler: applies writes to the model and fans the
/// change out to the session's served subscriptions.
struct DeviceSideHandler {
    device: Arc<RwLock<Device>>,
    session: Mutex<Option<Session>>,
}

impl SessionHandler for DeviceSideHandler {
    fn write(&self, _peer: &str, endpoint: u8, feature: u8, attribute: u16, value: &Value) -> Status {
        let status = match self.device.write().feature_mut(endpoint, feature) {
            Some(it) => it.set_attribute(attribute, value.clone()),
            None => Status::NotFound,
        };

        if status == Status::Success {
            if let Some(session) = &*self.session.lock() {
                session.notify_attribute_change(endpoint, feature, attribute, value);
            }
        }

        status
    }

    fn invoke(
        &self,
        _peer: &str,
        _endpoint: u8,
        _feature: u8,
        command: u8,
        _payload: &Value,
    ) -> Result<Value, Status> {
        match command {
            CMD_START => Ok(Value::Text("started".to_string())),
            _ => Err(Status::Unsupported),
        }
    }
}

/// Controller-side handler: forwards inbound notifications to the
/// test.
struct ControllerSideHandler {
    notifications: mpsc::UnboundedSender<(u32, Vec<(u16, Value)>)>,
}

impl SessionHandler for ControllerSideHandler {
    fn notification(&self, _peer: &str, subscription: &Subscription, changes: &[(u16, Value)]) {
        let _ = self
            .notifications
            .send((subscription.id, changes.to_vec()));
    }
}

struct Pair {
    device_session: Session,
    controller_session: Session,
    notifications: mpsc::UnboundedReceiver<(u32, Vec<(u16, Value)>)>,
}

fn connect() -> Pair {
    let (device_stream, controller_stream) = tokio::io::duplex(16 * 1024);

    let device = charger_device();
    let device_handler = Arc::new(DeviceSideHandler {
        device: device.clone(),
        session: Mutex::new(None),
    });

    let device_session = Session::spawn(
        device_stream,
        device,
        device_handler.clone(),
        SessionOptions::new("controller"),
    );
    *device_handler.session.lock() = Some(device_session.clone());

    let (notif_tx, notifications) = mpsc::unbounded_channel();
    let controller_session = Session::spawn(
        controller_stream,
        Arc::new(RwLock::new(Device::new(DeviceIdentity {
            vendor_id: 0,
            product_id: 0,
            serial: "CTRL".to_string(),
        }))),
        Arc::new(ControllerSideHandler {
            notifications: notif_tx,
        }),
        SessionOptions::new("device"),
    );

    Pair {
        device_session,
        controller_session,
        notifications,
    }
}

#[tokio::test]
async fn read_returns_current_values() -> Result<()> {
    let pair = connect();

    let values = pair.controller_session.read(1, FEATURE_MEASUREMENT, &[]).await?;
    assert_eq!(values.len(), 2);

    let filtered = pair
        .controller_session
        .read(1, FEATURE_MEASUREMENT, &[ATTR_STATE])
        .await?;
    assert_eq!(filtered, vec![(ATTR_STATE, Value::Text("idle".to_string()))]);

    Ok(())
}

#[tokio::test]
async fn read_unknown_feature_is_not_found() {
    let pair = connect();

    assert!(matches!(
        pair.controller_session.read(9, 9, &[]).await,
        Err(ServiceError::NotFound)
    ));
}

#[tokio::test]
async fn write_lands_in_the_device_model() -> Result<()> {
    let pair = connect();

    pair.controller_session
        .write(
            1,
            FEATURE_MEASUREMENT,
            &[(ATTR_POWER, Value::Integer(11000.into()))],
        )
        .await?;

    let values = pair
        .controller_session
        .read(1, FEATURE_MEASUREMENT, &[ATTR_POWER])
        .await?;
    assert_eq!(values, vec![(ATTR_POWER, Value::Integer(11000.into()))]);

    Ok(())
}

#[tokio::test]
async fn invoke_round_trips_through_the_handler() -> Result<()> {
    let pair = connect();

    let result = pair
        .controller_session
        .invoke(1, FEATURE_MEASUREMENT, CMD_START, Value::Null)
        .await?;
    assert_eq!(result, Value::Text("started".to_string()));

    assert!(
        pair.controller_session
            .invoke(1, FEATURE_MEASUREMENT, 99, Value::Null)
            .await
            .is_err()
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn subscription_coalesces_within_min_interval() -> Result<()> {
    let mut pair = connect();

    let (id, priming) = pair
        .controller_session
        .subscribe(
            1,
            FEATURE_MEASUREMENT,
            &[ATTR_POWER],
            Duration::from_millis(200),
            Duration::from_secs(60),
        )
        .await?;
    assert_eq!(priming.len(), 1);

    for value in [1000i64, 2000, 3000] {
        pair.controller_session
            .write(
                1,
                FEATURE_MEASUREMENT,
                &[(ATTR_POWER, Value::Integer(value.into()))],
            )
            .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (sub_id, changes) =
        tokio::time::timeout(Duration::from_millis(400), pair.notifications.recv())
            .await?
            .expect("notification arrives");

    assert_eq!(sub_id, id);
    assert_eq!(changes, vec![(ATTR_POWER, Value::Integer(3000.into()))]);

    // No second notification inside the same min interval.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), pair.notifications.recv())
            .await
            .is_err()
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn subscription_heartbeat_fires_when_idle() -> Result<()> {
    let mut pair = connect();

    pair.controller_session
        .subscribe(
            1,
            FEATURE_MEASUREMENT,
            &[],
            Duration::from_millis(10),
            Duration::from_millis(200),
        )
        .await?;

    let (_, changes) =
        tokio::time::timeout(Duration::from_millis(400), pair.notifications.recv())
            .await?
            .expect("heartbeat arrives");

    assert!(changes.is_empty());
    Ok(())
}

#[tokio::test]
async fn subscription_ids_are_unique_per_direction() -> Result<()> {
    let pair = connect();

    let (first, _) = pair
        .controller_session
        .subscribe(
            1,
            FEATURE_MEASUREMENT,
            &[],
            Duration::ZERO,
            Duration::from_secs(60),
        )
        .await?;
    let (second, _) = pair
        .controller_session
        .subscribe(
            1,
            FEATURE_MEASUREMENT,
            &[],
            Duration::ZERO,
            Duration::from_secs(60),
        )
        .await?;

    assert_ne!(first, second);
    assert_eq!(pair.device_session.served_subscriptions(), 2);

    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_the_flow() -> Result<()> {
    let mut pair = connect();

    let (id, _) = pair
        .controller_session
        .subscribe(
            1,
            FEATURE_MEASUREMENT,
            &[],
            Duration::ZERO,
            Duration::from_secs(60),
        )
        .await?;

    pair.controller_session.unsubscribe(id).await?;
    assert_eq!(pair.device_session.served_subscriptions(), 0);

    pair.controller_session
        .write(
            1,
            FEATURE_MEASUREMENT,
            &[(ATTR_POWER, Value::Integer(500.into()))],
        )
        .await?;

    assert!(
        tokio::time::timeout(Duration::from_millis(100), pair.notifications.recv())
            .await
            .is_err()
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn close_cancels_in_flight_requests() {
    // A peer that accepts the connection and then never answers.
    let (stream, _held_open) = tokio::io::duplex(4096);

    let mut options = SessionOptions::new("silent");
    options.request_timeout = Duration::from_secs(5);

    let session = Session::spawn(
        stream,
        charger_device(),
        Arc::new(ControllerSideHandler {
            notifications: mpsc::unbounded_channel().0,
        }),
        options,
    );

    let in_flight = {
        let session = session.clone();
        tokio::spawn(async move { session.read(1, FEATURE_MEASUREMENT, &[]).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.close();
    session.close();

    assert!(matches!(
        in_flight.await.unwrap(),
        Err(ServiceError::SessionClosed)
    ));
    assert!(session.is_closed());

    assert!(matches!(
        session.read(1, FEATURE_MEASUREMENT, &[]).await,
        Err(ServiceError::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn request_timeout_is_not_a_close() {
    let (stream, _held_open) = tokio::io::duplex(4096);

    let mut options = SessionOptions::new("silent");
    options.request_timeout = Duration::from_millis(100);

    let session = Session::spawn(
        stream,
        charger_device(),
        Arc::new(ControllerSideHandler {
            notifications: mpsc::unbounded_channel().0,
        }),
        options,
    );

    assert!(matches!(
        session.read(1, FEATURE_MEASUREMENT, &[]).await,
        Err(ServiceError::Timeout)
    ));
    assert!(!session.is_closed());
}
