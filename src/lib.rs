pub mod config;
pub mod device;
pub mod discovery;
pub mod events;
pub mod pairing;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use config::Config;
use device::{DeviceService, ServiceOptions};
use discovery::{ManualBrowser, NullAdvertiser};

use service::model::{Device, DeviceIdentity};
use service::store::MemoryCertStore;

/// In order to let integration tests and embedders start the device
/// service in-process, a function replaces the main function and runs
/// the server until interrupted.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let device = Device::new(DeviceIdentity {
        vendor_id: config.identity.vendor_id,
        product_id: config.identity.product_id,
        serial: config.identity.serial.clone(),
    });

    let service: Arc<DeviceService> = DeviceService::new(ServiceOptions {
        config,
        device,
        store: MemoryCertStore::new(),
        advertiser: NullAdvertiser::new(),
        browser: ManualBrowser::new(),
        enable_key: None,
    })?;

    service.start().await?;
    tokio::signal::ctrl_c().await?;
    service.stop().await;

    Ok(())
}
