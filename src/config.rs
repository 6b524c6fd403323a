use clap::Parser;
use serde::Deserialize;

use std::{fs::read_to_string, net::SocketAddr, time::Duration};

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceSection {
    /// device listen address
    ///
    /// the address and port the TLS listener binds. commissioning and
    /// operational connections share one listener; the client
    /// certificate decides the path a connection takes.
    #[serde(default = "DeviceSection::listen_address")]
    pub listen_address: SocketAddr,

    /// maximum number of non-test zones
    ///
    /// once this many non-test zones are commissioned the device turns
    /// further commissioning attempts away as permanently busy. test
    /// zones never count against the limit.
    #[serde(default = "DeviceSection::max_zones")]
    pub max_zones: usize,

    /// pairing discriminator
    ///
    /// 12-bit identifier controllers use to tell devices of interest
    /// apart. pairing requests with a different discriminator are
    /// ignored.
    #[serde(default = "DeviceSection::discriminator")]
    pub discriminator: u16,

    /// setup code
    ///
    /// the PASE password. printed on the device or its packaging in a
    /// real deployment; configurable here for bench setups.
    #[serde(default = "DeviceSection::setup_code")]
    pub setup_code: u32,

    /// commissioning window duration, seconds
    ///
    /// how long the device stays commissionable after the window
    /// opens.
    #[serde(default = "DeviceSection::commissioning_window_secs")]
    pub commissioning_window_secs: u64,

    /// cooldown after a failed commissioning attempt, seconds
    ///
    /// while the cooldown runs, new attempts receive a busy envelope
    /// carrying the remaining time.
    #[serde(default = "DeviceSection::connection_cooldown_secs")]
    pub connection_cooldown_secs: u64,

    /// test mode
    ///
    /// marks zones commissioned into this instance as test zones.
    #[serde(default)]
    pub test_mode: bool,

    /// stale connection timeout, seconds
    ///
    /// connections without traffic for this long are closed by the
    /// reaper. zero disables the reaper entirely.
    #[serde(default = "DeviceSection::stale_connection_timeout_secs")]
    pub stale_connection_timeout_secs: u64,

    /// reaper tick interval, seconds
    #[serde(default = "DeviceSection::reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// listen for pairing requests
    ///
    /// when enabled the device browses for controllers soliciting
    /// pairing and opens the commissioning window on a matching
    /// discriminator.
    #[serde(default = "DeviceSection::listen_for_pairing_requests")]
    pub listen_for_pairing_requests: bool,

    /// device categories advertised while commissionable
    #[serde(default)]
    pub categories: Vec<String>,
}

impl DeviceSection {
    fn listen_address() -> SocketAddr {
        "0.0.0.0:44330".parse().unwrap()
    }

    fn max_zones() -> usize {
        4
    }

    fn discriminator() -> u16 {
        3840
    }

    fn setup_code() -> u32 {
        20252025
    }

    fn commissioning_window_secs() -> u64 {
        300
    }

    fn connection_cooldown_secs() -> u64 {
        10
    }

    fn stale_connection_timeout_secs() -> u64 {
        60
    }

    fn reaper_interval_secs() -> u64 {
        5
    }

    fn listen_for_pairing_requests() -> bool {
        true
    }

    pub fn commissioning_window(&self) -> Duration {
        Duration::from_secs(self.commissioning_window_secs)
    }

    pub fn connection_cooldown(&self) -> Duration {
        Duration::from_secs(self.connection_cooldown_secs)
    }

    pub fn stale_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_connection_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            listen_address: Self::listen_address(),
            max_zones: Self::max_zones(),
            discriminator: Self::discriminator(),
            setup_code: Self::setup_code(),
            commissioning_window_secs: Self::commissioning_window_secs(),
            connection_cooldown_secs: Self::connection_cooldown_secs(),
            test_mode: false,
            stale_connection_timeout_secs: Self::stale_connection_timeout_secs(),
            reaper_interval_secs: Self::reaper_interval_secs(),
            listen_for_pairing_requests: Self::listen_for_pairing_requests(),
            categories: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct IdentitySection {
    #[serde(default = "IdentitySection::vendor_id")]
    pub vendor_id: u16,

    #[serde(default = "IdentitySection::product_id")]
    pub product_id: u16,

    #[serde(default = "IdentitySection::serial")]
    pub serial: String,

    /// human readable device name used in advertisements
    #[serde(default = "IdentitySection::name")]
    pub name: String,
}

impl IdentitySection {
    fn vendor_id() -> u16 {
        0xfff1
    }

    fn product_id() -> u16 {
        0x0001
    }

    fn serial() -> String {
        "mash-dev-0001".to_string()
    }

    fn name() -> String {
        "mash device".to_string()
    }
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            vendor_id: Self::vendor_id(),
            product_id: Self::product_id(),
            serial: Self::serial(),
            name: Self::name(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the
    /// logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration
    /// file, otherwise the default configuration is used.
    pub fn load() -> anyhow::Result<Self> {
        Ok(serde_json5::from_str(
            &Cli::parse()
                .config
                .and_then(|path| read_to_string(path).ok())
                .unwrap_or_else(|| "{}".to_string()),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let config: Config = serde_json5::from_str("{}").unwrap();

        assert_eq!(config.device.max_zones, 4);
        assert_eq!(config.device.discriminator, 3840);
        assert!(config.device.listen_for_pairing_requests);
        assert_eq!(
            config.device.stale_connection_timeout(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: Config = serde_json5::from_str(
            r#"{ device: { max_zones: 1, test_mode: true }, identity: { serial: "X-1" } }"#,
        )
        .unwrap();

        assert_eq!(config.device.max_zones, 1);
        assert!(config.device.test_mode);
        assert_eq!(config.identity.serial, "X-1");
        assert_eq!(config.device.setup_code, 20252025);
    }
}
