use core::time::Duration;
use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format as _, Serialized, Toml},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::Result;

/// Engine configuration of a single connector process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connector: ConnectorConfig,
    pub writer: WriterConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<ExchangeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub id: String,
    /// Upper bound of a single device read or write
    pub io_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self { id: "virtual".into(), io_timeout_ms: 3_000 }
    }
}

impl ConnectorConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterKind {
    #[default]
    Periodic,
    Event,
    Exchange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub kind: WriterKind,
    /// Scan interval of the periodic writer
    pub tick_ms: u64,
    /// In-flight writes older than this are dispatched again
    pub stuck_timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { kind: WriterKind::Periodic, tick_ms: 500, stuck_timeout_ms: 5_000 }
    }
}

impl WriterConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub tick_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { tick_ms: 10 }
    }
}

impl QueueConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { namespace: "kitsune_property_states".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// `host:port` of the MQTT broker
    pub addr: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_client_id() -> String {
    "kitsune".into()
}

/// Load a configuration from defaults, then `path` (if it exists), then
/// `KITSUNE_` environment variables (`KITSUNE_WRITER__TICK_MS=250`).
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::new().merge(Serialized::defaults(T::default()));

    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }

    let config = figment.merge(Env::prefixed("KITSUNE_").split("__")).extract()?;

    Ok(config)
}
