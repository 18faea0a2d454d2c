use core::time::Duration;

use anyhow::Context as _;
use kitsune::config::Config;
use kitsune_common::{
    DataType, EntityId, Owner, PropertyMeta, PropertyValue, ValueFormat, ValueSpec,
    payload::ConnectionState,
};
use kitsune_socket::SocketConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualConfig {
    #[serde(flatten)]
    pub engine: Config,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<SocketConfig>,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: EntityId,
    /// Simulated round trip of every read and write
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub id: EntityId,
    #[serde(flatten)]
    pub spec: ValueSpec,
    #[serde(default = "enabled")]
    pub settable: bool,
    #[serde(default)]
    pub polling_interval_ms: Option<u64>,
    /// Register content at startup, in its JSON form
    #[serde(default)]
    pub initial: Option<serde_json::Value>,
}

fn enabled() -> bool {
    true
}

impl DeviceConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// Property holding the connection state of the device
    pub fn state_property(&self) -> EntityId {
        EntityId::from(format!("{}.state", self.id))
    }

    pub fn initial_values(&self) -> anyhow::Result<Vec<(EntityId, PropertyValue)>> {
        let mut values = Vec::new();

        for property in &self.properties {
            let Some(initial) = &property.initial else {
                continue;
            };

            let value = property
                .spec
                .parse_flat(initial)
                .with_context(|| format!("invalid initial value of {}", property.id))?;

            if let Some(value) = value {
                values.push((property.id.clone(), value));
            }
        }

        Ok(values)
    }
}

impl VirtualConfig {
    pub fn connector(&self) -> EntityId {
        EntityId::from(&self.engine.connector.id)
    }

    /// Metadata of every configured property plus one connection state
    /// property per device
    pub fn property_metas(&self) -> Vec<PropertyMeta> {
        let connector = self.connector();
        let states: Vec<String> = ConnectionState::ALL.iter().map(|s| s.to_string()).collect();

        let mut metas = Vec::new();

        for device in &self.devices {
            let owner = Owner::Device { connector: connector.clone(), device: device.id.clone() };

            metas.push(
                PropertyMeta::new(
                    device.state_property(),
                    ValueSpec::new(DataType::Enum).with_format(ValueFormat::Enum(states.clone())),
                    owner.clone(),
                )
                .read_only(),
            );

            for property in &device.properties {
                let mut meta =
                    PropertyMeta::new(property.id.clone(), property.spec.clone(), owner.clone())
                        .with_address(property.id.as_str());

                meta.settable = property.settable;
                meta.enabled = device.enabled;
                meta.polling_interval = property.polling_interval_ms.map(Duration::from_millis);

                metas.push(meta);
            }
        }

        metas
    }
}
