use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Category, EntityId, ValueSpec};

/// Chain of entities owning a property, from the connector down
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Owner {
    Channel { connector: EntityId, device: EntityId, channel: EntityId },
    Device { connector: EntityId, device: EntityId },
    Connector { connector: EntityId },
}

impl Owner {
    pub fn category(&self) -> Category {
        match self {
            Owner::Connector { .. } => Category::Connector,
            Owner::Device { .. } => Category::Device,
            Owner::Channel { .. } => Category::Channel,
        }
    }

    pub fn connector(&self) -> &EntityId {
        match self {
            Owner::Connector { connector }
            | Owner::Device { connector, .. }
            | Owner::Channel { connector, .. } => connector,
        }
    }

    pub fn device(&self) -> Option<&EntityId> {
        match self {
            Owner::Connector { .. } => None,
            Owner::Device { device, .. } | Owner::Channel { device, .. } => Some(device),
        }
    }

    /// Every entity in the chain, outermost first
    pub fn ids(&self) -> Vec<&EntityId> {
        match self {
            Owner::Connector { connector } => vec![connector],
            Owner::Device { connector, device } => vec![connector, device],
            Owner::Channel { connector, device, channel } => vec![connector, device, channel],
        }
    }
}

/// Static configuration of a property needed to reconcile its state
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMeta {
    pub id: EntityId,
    pub spec: ValueSpec,
    /// Connector specific address of the value on the device (register, key, ...)
    pub address: Option<String>,
    pub owner: Owner,
    /// Whether the device accepts writes for this property
    pub settable: bool,
    /// False when the property or its owning device is disabled
    pub enabled: bool,
    /// Scheduled device read interval
    pub polling_interval: Option<Duration>,
}

impl PropertyMeta {
    pub fn new(id: impl Into<EntityId>, spec: ValueSpec, owner: Owner) -> Self {
        Self {
            id: id.into(),
            spec,
            address: None,
            owner,
            settable: true,
            enabled: true,
            polling_interval: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.settable = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn polled_every(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_format() {
        let owner = Owner::Channel {
            connector: "modbus".into(),
            device: "thermostat".into(),
            channel: "heating".into(),
        };

        assert_eq!(
            serde_json::to_value(&owner).unwrap(),
            serde_json::json!({
                "connector": "modbus",
                "device": "thermostat",
                "channel": "heating",
            })
        );
        assert_eq!(owner.category(), Category::Channel);

        assert_eq!(
            serde_json::from_value::<Owner>(serde_json::json!({
                "connector": "modbus",
                "device": "meter",
            }))
            .unwrap(),
            Owner::Device { connector: "modbus".into(), device: "meter".into() }
        );
    }
}
