use std::sync::Arc;

use kitsune_common::{Action, EntityId, PropertyState, PropertyValue, StatePatch};
use tokio::sync::mpsc;

use crate::{
    Result,
    bus::{Bus, BusEvent, Filter},
    store::StateStore,
};

/// One property as seen by an external protocol.
///
/// Bridges only ever request values; the actual value is owned by the
/// connector's device reports.
pub struct PropertyBridge {
    property: EntityId,
    store: Arc<StateStore>,
    bus: Arc<Bus>,
}

impl PropertyBridge {
    pub fn new(property: impl Into<EntityId>, store: Arc<StateStore>, bus: Arc<Bus>) -> Self {
        Self { property: property.into(), store, bus }
    }

    pub fn property(&self) -> &EntityId {
        &self.property
    }

    /// The requested value while a write is outstanding, the actual value
    /// otherwise
    pub async fn get_value(&self) -> Result<Option<PropertyValue>> {
        let state = self.store.find(&self.property).await?;
        Ok(state.and_then(|state| state.effective_value().cloned()))
    }

    /// Request a value. `None` withdraws an outstanding request.
    pub async fn set_expected_value(&self, value: Option<PropertyValue>) -> Result<PropertyState> {
        tracing::debug!(property = %self.property, ?value, "Bridge requested value");

        self.store
            .create_or_update(&self.property, StatePatch::new().expected(value))
            .await
    }

    /// Changes to the property: values reported by devices as well as new
    /// requests
    pub fn watch(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        self.bus.subscribe_channel(
            Filter::any()
                .property(self.property.clone())
                .actions([Action::Created, Action::Updated, Action::Reported]),
        )
    }
}

#[cfg(test)]
mod tests {
    use kitsune_common::{DataType, Owner, Pending, PropertyMeta, ValueFormat, ValueSpec};

    use super::*;
    use crate::{
        configuration::{ConfigurationCache, InMemoryConfiguration},
        storage::{MemoryBackend, StorageBackend as _},
    };

    fn bridge() -> (Arc<StateStore>, PropertyBridge) {
        let config = Arc::new(InMemoryConfiguration::new());
        config.insert(PropertyMeta::new(
            "brightness",
            ValueSpec::new(DataType::UChar).with_format(ValueFormat::range(0.0, 100.0)),
            Owner::Channel {
                connector: "zigbee".into(),
                device: "lamp".into(),
                channel: "light".into(),
            },
        ));

        let cache = Arc::new(ConfigurationCache::new(config));
        let bus = Bus::new("test");
        let storage = MemoryBackend::new().select("states");
        let store = Arc::new(StateStore::new(storage, cache, bus.clone()));

        (store.clone(), PropertyBridge::new("brightness", store, bus))
    }

    #[tokio::test]
    async fn effective_value() {
        let (store, bridge) = bridge();
        let mut changes = bridge.watch();

        assert_eq!(bridge.get_value().await.unwrap(), None);

        store
            .create_or_update(bridge.property(), StatePatch::new().actual(PropertyValue::Int(20)))
            .await
            .unwrap();
        assert_eq!(bridge.get_value().await.unwrap(), Some(PropertyValue::Int(20)));

        let state = bridge.set_expected_value(Some(PropertyValue::Int(80))).await.unwrap();
        assert_eq!(state.actual_value, Some(PropertyValue::Int(20)));
        assert_eq!(state.pending, Pending::Requested);
        assert_eq!(bridge.get_value().await.unwrap(), Some(PropertyValue::Int(80)));

        bridge.set_expected_value(None).await.unwrap();
        assert_eq!(bridge.get_value().await.unwrap(), Some(PropertyValue::Int(20)));

        assert_eq!(changes.recv().await.unwrap().action(), Action::Created);
        assert_eq!(changes.recv().await.unwrap().payload["expected_value"], serde_json::json!(80));
    }

    #[tokio::test]
    async fn out_of_range_requests_are_discarded() {
        let (_, bridge) = bridge();

        let state = bridge.set_expected_value(Some(PropertyValue::Int(150))).await.unwrap();

        assert_eq!(state.expected_value, None);
        assert_eq!(state.pending, Pending::Idle);
        assert!(!state.valid);
    }

    #[tokio::test]
    async fn one_notification_per_report() {
        let (store, bridge) = bridge();
        let mut changes = bridge.watch();

        store.report(bridge.property(), Some(PropertyValue::Int(20))).await.unwrap();
        store.report(bridge.property(), Some(PropertyValue::Int(30))).await.unwrap();

        assert_eq!(changes.recv().await.unwrap().action(), Action::Reported);
        assert_eq!(changes.recv().await.unwrap().payload["actual_value"], serde_json::json!(30));
        assert!(changes.try_recv().is_err());
    }
}
