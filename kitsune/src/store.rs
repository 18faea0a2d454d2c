//! Persistent property states, the single place state changes go through.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use kitsune_common::{
    Action, EntityId, Owner, PropertyMeta, PropertyState, PropertyValue, StatePatch, StatePayload,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    Error, Result,
    bus::{Bus, BusEvent},
    configuration::ConfigurationCache,
    storage::StorageNamespace,
};

/// What is persisted per property. The owner is kept so deletions can be
/// announced after the configuration is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    state: PropertyState,
    owner: Owner,
}

pub struct StateStore {
    storage: Arc<dyn StorageNamespace>,
    cache: Arc<ConfigurationCache>,
    bus: Arc<Bus>,
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl StateStore {
    pub fn new(
        storage: Arc<dyn StorageNamespace>,
        cache: Arc<ConfigurationCache>,
        bus: Arc<Bus>,
    ) -> Self {
        Self { storage, cache, bus, locks: DashMap::new() }
    }

    fn lock_for(&self, id: &EntityId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }

    fn meta(&self, id: &EntityId) -> Result<Arc<PropertyMeta>> {
        self.cache.get(id).ok_or_else(|| Error::NotFound(id.clone()))
    }

    async fn load(&self, id: &EntityId) -> Result<Option<Document>> {
        let json = self
            .storage
            .get(id.as_str())
            .await
            .map_err(|e| Error::InvalidState(format!("reading state of {id}: {e}")))?;

        let Some(json) = json else {
            return Ok(None);
        };

        let document: Document = serde_json::from_value(json)
            .map_err(|e| Error::InvalidState(format!("malformed state of {id}: {e}")))?;

        if !document.state.is_consistent() {
            return Err(Error::InvalidState(format!(
                "state of {id} is pending without an expected value"
            )));
        }

        Ok(Some(document))
    }

    async fn save(&self, document: &Document) -> Result<()> {
        let id = &document.state.id;
        let json = serde_json::to_value(document)?;

        let accepted = self
            .storage
            .set(id.as_str(), json)
            .await
            .map_err(|e| Error::InvalidState(format!("writing state of {id}: {e}")))?;

        if !accepted {
            return Err(Error::InvalidState(format!("storage refused state of {id}")));
        }

        Ok(())
    }

    async fn announce(&self, action: Action, document: &Document) {
        let event =
            BusEvent::state(self.bus.source().clone(), action, &document.state, &document.owner);
        self.bus.publish(event).await;
    }

    pub async fn find(&self, id: &EntityId) -> Result<Option<PropertyState>> {
        Ok(self.load(id).await?.map(|document| document.state))
    }

    /// Create the state of a configured property. Fails if it already has one.
    pub async fn create(&self, id: &EntityId, patch: StatePatch) -> Result<PropertyState> {
        let meta = self.meta(id)?;

        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        if self.load(id).await?.is_some() {
            return Err(Error::InvalidArgument(format!("state of {id} already exists")));
        }

        let document = self.insert(&meta, &patch).await?;
        drop(guard);

        self.announce(Action::Created, &document).await;

        Ok(document.state)
    }

    /// Merge `patch` into the stored state, provided it is still the one
    /// `state` was read from.
    ///
    /// Returns `None` if another update won the race or the state is gone.
    pub async fn update(
        &self,
        state: &PropertyState,
        patch: StatePatch,
    ) -> Result<Option<PropertyState>> {
        let id = &state.id;
        let meta = self.meta(id)?;

        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let Some(stored) = self.load(id).await? else {
            tracing::debug!(property = %id, "State vanished before update");
            return Ok(None);
        };

        if stored.state.updated_at != state.updated_at {
            tracing::debug!(property = %id, "Lost update race");
            return Ok(None);
        }

        let document = Document {
            state: stored.state.apply(&patch, &meta.spec, Utc::now()),
            owner: meta.owner.clone(),
        };
        self.save(&document).await?;
        drop(guard);

        self.announce(Action::Updated, &document).await;

        Ok(Some(document.state))
    }

    /// Merge `patch` into the current state, creating it on first use
    pub async fn create_or_update(
        &self,
        id: &EntityId,
        patch: StatePatch,
    ) -> Result<PropertyState> {
        let (action, document) = self.merge(id, &patch).await?;

        self.announce(action, &document).await;

        Ok(document.state)
    }

    /// Record a value confirmed by the device as the actual value.
    ///
    /// Only a `reported` event is published, whether or not the state
    /// existed before.
    pub async fn report(
        &self,
        id: &EntityId,
        value: Option<PropertyValue>,
    ) -> Result<PropertyState> {
        let (_, document) = self.merge(id, &StatePatch::new().actual(value)).await?;

        self.announce(Action::Reported, &document).await;

        Ok(document.state)
    }

    async fn merge(&self, id: &EntityId, patch: &StatePatch) -> Result<(Action, Document)> {
        let meta = self.meta(id)?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        match self.load(id).await? {
            Some(stored) => {
                let document = Document {
                    state: stored.state.apply(patch, &meta.spec, Utc::now()),
                    owner: meta.owner.clone(),
                };
                self.save(&document).await?;
                Ok((Action::Updated, document))
            }
            None => Ok((Action::Created, self.insert(&meta, patch).await?)),
        }
    }

    /// Adopt a state published by another process, unless the stored one is
    /// at least as recent. Adopted states are not announced again.
    ///
    /// Returns whether the stored state was replaced.
    pub async fn mirror(&self, event: &BusEvent) -> Result<bool> {
        let meta = self.meta(&event.property)?;
        let state = StatePayload::parse(&event.payload, &meta.spec)?;

        if state.id != event.property {
            return Err(Error::InvalidArgument(format!(
                "payload of {} describes {}",
                event.property, state.id
            )));
        }

        let lock = self.lock_for(&state.id);
        let _guard = lock.lock().await;

        // an unreadable local copy is replaced
        if let Ok(Some(stored)) = self.load(&state.id).await
            && stored.state.updated_at >= state.updated_at
        {
            return Ok(false);
        }

        tracing::debug!(property = %state.id, source = %event.source, "Adopting remote state");

        self.save(&Document { state, owner: meta.owner.clone() }).await?;

        Ok(true)
    }

    async fn insert(&self, meta: &PropertyMeta, patch: &StatePatch) -> Result<Document> {
        let state = PropertyState::create(meta.id.clone(), patch, &meta.spec, Utc::now())?;

        if !state.valid {
            tracing::warn!(
                property = %meta.id,
                "Created state holds a value outside of its format"
            );
        }

        let document = Document { state, owner: meta.owner.clone() };
        self.save(&document).await?;

        Ok(document)
    }

    /// Remove a state. Returns whether one existed.
    pub async fn delete(&self, id: &EntityId) -> Result<bool> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let stored = match self.load(id).await {
            Ok(stored) => stored,
            Err(Error::InvalidState(e)) => {
                tracing::warn!(property = %id, "Deleting unreadable state: {e}");
                None
            }
            Err(e) => return Err(e),
        };

        let removed = self
            .storage
            .delete(id.as_str())
            .await
            .map_err(|e| Error::InvalidState(format!("deleting state of {id}: {e}")))?;

        drop(guard);
        drop(lock);

        // kept while anyone else holds or waits for it
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);

        if let Some(stored) = stored {
            self.announce(Action::Deleted, &stored).await;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use kitsune_common::{DataType, Pending, ValueFormat, ValueSpec};

    use super::*;
    use crate::{
        bus::Filter,
        configuration::InMemoryConfiguration,
        storage::{MemoryBackend, StorageBackend as _},
    };

    struct Fixture {
        config: Arc<InMemoryConfiguration>,
        cache: Arc<ConfigurationCache>,
        storage: Arc<dyn StorageNamespace>,
        bus: Arc<Bus>,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(InMemoryConfiguration::new());
        config.insert(PropertyMeta::new(
            "setpoint",
            ValueSpec::new(DataType::Float).with_format(ValueFormat::range(5.0, 30.0)),
            Owner::Device { connector: "modbus".into(), device: "thermostat".into() },
        ));

        let cache = Arc::new(ConfigurationCache::new(config.clone()));
        let storage = MemoryBackend::new().select("states");
        let bus = Bus::new("test");
        let store = StateStore::new(storage.clone(), cache.clone(), bus.clone());

        Fixture { config, cache, storage, bus, store }
    }

    fn id() -> EntityId {
        "setpoint".into()
    }

    #[tokio::test]
    async fn create_and_find() {
        let f = fixture();
        let mut events = f.bus.subscribe_channel(Filter::any());

        assert_eq!(f.store.find(&id()).await.unwrap(), None);

        let created = f
            .store
            .create(&id(), StatePatch::new().actual(PropertyValue::Float(19.5)))
            .await
            .unwrap();

        assert_eq!(f.store.find(&id()).await.unwrap(), Some(created.clone()));

        let event = events.recv().await.unwrap();
        assert_eq!(event.action(), Action::Created);
        assert_eq!(event.payload["actual_value"], serde_json::json!(19.5));
        assert_eq!(event.payload["device"], serde_json::json!("thermostat"));

        assert!(matches!(
            f.store.create(&id(), StatePatch::new()).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let f = fixture();

        assert!(matches!(
            f.store.create(&id(), StatePatch::new().actual(PropertyValue::Bool(true))).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            f.store.create(&id(), StatePatch::new().pending(Pending::Requested)).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            f.store.create(&"humidity".into(), StatePatch::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_detects_lost_races() {
        let f = fixture();

        let first = f.store.create(&id(), StatePatch::new()).await.unwrap();
        let second = f
            .store
            .update(&first, StatePatch::new().expected(PropertyValue::Float(21.0)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(second.pending, Pending::Requested);
        assert!(second.updated_at > first.updated_at);

        // stale snapshot
        assert_eq!(
            f.store
                .update(&first, StatePatch::new().expected(PropertyValue::Float(22.0)))
                .await
                .unwrap(),
            None
        );
        assert_eq!(f.store.find(&id()).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn create_or_update_merges() {
        let f = fixture();

        f.store
            .create_or_update(&id(), StatePatch::new().expected(PropertyValue::Float(21.0)))
            .await
            .unwrap();
        let state = f
            .store
            .create_or_update(&id(), StatePatch::new().actual(PropertyValue::Float(21.0)))
            .await
            .unwrap();

        assert_eq!(state.actual_value, Some(PropertyValue::Float(21.0)));
        assert_eq!(state.expected_value, None);
        assert_eq!(state.pending, Pending::Idle);
    }

    #[tokio::test]
    async fn delete_outlives_configuration() {
        let f = fixture();
        f.store.create(&id(), StatePatch::new()).await.unwrap();

        f.config.remove(&id());
        f.cache.clear();

        let mut events = f.bus.subscribe_channel(Filter::any());

        assert!(f.store.delete(&id()).await.unwrap());
        assert!(!f.store.delete(&id()).await.unwrap());

        let event = events.recv().await.unwrap();
        assert_eq!(event.action(), Action::Deleted);
        assert_eq!(event.owner.connector(), &EntityId::from("modbus"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn inconsistent_documents_are_rejected() {
        let f = fixture();
        f.storage
            .set(
                "setpoint",
                serde_json::json!({
                    "state": {
                        "id": "setpoint",
                        "actual_value": null,
                        "expected_value": null,
                        "pending": true,
                        "valid": true,
                        "created_at": "2024-04-05T10:00:00Z",
                        "updated_at": "2024-04-05T10:00:00Z",
                    },
                    "owner": { "connector": "modbus", "device": "thermostat" },
                }),
            )
            .await
            .unwrap();

        assert!(matches!(f.store.find(&id()).await, Err(Error::InvalidState(_))));
        assert!(f.store.delete(&id()).await.unwrap());
    }

    #[tokio::test]
    async fn reports_announce_once() {
        let f = fixture();
        let mut events = f.bus.subscribe_channel(Filter::any());

        f.store.report(&id(), Some(PropertyValue::Float(19.5))).await.unwrap();
        f.store.report(&id(), Some(PropertyValue::Float(20.0))).await.unwrap();

        for value in [19.5, 20.0] {
            let event = events.recv().await.unwrap();
            assert_eq!(event.action(), Action::Reported);
            assert_eq!(event.payload["actual_value"], serde_json::json!(value));
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_finite_reports_stay_readable() {
        let f = fixture();

        f.store.report(&id(), Some(PropertyValue::Float(19.5))).await.unwrap();
        let state = f.store.report(&id(), Some(PropertyValue::Float(f64::NAN))).await.unwrap();

        assert!(!state.valid);
        assert_eq!(f.store.find(&id()).await.unwrap(), Some(state.clone()));
        assert_eq!(state.actual_value, Some(PropertyValue::Float(19.5)));

        let state = f.store.report(&id(), Some(PropertyValue::Float(20.0))).await.unwrap();
        assert!(state.valid);
    }

    #[tokio::test]
    async fn mirror_keeps_newest() {
        let hub = fixture();
        let f = fixture();
        let mut published = hub.bus.subscribe_channel(Filter::any());
        let mut local = f.bus.subscribe_channel(Filter::any());

        let remote = hub
            .store
            .create(&id(), StatePatch::new().expected(PropertyValue::Float(21.0)))
            .await
            .unwrap();
        let event = published.recv().await.unwrap();

        assert!(f.store.mirror(&event).await.unwrap());
        assert_eq!(f.store.find(&id()).await.unwrap(), Some(remote.clone()));
        assert!(!f.store.mirror(&event).await.unwrap());

        let newer = f
            .store
            .update(&remote, StatePatch::new().actual(PropertyValue::Float(20.0)))
            .await
            .unwrap()
            .unwrap();
        assert!(!f.store.mirror(&event).await.unwrap());
        assert_eq!(f.store.find(&id()).await.unwrap(), Some(newer));

        // only the local update was announced
        assert_eq!(local.recv().await.unwrap().action(), Action::Updated);
        assert!(local.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_releases_lock() {
        let f = fixture();

        f.store.create(&id(), StatePatch::new()).await.unwrap();
        assert_eq!(f.store.locks.len(), 1);

        f.store.delete(&id()).await.unwrap();
        assert!(f.store.locks.is_empty());
    }
}
