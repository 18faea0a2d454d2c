//! Write dispatch: finding properties whose expected value still has to reach
//! the device and handing them to the connector queue.

use core::time::Duration;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use kitsune_common::{EntityId, Pending, StatePatch};
use tokio::time::Instant;

use crate::{
    Result,
    configuration::ConfigurationCache,
    queue::{QueueHandle, QueueMessage, WriteProperty},
    store::StateStore,
};

mod event;
mod periodic;

pub use self::{
    event::{EventWriter, ExchangeWriter},
    periodic::PeriodicWriter,
};

/// A strategy deciding when reconciliation passes run
pub trait Writer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start triggering passes. Does nothing if already connected.
    fn connect(&self);

    fn disconnect(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skipped {
    /// Not configured, or gone from the configuration
    Unresolved,
    /// Owned by another connector
    Foreign,
    Disabled,
    ReadOnly,
    NoState,
    /// Nothing to write, or a write is already on its way
    NotEligible,
    /// Another update changed the state first
    LostRace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Dispatched,
    Skipped(Skipped),
}

/// Wall time advanced by the tokio clock, so dispatch ages follow paused
/// time in tests
#[derive(Debug, Clone, Copy)]
struct Clock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    fn new() -> Self {
        Self { base: Utc::now(), origin: Instant::now() }
    }

    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.origin.elapsed())
            .ok()
            .and_then(|elapsed| self.base.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// The reconciliation pass shared by every writer
pub struct Reconciler {
    connector: EntityId,
    store: Arc<StateStore>,
    cache: Arc<ConfigurationCache>,
    queue: QueueHandle,
    stuck_timeout: Duration,
    clock: Clock,
}

impl Reconciler {
    pub fn new(
        connector: EntityId,
        store: Arc<StateStore>,
        cache: Arc<ConfigurationCache>,
        queue: QueueHandle,
        stuck_timeout: Duration,
    ) -> Self {
        Self { connector, store, cache, queue, stuck_timeout, clock: Clock::new() }
    }

    pub fn connector(&self) -> &EntityId {
        &self.connector
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn stuck_timeout(&self) -> Duration {
        self.stuck_timeout
    }

    pub fn cache(&self) -> &Arc<ConfigurationCache> {
        &self.cache
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Dispatch the expected value of `property` if it is due.
    ///
    /// The state moves to in-flight before the write is queued, so at most
    /// one write per property is outstanding until the stuck timeout.
    pub async fn reconcile(&self, property: &EntityId) -> Result<Outcome> {
        let Some(meta) = self.cache.get(property) else {
            return Ok(Outcome::Skipped(Skipped::Unresolved));
        };

        if meta.owner.connector() != &self.connector {
            return Ok(Outcome::Skipped(Skipped::Foreign));
        }
        if !meta.enabled {
            return Ok(Outcome::Skipped(Skipped::Disabled));
        }
        if !meta.settable {
            return Ok(Outcome::Skipped(Skipped::ReadOnly));
        }

        let Some(state) = self.store.find(property).await? else {
            return Ok(Outcome::Skipped(Skipped::NoState));
        };

        let now = self.clock.now();

        let Some(value) = state.expected_value.clone() else {
            return Ok(Outcome::Skipped(Skipped::NotEligible));
        };
        if !state.is_write_eligible(now, self.stuck_timeout) {
            return Ok(Outcome::Skipped(Skipped::NotEligible));
        }

        if let Pending::InFlight(since) = state.pending {
            tracing::warn!(
                connector = %self.connector,
                %property,
                %since,
                "Write got stuck, dispatching again"
            );
        }

        let patch = StatePatch::new().pending(Pending::InFlight(now));
        if self.store.update(&state, patch).await?.is_none() {
            return Ok(Outcome::Skipped(Skipped::LostRace));
        }

        tracing::debug!(connector = %self.connector, %property, ?value, "Dispatching write");

        self.queue.enqueue(QueueMessage::WriteProperty(WriteProperty {
            connector: self.connector.clone(),
            property: property.clone(),
            device: meta.owner.device().cloned(),
            address: meta.address.clone(),
            value,
            dispatched_at: now,
        }));

        Ok(Outcome::Dispatched)
    }

    /// Reconcile each property, logging failures. Returns how many writes
    /// were dispatched.
    pub async fn reconcile_all(&self, properties: impl IntoIterator<Item = EntityId>) -> usize {
        let mut dispatched = 0;

        for property in properties {
            match self.reconcile(&property).await {
                Ok(Outcome::Dispatched) => dispatched += 1,
                Ok(Outcome::Skipped(reason)) => {
                    tracing::trace!(connector = %self.connector, %property, ?reason, "Skipped");
                }
                Err(e) => {
                    tracing::error!(
                        connector = %self.connector,
                        %property,
                        "Reconciling failed: {e}"
                    );
                }
            }
        }

        dispatched
    }

    /// Reconcile every property of the connector
    pub async fn reconcile_connector(&self) -> usize {
        let properties = self.cache.properties_of(&self.connector);
        self.reconcile_all(properties.iter().cloned()).await
    }
}

#[cfg(test)]
mod tests {
    use kitsune_common::{DataType, Owner, PropertyMeta, PropertyValue, ValueSpec};

    use super::*;
    use crate::{
        bus::Bus,
        configuration::InMemoryConfiguration,
        storage::{MemoryBackend, StorageBackend as _},
    };

    struct Fixture {
        config: Arc<InMemoryConfiguration>,
        cache: Arc<ConfigurationCache>,
        store: Arc<StateStore>,
        queue: QueueHandle,
        reconciler: Reconciler,
    }

    fn fixture(stuck_timeout: Duration) -> Fixture {
        let config = Arc::new(InMemoryConfiguration::new());
        let owner = |connector: &str| Owner::Device {
            connector: connector.into(),
            device: "plug".into(),
        };
        let switch = || ValueSpec::new(DataType::Bool);

        config.insert(PropertyMeta::new("relay", switch(), owner("zigbee")).with_address("0x0006"));
        config.insert(
            PropertyMeta::new("power", ValueSpec::new(DataType::Float), owner("zigbee"))
                .read_only(),
        );
        config.insert(PropertyMeta::new("led", switch(), owner("zigbee")).disabled());
        config.insert(PropertyMeta::new("other", switch(), owner("modbus")));

        let cache = Arc::new(ConfigurationCache::new(config.clone()));
        let storage = MemoryBackend::new().select("states");
        let store = Arc::new(StateStore::new(storage, cache.clone(), Bus::new("test")));
        let queue = QueueHandle::default();
        let reconciler = Reconciler::new(
            "zigbee".into(),
            store.clone(),
            cache.clone(),
            queue.clone(),
            stuck_timeout,
        );

        Fixture { config, cache, store, queue, reconciler }
    }

    async fn reconcile(f: &Fixture, property: &str) -> Outcome {
        f.reconciler.reconcile(&property.into()).await.unwrap()
    }

    async fn request(f: &Fixture, property: &str) {
        let patch = StatePatch::new().expected(PropertyValue::Bool(true));
        f.store.create_or_update(&property.into(), patch).await.unwrap();
    }

    #[tokio::test]
    async fn dispatches_requested_writes_once() {
        let f = fixture(Duration::from_secs(5));
        request(&f, "relay").await;

        assert_eq!(f.reconciler.reconcile(&"relay".into()).await.unwrap(), Outcome::Dispatched);
        assert_eq!(
            f.reconciler.reconcile(&"relay".into()).await.unwrap(),
            Outcome::Skipped(Skipped::NotEligible)
        );

        let state = f.store.find(&"relay".into()).await.unwrap().unwrap();
        assert!(matches!(state.pending, Pending::InFlight(_)));

        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn skips() {
        let f = fixture(Duration::from_secs(5));

        let skipped = |reason| Outcome::Skipped(reason);

        assert_eq!(reconcile(&f, "nope").await, skipped(Skipped::Unresolved));
        assert_eq!(reconcile(&f, "other").await, skipped(Skipped::Foreign));
        assert_eq!(reconcile(&f, "led").await, skipped(Skipped::Disabled));
        assert_eq!(reconcile(&f, "power").await, skipped(Skipped::ReadOnly));
        assert_eq!(reconcile(&f, "relay").await, skipped(Skipped::NoState));

        f.store
            .create_or_update(&"relay".into(), StatePatch::new().actual(PropertyValue::Bool(false)))
            .await
            .unwrap();
        assert_eq!(reconcile(&f, "relay").await, skipped(Skipped::NotEligible));

        assert!(f.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_writes_are_retried_after_timeout() {
        let f = fixture(Duration::from_secs(5));
        request(&f, "relay").await;

        assert_eq!(reconcile(&f, "relay").await, Outcome::Dispatched);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(reconcile(&f, "relay").await, Outcome::Skipped(Skipped::NotEligible));
        assert_eq!(f.queue.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reconcile(&f, "relay").await, Outcome::Dispatched);
        assert_eq!(reconcile(&f, "relay").await, Outcome::Skipped(Skipped::NotEligible));

        assert_eq!(f.queue.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_connector() {
        let f = fixture(Duration::from_secs(5));
        request(&f, "relay").await;
        request(&f, "other").await;

        assert_eq!(f.reconciler.reconcile_connector().await, 1);

        f.config.remove(&"relay".into());
        f.cache.apply(&crate::ConfigurationChange::PropertyDeleted("relay".into()));

        assert_eq!(f.reconciler.reconcile_connector().await, 0);
    }
}
