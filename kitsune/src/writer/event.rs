use core::time::Duration;
use std::sync::{Arc, Mutex, PoisonError};

use kitsune_common::Action;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use super::{Reconciler, Writer};
use crate::bus::{Bus, BusEvent, Filter, Origin};

/// Reconciles a property whenever its state is created or updated in this
/// process
pub struct EventWriter {
    listener: Listener,
}

impl EventWriter {
    pub fn new(reconciler: Arc<Reconciler>, bus: Arc<Bus>) -> Self {
        Self { listener: Listener::new(reconciler, bus, Origin::Local) }
    }
}

impl Writer for EventWriter {
    fn name(&self) -> &'static str {
        "event"
    }

    fn connect(&self) {
        self.listener.connect();
    }

    fn disconnect(&self) {
        self.listener.disconnect();
    }
}

/// Reconciles a property whenever another process changes its state.
///
/// States published by other processes are adopted into the local store
/// first, newest wins.
pub struct ExchangeWriter {
    listener: Listener,
}

impl ExchangeWriter {
    pub fn new(reconciler: Arc<Reconciler>, bus: Arc<Bus>) -> Self {
        Self { listener: Listener::new(reconciler, bus, Origin::Remote) }
    }
}

impl Writer for ExchangeWriter {
    fn name(&self) -> &'static str {
        "exchange"
    }

    fn connect(&self) {
        self.listener.connect();
    }

    fn disconnect(&self) {
        self.listener.disconnect();
    }
}

/// Lower bound of the stuck write sweep
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);

struct Listener {
    reconciler: Arc<Reconciler>,
    bus: Arc<Bus>,
    origin: Origin,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    fn new(reconciler: Arc<Reconciler>, bus: Arc<Bus>, origin: Origin) -> Self {
        Self { reconciler, bus, origin, task: Mutex::new(None) }
    }

    fn connect(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);

        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let events = self.bus.subscribe_channel(
            Filter::any()
                .origin(self.origin)
                .actions([Action::Created, Action::Updated])
                .connector(self.reconciler.connector().clone()),
        );

        *task = Some(tokio::spawn(listen(self.reconciler.clone(), events)));
    }

    fn disconnect(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

async fn listen(reconciler: Arc<Reconciler>, mut events: mpsc::UnboundedReceiver<BusEvent>) {
    // requests made while no writer was listening
    reconciler.reconcile_connector().await;

    // stuck writes produce no event, sweep for them
    let period = reconciler.stuck_timeout().max(MIN_SWEEP_PERIOD);
    let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };

                if event.origin == Origin::Remote
                    && let Err(e) = reconciler.store().mirror(&event).await
                {
                    tracing::warn!(property = %event.property, "Ignoring remote state: {e}");
                }

                reconciler.reconcile_all([event.property]).await;
            }
            _ = sweep.tick() => {
                reconciler.reconcile_connector().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kitsune_common::{
        DataType, Owner, Pending, PropertyMeta, PropertyValue, StatePatch, ValueSpec,
    };

    use super::*;
    use crate::{
        configuration::{ConfigurationCache, InMemoryConfiguration},
        queue::QueueHandle,
        storage::{MemoryBackend, StorageBackend as _},
        store::StateStore,
    };

    struct Fixture {
        bus: Arc<Bus>,
        store: Arc<StateStore>,
        queue: QueueHandle,
        reconciler: Arc<Reconciler>,
    }

    fn fixture(stuck_timeout: Duration) -> Fixture {
        let config = Arc::new(InMemoryConfiguration::new());
        config.insert(PropertyMeta::new(
            "relay",
            ValueSpec::new(DataType::Bool),
            Owner::Device { connector: "zigbee".into(), device: "plug".into() },
        ));

        let cache = Arc::new(ConfigurationCache::new(config));
        let bus = Bus::new("test");
        let storage = MemoryBackend::new().select("states");
        let store = Arc::new(StateStore::new(storage, cache.clone(), bus.clone()));
        let queue = QueueHandle::default();
        let reconciler = Arc::new(Reconciler::new(
            "zigbee".into(),
            store.clone(),
            cache,
            queue.clone(),
            stuck_timeout,
        ));

        Fixture { bus, store, queue, reconciler }
    }

    fn switch_on() -> StatePatch {
        StatePatch::new().expected(PropertyValue::Bool(true))
    }

    async fn pending(store: &StateStore) -> Pending {
        store.find(&"relay".into()).await.unwrap().unwrap().pending
    }

    #[tokio::test(start_paused = true)]
    async fn local_events() {
        let f = fixture(Duration::from_secs(5));
        let writer = EventWriter::new(f.reconciler.clone(), f.bus.clone());

        writer.connect();
        tokio::task::yield_now().await;

        f.store.create_or_update(&"relay".into(), switch_on()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(matches!(pending(&f.store).await, Pending::InFlight(_)));
        assert_eq!(f.queue.len(), 1);

        writer.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn catches_up_on_connect() {
        let f = fixture(Duration::from_secs(5));

        f.store.create_or_update(&"relay".into(), switch_on()).await.unwrap();

        let writer = EventWriter::new(f.reconciler.clone(), f.bus.clone());
        writer.connect();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_events_only() {
        let f = fixture(Duration::from_secs(5));
        let writer = ExchangeWriter::new(f.reconciler.clone(), f.bus.clone());

        writer.connect();
        tokio::task::yield_now().await;

        let state = f.store.create_or_update(&"relay".into(), switch_on()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // local change, ignored
        assert_eq!(pending(&f.store).await, Pending::Requested);

        let owner = Owner::Device { connector: "zigbee".into(), device: "plug".into() };
        let mut remote = BusEvent::state("hub-2".into(), Action::Updated, &state, &owner);
        remote.origin = Origin::Remote;
        f.bus.dispatch(&remote);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(matches!(pending(&f.store).await, Pending::InFlight(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_writes_are_swept() {
        let f = fixture(Duration::from_secs(2));
        let writer = EventWriter::new(f.reconciler.clone(), f.bus.clone());

        f.store.create_or_update(&"relay".into(), switch_on()).await.unwrap();

        writer.connect();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(f.queue.len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.queue.len(), 1);

        // first sweep at 2s finds the write not yet stuck, the second at 4s
        // dispatches it again
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(f.queue.len(), 2);

        writer.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn remote_requests_reach_a_separate_store() {
        let hub = fixture(Duration::from_secs(2));
        let f = fixture(Duration::from_secs(2));
        let writer = ExchangeWriter::new(f.reconciler.clone(), f.bus.clone());

        writer.connect();
        tokio::task::yield_now().await;

        let mut published = hub.bus.subscribe_channel(Filter::any());
        hub.store.create_or_update(&"relay".into(), switch_on()).await.unwrap();

        let mut remote = published.recv().await.unwrap();
        remote.source = "hub-2".into();
        assert!(f.bus.receive(remote));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(matches!(pending(&f.store).await, Pending::InFlight(_)));
        assert_eq!(pending(&hub.store).await, Pending::Requested);
        assert_eq!(f.queue.len(), 1);

        // never confirmed, swept again
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.queue.len(), 2);

        writer.disconnect();
    }
}
