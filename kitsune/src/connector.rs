use std::sync::Arc;

use kitsune_common::{EntityId, payload::ConnectionState};

use crate::{
    Result,
    bridge::PropertyBridge,
    bus::Bus,
    config::{Config, WriterKind},
    configuration::{ConfigurationCache, ConfigurationChange},
    consumers::{ConnectionStateConsumer, DeviceClient, DeviceIoConsumer, ReportConsumer},
    queue::{ConnectionStateReport, ConnectorQueue, QueueMessage},
    store::StateStore,
    writer::{EventWriter, ExchangeWriter, PeriodicWriter, Reconciler, Writer},
};

/// A running connector: its queue, consumers and write strategy
pub struct Connector {
    id: EntityId,
    store: Arc<StateStore>,
    cache: Arc<ConfigurationCache>,
    bus: Arc<Bus>,
    queue: Arc<ConnectorQueue>,
    writer: Box<dyn Writer>,
}

impl Connector {
    pub fn new(
        config: &Config,
        store: Arc<StateStore>,
        cache: Arc<ConfigurationCache>,
        bus: Arc<Bus>,
        client: Arc<dyn DeviceClient>,
    ) -> Self {
        let id = EntityId::from(&config.connector.id);
        let queue = ConnectorQueue::new(id.clone(), config.queue.tick());

        queue.register("report", Arc::new(ReportConsumer::new(store.clone())));
        queue.register("connection_state", Arc::new(ConnectionStateConsumer::new(store.clone())));
        queue.register(
            "device_io",
            Arc::new(DeviceIoConsumer::new(client, queue.handle(), config.connector.io_timeout())),
        );

        let reconciler = Arc::new(Reconciler::new(
            id.clone(),
            store.clone(),
            cache.clone(),
            queue.handle(),
            config.writer.stuck_timeout(),
        ));

        let writer: Box<dyn Writer> = match config.writer.kind {
            WriterKind::Periodic => Box::new(PeriodicWriter::new(reconciler, config.writer.tick())),
            WriterKind::Event => Box::new(EventWriter::new(reconciler, bus.clone())),
            WriterKind::Exchange => Box::new(ExchangeWriter::new(reconciler, bus.clone())),
        };

        Self { id, store, cache, bus, queue, writer }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn queue(&self) -> &Arc<ConnectorQueue> {
        &self.queue
    }

    pub fn start(&self) {
        tracing::info!(connector = %self.id, writer = self.writer.name(), "Starting connector");

        self.queue.start();
        self.writer.connect();
    }

    /// Stop dispatching, finish the queued work, then stop consuming
    pub async fn stop(&self) {
        tracing::info!(connector = %self.id, "Stopping connector");

        self.writer.disconnect();
        self.queue.stop().await;

        tracing::info!(connector = %self.id, "Connector stopped");
    }

    pub fn bridge(&self, property: impl Into<EntityId>) -> PropertyBridge {
        PropertyBridge::new(property, self.store.clone(), self.bus.clone())
    }

    pub fn report_connection_state(
        &self,
        device: EntityId,
        property: EntityId,
        state: ConnectionState,
    ) {
        let report = ConnectionStateReport { device, property, state };
        self.queue.enqueue(QueueMessage::StoreConnectionState(report));
    }

    /// Invalidate cached configuration; deleted properties lose their state
    pub async fn apply_configuration_change(&self, change: &ConfigurationChange) -> Result<()> {
        tracing::debug!(connector = %self.id, ?change, "Configuration changed");

        self.cache.apply(change);

        if let ConfigurationChange::PropertyDeleted(property) = change {
            self.store.delete(property).await?;
        }

        Ok(())
    }
}
