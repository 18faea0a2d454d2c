//! The consumers a connector registers on its queue.

use core::time::Duration;
use std::sync::Arc;

use chrono::Utc;
use futures::{FutureExt as _, future::BoxFuture};
use kitsune_common::{PropertyValue, StatePatch};

use crate::{
    Error, Result,
    queue::{
        Consumer, MessageKind, QueueHandle, QueueMessage, ReadProperty, ReportedProperty,
        WriteProperty,
    },
    store::StateStore,
};

/// Wire I/O of a connector with its devices
pub trait DeviceClient: Send + Sync {
    /// Send a value to the device. Returns the value the device confirmed,
    /// if it answers with one.
    fn write<'a>(
        &'a self,
        request: &'a WriteProperty,
    ) -> BoxFuture<'a, Result<Option<PropertyValue>>>;

    fn read<'a>(
        &'a self,
        request: &'a ReadProperty,
    ) -> BoxFuture<'a, Result<Option<PropertyValue>>>;
}

/// Performs device reads and writes, feeding results back as reports
pub struct DeviceIoConsumer {
    client: Arc<dyn DeviceClient>,
    queue: QueueHandle,
    io_timeout: Duration,
}

impl DeviceIoConsumer {
    pub fn new(client: Arc<dyn DeviceClient>, queue: QueueHandle, io_timeout: Duration) -> Self {
        Self { client, queue, io_timeout }
    }

    async fn bounded(
        &self,
        io: BoxFuture<'_, Result<Option<PropertyValue>>>,
    ) -> Result<Option<PropertyValue>> {
        tokio::time::timeout(self.io_timeout, io)
            .await
            .map_err(|_| Error::Timeout(self.io_timeout))?
    }

    fn report(&self, message: ReportedProperty) {
        self.queue.enqueue(QueueMessage::StoreReportedProperty(message));
    }

    async fn handle(&self, message: QueueMessage) -> Result<()> {
        match message {
            QueueMessage::WriteProperty(request) => {
                tracing::debug!(
                    connector = %request.connector,
                    property = %request.property,
                    device = ?request.device,
                    value = ?request.value,
                    "Writing to device"
                );

                // an unconfirmed write stays in flight until a read reports
                // the value or the writer retries it
                if let Some(value) = self.bounded(self.client.write(&request)).await? {
                    self.report(ReportedProperty {
                        property: request.property,
                        value: Some(value),
                        reported_at: Utc::now(),
                    });
                }
            }
            QueueMessage::ReadProperty(request) => {
                if let Some(value) = self.bounded(self.client.read(&request)).await? {
                    self.report(ReportedProperty {
                        property: request.property,
                        value: Some(value),
                        reported_at: Utc::now(),
                    });
                }
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unexpected {:?} message",
                    other.kind()
                )));
            }
        }

        Ok(())
    }
}

impl Consumer for DeviceIoConsumer {
    fn accepts(&self, kind: MessageKind) -> bool {
        matches!(kind, MessageKind::WriteProperty | MessageKind::ReadProperty)
    }

    fn consume(&self, message: QueueMessage) -> BoxFuture<'_, Result<()>> {
        self.handle(message).boxed()
    }
}

/// Stores device reports as actual values and announces them
pub struct ReportConsumer {
    store: Arc<StateStore>,
}

impl ReportConsumer {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    async fn handle(&self, message: QueueMessage) -> Result<()> {
        let QueueMessage::StoreReportedProperty(report) = message else {
            return Err(Error::InvalidArgument("expected a reported property".into()));
        };

        let value = report.value.clone();
        let state = self.store.report(&report.property, report.value).await?;

        if !state.valid {
            tracing::warn!(property = %state.id, ?value, "Device reported an invalid value");
        }

        Ok(())
    }
}

impl Consumer for ReportConsumer {
    fn accepts(&self, kind: MessageKind) -> bool {
        kind == MessageKind::StoreReportedProperty
    }

    fn consume(&self, message: QueueMessage) -> BoxFuture<'_, Result<()>> {
        self.handle(message).boxed()
    }
}

/// Records device connection states in their state property
pub struct ConnectionStateConsumer {
    store: Arc<StateStore>,
}

impl ConnectionStateConsumer {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    async fn handle(&self, message: QueueMessage) -> Result<()> {
        let QueueMessage::StoreConnectionState(report) = message else {
            return Err(Error::InvalidArgument("expected a connection state".into()));
        };

        tracing::info!(
            device = %report.device,
            state = %report.state,
            "Device connection state changed"
        );

        let patch = StatePatch::new().actual(PropertyValue::from(report.state));
        self.store.create_or_update(&report.property, patch).await?;

        Ok(())
    }
}

impl Consumer for ConnectionStateConsumer {
    fn accepts(&self, kind: MessageKind) -> bool {
        kind == MessageKind::StoreConnectionState
    }

    fn consume(&self, message: QueueMessage) -> BoxFuture<'_, Result<()>> {
        self.handle(message).boxed()
    }
}
