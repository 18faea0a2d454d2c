//! Per-connector FIFO of device work, drained one message per tick by the
//! first registered consumer that accepts it.

use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use kitsune_common::{EntityId, PropertyValue, payload::ConnectionState};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct WriteProperty {
    pub connector: EntityId,
    pub property: EntityId,
    pub device: Option<EntityId>,
    pub address: Option<String>,
    pub value: PropertyValue,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadProperty {
    pub connector: EntityId,
    pub property: EntityId,
    pub device: Option<EntityId>,
    pub address: Option<String>,
}

/// A value a device reported, `None` if it reported no value
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedProperty {
    pub property: EntityId,
    pub value: Option<PropertyValue>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateReport {
    pub device: EntityId,
    /// Property holding the device's connection state
    pub property: EntityId,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    WriteProperty(WriteProperty),
    ReadProperty(ReadProperty),
    StoreReportedProperty(ReportedProperty),
    StoreConnectionState(ConnectionStateReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    WriteProperty,
    ReadProperty,
    StoreReportedProperty,
    StoreConnectionState,
}

impl QueueMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            QueueMessage::WriteProperty(_) => MessageKind::WriteProperty,
            QueueMessage::ReadProperty(_) => MessageKind::ReadProperty,
            QueueMessage::StoreReportedProperty(_) => MessageKind::StoreReportedProperty,
            QueueMessage::StoreConnectionState(_) => MessageKind::StoreConnectionState,
        }
    }

    pub fn property(&self) -> &EntityId {
        match self {
            QueueMessage::WriteProperty(m) => &m.property,
            QueueMessage::ReadProperty(m) => &m.property,
            QueueMessage::StoreReportedProperty(m) => &m.property,
            QueueMessage::StoreConnectionState(m) => &m.property,
        }
    }
}

pub trait Consumer: Send + Sync {
    fn accepts(&self, kind: MessageKind) -> bool;

    fn consume(&self, message: QueueMessage) -> BoxFuture<'_, Result<()>>;
}

/// Cheap handle for enqueueing, shared by writers and consumers
#[derive(Clone, Default)]
pub struct QueueHandle {
    messages: Arc<Mutex<VecDeque<QueueMessage>>>,
}

impl QueueHandle {
    pub fn enqueue(&self, message: QueueMessage) {
        tracing::trace!(kind = ?message.kind(), property = %message.property(), "enqueue");

        self.lock().push_back(message);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of queued messages of one kind
    pub fn count(&self, kind: MessageKind) -> usize {
        self.lock().iter().filter(|message| message.kind() == kind).count()
    }

    fn pop(&self) -> Option<QueueMessage> {
        self.lock().pop_front()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueueMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Registration = (&'static str, Arc<dyn Consumer>);

pub struct ConnectorQueue {
    connector: EntityId,
    handle: QueueHandle,
    consumers: Mutex<Vec<Registration>>,
    tick: Duration,
    stopping: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectorQueue {
    pub fn new(connector: EntityId, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            connector,
            handle: QueueHandle::default(),
            consumers: Mutex::new(Vec::new()),
            tick,
            stopping: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn enqueue(&self, message: QueueMessage) {
        self.handle.enqueue(message);
    }

    /// Consumers are tried in registration order
    pub fn register(&self, name: &'static str, consumer: Arc<dyn Consumer>) {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, consumer));
    }

    fn consumer_for(&self, kind: MessageKind) -> Option<Registration> {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, consumer)| consumer.accepts(kind))
            .cloned()
    }

    /// Hand the oldest message to its consumer. Returns whether there was one.
    pub async fn consume_next(&self) -> bool {
        let Some(message) = self.handle.pop() else {
            return false;
        };

        let kind = message.kind();
        let property = message.property().clone();

        let Some((name, consumer)) = self.consumer_for(kind) else {
            tracing::warn!(
                connector = %self.connector,
                %property,
                ?kind,
                "No consumer accepts message, dropping it"
            );
            return true;
        };

        if let Err(e) = consumer.consume(message).await {
            tracing::error!(
                connector = %self.connector,
                %property,
                ?kind,
                consumer = name,
                "Consuming message failed: {e}"
            );
        }

        true
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn has_unfinished_tasks(&self) -> bool {
        self.is_running() && !self.handle.is_empty()
    }

    /// Start draining on a fixed tick. Does nothing if already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.lock_task();

        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        self.stopping.store(false, Ordering::Release);

        let queue = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if queue.consume_next().await {
                    continue;
                }

                if queue.stopping.load(Ordering::Acquire) {
                    break;
                }
            }

            tracing::debug!(connector = %queue.connector, "Queue drained");
        }));
    }

    /// Finish the queued messages, then stop the consumer loop
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);

        let task = self.lock_task().take();

        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(connector = %self.connector, "Queue task failed: {e}");
        }
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
