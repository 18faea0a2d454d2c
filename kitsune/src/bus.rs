//! In-process event bus for property state events, optionally bridged to
//! other processes through an [`Exchange`].

use core::sync::atomic::{AtomicU32, Ordering};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use kitsune_common::{
    Action, Category, EntityId, KitsuneString, Owner, PropertyState, RoutingKey, StatePayload,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{Error, Result, exchange::Exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Published in this process
    Local,
    /// Received from another process through the exchange
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub routing_key: RoutingKey,
    pub origin: Origin,
    /// Id of the process that produced the event
    pub source: KitsuneString,
    pub property: EntityId,
    pub owner: Owner,
    pub payload: serde_json::Value,
}

impl BusEvent {
    pub fn state(
        source: KitsuneString,
        action: Action,
        state: &PropertyState,
        owner: &Owner,
    ) -> Self {
        Self {
            routing_key: RoutingKey::new(owner.category(), action),
            origin: Origin::Local,
            source,
            property: state.id.clone(),
            owner: owner.clone(),
            payload: StatePayload::new(state, owner).to_json(),
        }
    }

    pub fn action(&self) -> Action {
        self.routing_key.action
    }

    pub fn category(&self) -> Category {
        self.routing_key.category
    }
}

/// Selects the events a subscription receives. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    category: Option<Category>,
    actions: Vec<Action>,
    origin: Option<Origin>,
    property: Option<EntityId>,
    connector: Option<EntityId>,
}

impl Filter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions = actions.into_iter().collect();
        self
    }

    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn property(mut self, property: impl Into<EntityId>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn connector(mut self, connector: impl Into<EntityId>) -> Self {
        self.connector = Some(connector.into());
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        self.category.is_none_or(|c| c == event.category())
            && (self.actions.is_empty() || self.actions.contains(&event.action()))
            && self.origin.is_none_or(|o| o == event.origin)
            && self.property.as_ref().is_none_or(|p| *p == event.property)
            && self.connector.as_ref().is_none_or(|c| c == event.owner.connector())
    }
}

/// Return `false` to drop the subscription
pub type SubscriptionHandler = Box<dyn FnMut(&BusEvent) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u32);

pub struct Bus {
    source: KitsuneString,
    next_subscription_id: AtomicU32,
    handlers: Mutex<BTreeMap<u32, (Filter, SubscriptionHandler)>>,
    exchange: OnceLock<Arc<Exchange>>,
}

impl Bus {
    /// `source` identifies this process on the exchange
    pub fn new(source: impl Into<KitsuneString>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            next_subscription_id: AtomicU32::new(1),
            handlers: Mutex::new(BTreeMap::new()),
            exchange: OnceLock::new(),
        })
    }

    pub fn source(&self) -> &KitsuneString {
        &self.source
    }

    /// Handlers run synchronously during dispatch and must not subscribe or
    /// publish on this bus themselves.
    pub fn subscribe(&self, filter: Filter, handler: SubscriptionHandler) -> SubscriptionId {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);

        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (filter, handler));

        SubscriptionId(id)
    }

    /// Subscribe through a channel. The subscription ends with the receiver.
    pub fn subscribe_channel(&self, filter: Filter) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.subscribe(filter, Box::new(move |event| tx.send(event.clone()).is_ok()));

        rx
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0)
            .is_some()
    }

    /// Deliver to local subscribers, then forward local events to the
    /// exchange if one is attached
    pub async fn publish(&self, event: BusEvent) {
        self.dispatch(&event);

        if event.origin != Origin::Local {
            return;
        }

        if let Some(exchange) = self.exchange.get()
            && let Err(e) = exchange.publish(&self.source, &event).await
        {
            tracing::error!(
                routing_key = %event.routing_key,
                property = %event.property,
                "Failed to forward event to exchange: {e}"
            );
        }
    }

    /// Deliver to local subscribers only
    pub fn dispatch(&self, event: &BusEvent) {
        tracing::trace!(
            routing_key = %event.routing_key,
            property = %event.property,
            origin = ?event.origin,
            "dispatching"
        );

        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);

        handlers.retain(|id, (filter, handler)| {
            if !filter.matches(event) {
                return true;
            }

            let retain = handler(event);

            if !retain {
                tracing::debug!("Removing subscription handler for ID {id}");
            }

            retain
        });
    }

    /// Forward local events to `exchange` and dispatch the events of other
    /// processes locally as [`Origin::Remote`].
    ///
    /// The returned task runs until the connection is lost or the bus is
    /// dropped.
    pub async fn attach_exchange(
        self: &Arc<Self>,
        exchange: Arc<Exchange>,
    ) -> Result<JoinHandle<()>> {
        exchange.subscribe_all().await?;

        if self.exchange.set(exchange.clone()).is_err() {
            return Err(Error::InvalidState("an exchange is already attached".into()));
        }

        let bus = Arc::downgrade(self);

        Ok(tokio::spawn(async move {
            loop {
                let event = match exchange.recv().await {
                    Ok(event) => event,
                    Err(e @ (Error::MqttConnection(_) | Error::MqttTransport(_))) => {
                        tracing::error!("Exchange connection lost: {e}");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Dropping exchange message: {e}");
                        continue;
                    }
                };

                let Some(bus) = bus.upgrade() else {
                    break;
                };

                bus.receive(event);
            }
        }))
    }

    /// Dispatch an event that came in through the exchange as
    /// [`Origin::Remote`]. Echoes of this process's own events are dropped.
    ///
    /// Returns whether the event was dispatched.
    pub fn receive(&self, mut event: BusEvent) -> bool {
        if event.source == self.source {
            return false;
        }

        event.origin = Origin::Remote;
        self.dispatch(&event);

        true
    }
}
