use core::time::Duration;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use kitsune_common::EntityId;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use super::{Reconciler, Writer};
use crate::queue::{QueueMessage, ReadProperty};

/// Reconciles every property of the connector on a fixed tick, and schedules
/// polling reads.
pub struct PeriodicWriter {
    reconciler: Arc<Reconciler>,
    tick: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicWriter {
    pub fn new(reconciler: Arc<Reconciler>, tick: Duration) -> Self {
        Self { reconciler, tick, task: Mutex::new(None) }
    }
}

impl Writer for PeriodicWriter {
    fn name(&self) -> &'static str {
        "periodic"
    }

    fn connect(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);

        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let reconciler = self.reconciler.clone();
        let tick = self.tick;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut last_reads = HashMap::new();

            loop {
                ticker.tick().await;

                let properties = reconciler.cache().properties_of(reconciler.connector());

                reconciler.reconcile_all(properties.iter().cloned()).await;
                schedule_reads(&reconciler, &properties, &mut last_reads, Instant::now());
            }
        }));
    }

    fn disconnect(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// Queue a read for every enabled property whose polling interval elapsed
fn schedule_reads(
    reconciler: &Reconciler,
    properties: &[EntityId],
    last_reads: &mut HashMap<EntityId, Instant>,
    now: Instant,
) {
    last_reads.retain(|id, _| properties.contains(id));

    for id in properties {
        let Some(meta) = reconciler.cache().get(id) else {
            continue;
        };
        let Some(interval) = meta.polling_interval.filter(|_| meta.enabled) else {
            continue;
        };

        if last_reads.get(id).is_some_and(|at| now.duration_since(*at) < interval) {
            continue;
        }

        last_reads.insert(id.clone(), now);

        reconciler.queue().enqueue(QueueMessage::ReadProperty(ReadProperty {
            connector: reconciler.connector().clone(),
            property: id.clone(),
            device: meta.owner.device().cloned(),
            address: meta.address.clone(),
        }));
    }
}
