use core::time::Duration;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use futures::{FutureExt as _, future::BoxFuture};
use kitsune::{
    Error, Result,
    consumers::DeviceClient,
    queue::{ReadProperty, WriteProperty},
};
use kitsune_common::{EntityId, PropertyValue};

use crate::config::DeviceConfig;

struct Register {
    value: Option<PropertyValue>,
    latency: Duration,
}

/// Devices living in memory: every property is a register that confirms
/// whatever is written to it
pub struct VirtualDevices {
    registers: Mutex<HashMap<EntityId, Register>>,
}

impl VirtualDevices {
    pub fn new(devices: &[DeviceConfig]) -> anyhow::Result<Self> {
        let mut registers = HashMap::new();

        for device in devices {
            let initial = device.initial_values()?.into_iter().collect::<HashMap<_, _>>();

            for property in &device.properties {
                let register = Register {
                    value: initial.get(&property.id).cloned(),
                    latency: device.latency(),
                };
                registers.insert(property.id.clone(), register);
            }
        }

        Ok(Self { registers: Mutex::new(registers) })
    }

    fn latency(&self, property: &EntityId) -> Result<Duration> {
        self.registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(property)
            .map(|register| register.latency)
            .ok_or_else(|| Error::Device(format!("no register for {property}")))
    }

    async fn write_register(&self, request: &WriteProperty) -> Result<Option<PropertyValue>> {
        tokio::time::sleep(self.latency(&request.property)?).await;

        let mut registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);
        let register = registers
            .get_mut(&request.property)
            .ok_or_else(|| Error::Device(format!("no register for {}", request.property)))?;

        tracing::info!(property = %request.property, value = ?request.value, "Register written");

        register.value = Some(request.value.clone());

        Ok(register.value.clone())
    }

    async fn read_register(&self, request: &ReadProperty) -> Result<Option<PropertyValue>> {
        tokio::time::sleep(self.latency(&request.property)?).await;

        let registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(registers.get(&request.property).and_then(|register| register.value.clone()))
    }
}

impl DeviceClient for VirtualDevices {
    fn write<'a>(
        &'a self,
        request: &'a WriteProperty,
    ) -> BoxFuture<'a, Result<Option<PropertyValue>>> {
        self.write_register(request).boxed()
    }

    fn read<'a>(
        &'a self,
        request: &'a ReadProperty,
    ) -> BoxFuture<'a, Result<Option<PropertyValue>>> {
        self.read_register(request).boxed()
    }
}
