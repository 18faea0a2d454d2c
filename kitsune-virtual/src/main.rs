use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use kitsune::{
    ConfigurationCache, Connector, QueueMessage, StateStore,
    bus::Bus,
    common::payload::ConnectionState,
    configuration::InMemoryConfiguration,
    exchange::Exchange,
    queue::ReadProperty,
    storage::{MemoryBackend, StorageBackend as _},
};
use kitsune_socket::SocketBridge;

use self::{config::VirtualConfig, device::VirtualDevices};

mod config;
mod device;

#[derive(Parser)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "kitsune.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kitsune::log::init();

    let args = Args::parse();

    let config: VirtualConfig = kitsune::config::load(Some(args.config.as_path()))
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let connector_id = config.connector();

    let properties = Arc::new(InMemoryConfiguration::new());
    for meta in config.property_metas() {
        properties.insert(meta);
    }

    let cache = Arc::new(ConfigurationCache::new(properties));
    let bus = Bus::new(format!("kitsune-virtual-{connector_id}"));
    let storage = MemoryBackend::new().select(&config.engine.storage.namespace);
    let store = Arc::new(StateStore::new(storage, cache.clone(), bus.clone()));

    let exchange = match &config.engine.exchange {
        Some(exchange) => {
            let conn = Exchange::connect(&exchange.client_id, &exchange.addr)
                .await
                .context("failed to connect to the exchange broker")?;

            Some(bus.attach_exchange(conn).await?)
        }
        None => None,
    };

    let devices = Arc::new(VirtualDevices::new(&config.devices)?);
    let connector =
        Connector::new(&config.engine, store.clone(), cache.clone(), bus.clone(), devices);

    connector.start();

    for device in &config.devices {
        connector.report_connection_state(
            device.id.clone(),
            device.state_property(),
            ConnectionState::Connected,
        );

        // pick up the initial register contents
        for (property, _) in device.initial_values()? {
            connector.queue().enqueue(QueueMessage::ReadProperty(ReadProperty {
                connector: connector_id.clone(),
                address: Some(property.to_string()),
                property,
                device: Some(device.id.clone()),
            }));
        }
    }

    let socket = config.socket.clone().map(|socket| {
        let bridge = SocketBridge::new(store.clone(), cache.clone(), bus.clone());

        tokio::spawn(async move {
            if let Err(e) = bridge.bind(&socket).await {
                tracing::error!("Socket bridge stopped: {e}");
            }
        })
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    for device in &config.devices {
        connector.report_connection_state(
            device.id.clone(),
            device.state_property(),
            ConnectionState::Disconnected,
        );
    }

    connector.stop().await;

    if let Some(socket) = socket {
        socket.abort();
    }
    if let Some(exchange) = exchange {
        exchange.abort();
    }

    Ok(())
}
