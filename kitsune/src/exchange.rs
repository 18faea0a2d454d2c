//! MQTT v5 link carrying bus events between Kitsune processes.

use core::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use kitsune_common::{EntityId, KitsuneString, Owner, RoutingKey};
use mqtt_endpoint_tokio::mqtt_ep::{
    self, Endpoint,
    packet::v5_0,
    role,
    transport::{TcpTransport, connect_helper},
};
use mqtt_protocol_core::mqtt::packet::{
    Qos, SubEntry, SubOpts,
    v5_0::{Connack, Publish},
};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    bus::{BusEvent, Origin},
};

/// What travels on an exchange topic
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    source: KitsuneString,
    data: serde_json::Value,
}

pub struct Exchange {
    endpoint: Endpoint<role::Client>,
    next_packet_id: AtomicU16,
}

impl Exchange {
    pub async fn connect(client_id: &str, addr: &str) -> Result<Arc<Self>> {
        let endpoint = mqtt_ep::endpoint::Endpoint::<role::Client>::new(mqtt_ep::Version::V5_0);

        let tcp_stream = connect_helper::connect_tcp(addr, None).await?;
        let transport = TcpTransport::from_stream(tcp_stream);
        endpoint
            .attach(transport, mqtt_ep::endpoint::Mode::Client)
            .await?;

        let connect = v5_0::Connect::builder().client_id(client_id)?.build()?;

        endpoint.send(connect).await?;

        let packet = endpoint.recv().await?;
        let connack: Connack = packet.try_into().map_err(Error::MqttPacketField)?;
        tracing::debug!("Received CONNACK: {connack:?}");

        tracing::info!(addr, client_id, "Connected to exchange");

        Ok(Exchange {
            endpoint,
            next_packet_id: AtomicU16::new(1),
        }
        .into())
    }

    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);

            if id != 0 {
                break id;
            }
        }
    }

    /// Subscribe to the state events of every process
    pub async fn subscribe_all(&self) -> Result<()> {
        let subscribe = v5_0::Subscribe::builder()
            .packet_id(self.next_packet_id())
            .entries(vec![SubEntry::new(
                RoutingKey::EXCHANGE_WILDCARD.to_string(),
                SubOpts::new().set_qos(Qos::AtLeastOnce),
            )?])
            .build()?;

        tracing::info!("Subscribing to topic '{}'", RoutingKey::EXCHANGE_WILDCARD);

        self.endpoint
            .register_packet_id(subscribe.packet_id())
            .await?;

        self.endpoint.send(subscribe).await?;

        Ok(())
    }

    pub async fn publish(&self, source: &KitsuneString, event: &BusEvent) -> Result<()> {
        let topic = event.routing_key.to_topic();
        let payload = serde_json::to_string(&Envelope {
            source: source.clone(),
            data: event.payload.clone(),
        })?;

        tracing::debug!("Publishing to topic {topic}: {payload}");

        let publish = v5_0::Publish::builder()
            .topic_name(topic)?
            .payload(payload)
            .qos(Qos::AtLeastOnce)
            .retain(false)
            .packet_id(self.next_packet_id())
            .build()?;

        if let Some(packet_id) = publish.packet_id() {
            self.endpoint.register_packet_id(packet_id).await?;
        }

        self.endpoint.send(publish).await?;

        Ok(())
    }

    /// Next state event published by any process, this one included
    pub async fn recv(&self) -> Result<BusEvent> {
        loop {
            let packet = self.endpoint.recv().await?;

            let publish: Result<Publish, _> = packet.try_into();
            if let Ok(publish) = publish {
                let routing_key =
                    RoutingKey::from_topic(publish.topic_name()).map_err(Error::BadRoutingKey)?;

                let envelope: Envelope = serde_json::from_slice(publish.payload().as_slice())?;

                break decode(routing_key, envelope);
            }
        }
    }
}

fn decode(routing_key: RoutingKey, envelope: Envelope) -> Result<BusEvent> {
    let property: EntityId = serde_json::from_value(envelope.data["id"].clone())?;
    let owner = Owner::deserialize(&envelope.data)?;

    if owner.category() != routing_key.category {
        return Err(Error::BadRoutingKey("category does not match the payload"));
    }

    Ok(BusEvent {
        routing_key,
        origin: Origin::Remote,
        source: envelope.source,
        property,
        owner,
        payload: envelope.data,
    })
}
