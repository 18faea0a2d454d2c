use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use kitsune::{ConfigurationCache, PropertyBridge, StateStore, bus::Bus};
use kitsune_common::StatePayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::messages::{ClientMessage, Packet, PacketId, ServerMessage, StateEvent};

mod messages;

type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// `host:port` to accept WebSocket clients on
    pub listen: String,
}

/// Serves property states to WebSocket clients
pub struct SocketBridge {
    store: Arc<StateStore>,
    cache: Arc<ConfigurationCache>,
    bus: Arc<Bus>,
}

impl SocketBridge {
    pub fn new(store: Arc<StateStore>, cache: Arc<ConfigurationCache>, bus: Arc<Bus>) -> Arc<Self> {
        Arc::new(Self { store, cache, bus })
    }

    pub async fn bind(self: Arc<Self>, config: &SocketConfig) -> Result<()> {
        let listener = TcpListener::bind(&config.listen).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Accepting socket clients on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let bridge = self.clone();

            tokio::spawn(async move {
                tracing::debug!(%peer, "Socket client connected");

                if let Err(e) = bridge.session(stream).await {
                    tracing::warn!(%peer, "Socket session failed: {e}");
                }

                tracing::debug!(%peer, "Socket client disconnected");
            });
        }
    }

    async fn session(&self, stream: TcpStream) -> Result<()> {
        let conn = tokio_tungstenite::accept_async(stream).await?;
        let (mut conn_tx, mut conn_rx) = conn.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Packet<ServerMessage>>();

        let sender = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let text = match serde_json::to_string(&packet) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode socket message: {e}");
                        continue;
                    }
                };

                if let Err(e) = conn_tx.send(Message::text(text)).await {
                    tracing::debug!("Socket send failed: {e}");
                    break;
                }
            }
        });

        let mut subscriptions = Vec::new();

        let result = loop {
            let text = match conn_rx.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(msg)) => {
                    tracing::warn!("expected text message, got: {:?}", msg);
                    continue;
                }
                Some(Err(e)) => break Err(Error::from(e)),
            };

            let packet = match serde_json::from_str::<Packet<ClientMessage>>(&text) {
                Ok(packet) => packet,
                Err(e) => {
                    let payload = ServerMessage::error("bad_request", e.to_string());
                    let _ = tx.send(Packet { id: PacketId(0), payload });
                    continue;
                }
            };

            tracing::debug!("Received socket message: {packet:?}");

            let reply = self.handle(packet.id, packet.payload, &tx, &mut subscriptions).await;

            if tx.send(Packet { id: packet.id, payload: reply }).is_err() {
                break Ok(());
            }
        };

        for subscription in subscriptions {
            subscription.abort();
        }
        sender.abort();

        result
    }

    async fn handle(
        &self,
        id: PacketId,
        message: ClientMessage,
        tx: &UnboundedSender<Packet<ServerMessage>>,
        subscriptions: &mut Vec<JoinHandle<()>>,
    ) -> ServerMessage {
        match message {
            ClientMessage::Get { property } => {
                let bridge = PropertyBridge::new(property, self.store.clone(), self.bus.clone());

                match bridge.get_value().await {
                    Ok(value) => {
                        ServerMessage::ok(value.map(|v| v.to_flat()).unwrap_or(Value::Null))
                    }
                    Err(e) => internal(e),
                }
            }
            ClientMessage::Set { property, value } => {
                let Some(meta) = self.cache.get(&property) else {
                    return ServerMessage::error("not_found", format!("{property} not found"));
                };

                if !meta.settable {
                    return ServerMessage::error("read_only", format!("{property} is read only"));
                }

                let value = match meta.spec.parse_flat(&value) {
                    Ok(value) => value,
                    Err(e) => return ServerMessage::error("invalid_value", e.to_string()),
                };

                let bridge = PropertyBridge::new(property, self.store.clone(), self.bus.clone());

                match bridge.set_expected_value(value).await {
                    Ok(state) => {
                        ServerMessage::ok(StatePayload::new(&state, &meta.owner).to_json())
                    }
                    Err(e) => internal(e),
                }
            }
            ClientMessage::Subscribe { property } => {
                if self.cache.get(&property).is_none() {
                    return ServerMessage::error("not_found", format!("{property} not found"));
                }

                let bridge = PropertyBridge::new(property, self.store.clone(), self.bus.clone());
                let mut events = bridge.watch();
                let tx = tx.clone();

                subscriptions.push(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let event = StateEvent::from(&event);
                        let packet = Packet { id, payload: ServerMessage::Event { event } };

                        if tx.send(packet).is_err() {
                            break;
                        }
                    }
                }));

                ServerMessage::ok(Value::Null)
            }
        }
    }
}

fn internal(e: kitsune::Error) -> ServerMessage {
    tracing::error!("Socket request failed: {e}");

    match e {
        kitsune::Error::NotFound(id) => {
            ServerMessage::error("not_found", format!("{id} not found"))
        }
        kitsune::Error::InvalidArgument(message) => ServerMessage::error("invalid_value", message),
        e => ServerMessage::error("internal", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use kitsune::{
        common::{DataType, Owner, PropertyMeta, ValueFormat, ValueSpec},
        configuration::InMemoryConfiguration,
        storage::{MemoryBackend, StorageBackend as _},
    };
    use serde_json::json;

    use super::*;

    async fn start() -> String {
        let config = Arc::new(InMemoryConfiguration::new());
        config.insert(PropertyMeta::new(
            "brightness",
            ValueSpec::new(DataType::UChar).with_format(ValueFormat::range(0.0, 100.0)),
            Owner::Device { connector: "zigbee".into(), device: "lamp".into() },
        ));

        let cache = Arc::new(ConfigurationCache::new(config));
        let bus = Bus::new("socket-test");
        let storage = MemoryBackend::new().select("states");
        let store = Arc::new(StateStore::new(storage, cache.clone(), bus.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(SocketBridge::new(store, cache, bus).serve(listener));

        format!("ws://{addr}")
    }

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn send(conn: &mut Client, body: Value) {
        conn.send(Message::text(body.to_string())).await.unwrap();
    }

    async fn recv(conn: &mut Client) -> Value {
        loop {
            if let Message::Text(text) = conn.next().await.unwrap().unwrap() {
                break serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn set_get_and_subscribe() {
        let url = start().await;
        let (mut conn, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        send(&mut conn, json!({ "id": 1, "type": "subscribe", "property": "brightness" })).await;
        assert_eq!(recv(&mut conn).await, json!({ "id": 1, "type": "result", "success": true }));

        let set = json!({ "id": 2, "type": "set", "property": "brightness", "value": 80 });
        send(&mut conn, set).await;
        let reply = recv(&mut conn).await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"]["expected_value"], 80);
        assert_eq!(reply["result"]["pending"], true);

        let event = recv(&mut conn).await;
        assert_eq!(event["id"], 1);
        assert_eq!(event["type"], "event");
        assert_eq!(event["event"]["action"], "created");
        assert_eq!(event["event"]["value"], 80);

        send(&mut conn, json!({ "id": 3, "type": "get", "property": "brightness" })).await;
        assert_eq!(
            recv(&mut conn).await,
            json!({ "id": 3, "type": "result", "success": true, "result": 80 })
        );

        let set = json!({ "id": 4, "type": "set", "property": "brightness", "value": "bright" });
        send(&mut conn, set).await;
        assert_eq!(recv(&mut conn).await["error"]["code"], "invalid_value");

        let set = json!({ "id": 5, "type": "set", "property": "humidity", "value": 40 });
        send(&mut conn, set).await;
        assert_eq!(recv(&mut conn).await["error"]["code"], "not_found");

        send(&mut conn, json!({ "id": 6, "type": "get", "property": "humidity" })).await;
        assert_eq!(recv(&mut conn).await, json!({ "id": 6, "type": "result", "success": true }));
    }
}
