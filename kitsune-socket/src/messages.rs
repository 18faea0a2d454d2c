use kitsune::BusEvent;
use kitsune_common::{Action, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Packet<T> {
    pub(crate) id: PacketId,
    #[serde(flatten)]
    pub(crate) payload: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct PacketId(pub u32);

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Current effective value
    Get { property: EntityId },
    /// Request a value, `null` withdraws the request
    Set { property: EntityId, value: Value },
    /// Stream changes of a property, answered with events under this packet id
    Subscribe { property: EntityId },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Result {
        success: bool,
        #[serde(skip_serializing_if = "Value::is_null")]
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ServerError>,
    },
    Event {
        event: StateEvent,
    },
}

impl ServerMessage {
    pub fn ok(result: Value) -> Self {
        ServerMessage::Result { success: true, result, error: None }
    }

    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        ServerMessage::Result {
            success: false,
            result: Value::Null,
            error: Some(ServerError { code, message: message.into() }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StateEvent {
    pub property: EntityId,
    pub action: Action,
    /// What clients should display
    pub value: Value,
    pub state: Value,
}

impl From<&BusEvent> for StateEvent {
    fn from(event: &BusEvent) -> Self {
        let state = &event.payload;
        let value = match &state["expected_value"] {
            Value::Null => state["actual_value"].clone(),
            expected => expected.clone(),
        };

        StateEvent {
            property: event.property.clone(),
            action: event.action(),
            value,
            state: state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_messages() {
        assert_eq!(
            serde_json::from_value::<Packet<ClientMessage>>(
                json!({ "id": 4, "type": "set", "property": "brightness", "value": 80 })
            )
            .unwrap()
            .payload,
            ClientMessage::Set { property: "brightness".into(), value: json!(80) }
        );

        let unknown = json!({ "id": 5, "type": "delete" });
        assert!(serde_json::from_value::<Packet<ClientMessage>>(unknown).is_err());
    }

    #[test]
    fn server_messages() {
        let ok = Packet { id: PacketId(1), payload: ServerMessage::ok(json!(21.5)) };
        assert_eq!(
            serde_json::to_value(ok).unwrap(),
            json!({ "id": 1, "type": "result", "success": true, "result": 21.5 })
        );

        assert_eq!(
            serde_json::to_value(Packet {
                id: PacketId(2),
                payload: ServerMessage::error("not_found", "humidity not found"),
            })
            .unwrap(),
            json!({
                "id": 2,
                "type": "result",
                "success": false,
                "error": { "code": "not_found", "message": "humidity not found" },
            })
        );
    }
}
