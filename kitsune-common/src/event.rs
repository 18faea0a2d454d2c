use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityId, Owner, Pending, PropertyState, PropertyValue, ValidationFailure, ValueSpec};

/// Bus payload of a property state event: the state with its values
/// flattened, plus the owning entity chain
#[derive(Debug, Serialize)]
pub struct StatePayload<'a> {
    pub id: &'a EntityId,
    #[serde(serialize_with = "flat")]
    pub actual_value: &'a Option<PropertyValue>,
    #[serde(serialize_with = "flat")]
    pub expected_value: &'a Option<PropertyValue>,
    pub pending: Pending,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub owner: &'a Owner,
}

impl<'a> StatePayload<'a> {
    pub fn new(state: &'a PropertyState, owner: &'a Owner) -> Self {
        Self {
            id: &state.id,
            actual_value: &state.actual_value,
            expected_value: &state.expected_value,
            pending: state.pending,
            valid: state.valid,
            created_at: state.created_at,
            updated_at: state.updated_at,
            owner,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild the state a payload was made from. Values are read back by
    /// the data type of `spec`; format violations are kept as published.
    pub fn parse(
        json: &serde_json::Value,
        spec: &ValueSpec,
    ) -> Result<PropertyState, ValidationFailure> {
        #[derive(Deserialize)]
        struct Wire {
            id: EntityId,
            #[serde(default)]
            actual_value: serde_json::Value,
            #[serde(default)]
            expected_value: serde_json::Value,
            #[serde(default)]
            pending: Pending,
            valid: bool,
            created_at: DateTime<Utc>,
            updated_at: DateTime<Utc>,
        }

        let wire =
            Wire::deserialize(json).map_err(|_| ValidationFailure::Unparsable(json.clone()))?;

        let state = PropertyState {
            id: wire.id,
            actual_value: spec.decode_flat(&wire.actual_value)?,
            expected_value: spec.decode_flat(&wire.expected_value)?,
            pending: wire.pending,
            valid: wire.valid,
            created_at: wire.created_at,
            updated_at: wire.updated_at,
        };

        if !state.is_consistent() {
            return Err(ValidationFailure::PendingWithoutExpected);
        }

        Ok(state)
    }
}

fn flat<S: serde::Serializer>(
    value: &&Option<PropertyValue>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => value.to_flat().serialize(serializer),
        None => serializer.serialize_none(),
    }
}
