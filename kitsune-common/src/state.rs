use core::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{EntityId, PropertyValue, ValidationFailure, ValueSpec};

/// Write marker of a property state.
///
/// On the wire this is `false`, `true`, or the ISO-8601 time of dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pending {
    #[default]
    Idle,
    /// Requested, not yet dispatched to the device
    Requested,
    /// Dispatched to the device at the given time
    InFlight(DateTime<Utc>),
}

impl Pending {
    pub fn is_idle(&self) -> bool {
        matches!(self, Pending::Idle)
    }
}

impl Serialize for Pending {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Pending::Idle => serializer.serialize_bool(false),
            Pending::Requested => serializer.serialize_bool(true),
            Pending::InFlight(at) => at.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Pending {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Flag(bool),
            At(DateTime<Utc>),
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Flag(false) => Pending::Idle,
            Wire::Flag(true) => Pending::Requested,
            Wire::At(at) => Pending::InFlight(at),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyState {
    pub id: EntityId,
    /// Last value confirmed by the device
    pub actual_value: Option<PropertyValue>,
    /// Requested but unconfirmed value; `None` means reconciled
    pub expected_value: Option<PropertyValue>,
    #[serde(default)]
    pub pending: Pending,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a [`PropertyState`]. Unset fields are retained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub actual_value: Option<Option<PropertyValue>>,
    pub expected_value: Option<Option<PropertyValue>>,
    pub pending: Option<Pending>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actual(mut self, value: impl Into<Option<PropertyValue>>) -> Self {
        self.actual_value = Some(value.into());
        self
    }

    pub fn expected(mut self, value: impl Into<Option<PropertyValue>>) -> Self {
        self.expected_value = Some(value.into());
        self
    }

    pub fn pending(mut self, pending: Pending) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.actual_value.is_none() && self.expected_value.is_none() && self.pending.is_none()
    }

    fn values(&self) -> impl Iterator<Item = &PropertyValue> {
        [&self.actual_value, &self.expected_value]
            .into_iter()
            .filter_map(|v| v.as_ref().and_then(Option::as_ref))
    }
}

impl PropertyState {
    /// Build a fresh state from its first write or read.
    ///
    /// Values of the wrong type are rejected outright; format violations are
    /// recorded the same way [`PropertyState::apply`] records them.
    pub fn create(
        id: EntityId,
        patch: &StatePatch,
        spec: &ValueSpec,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationFailure> {
        for value in patch.values() {
            spec.check_type(value)?;
        }

        if matches!(patch.expected_value, None | Some(None))
            && patch.pending.is_some_and(|p| !p.is_idle())
        {
            return Err(ValidationFailure::PendingWithoutExpected);
        }

        let empty = PropertyState {
            id,
            actual_value: None,
            expected_value: None,
            pending: Pending::Idle,
            valid: true,
            created_at: now,
            updated_at: now,
        };

        let mut state = empty.apply(patch, spec, now);
        state.updated_at = now;

        Ok(state)
    }

    /// Merge a patch into a copy of this state
    pub fn apply(&self, patch: &StatePatch, spec: &ValueSpec, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();

        let mut rejected = false;

        // non-finite floats have no JSON form, the previous actual value stays
        match &patch.actual_value {
            Some(Some(actual)) if !actual.is_finite() => rejected = true,
            Some(actual) => next.actual_value = actual.clone(),
            None => {}
        }

        match &patch.expected_value {
            Some(None) => {
                next.expected_value = None;
                next.pending = Pending::Idle;
            }
            Some(Some(expected)) if spec.check(expected).is_err() => {
                next.expected_value = None;
                next.pending = Pending::Idle;
                rejected = true;
            }
            Some(Some(expected)) => {
                next.expected_value = Some(expected.clone());
                next.pending = patch.pending.unwrap_or(Pending::Requested);
            }
            None => {
                if let Some(pending) = patch.pending
                    && next.expected_value.is_some()
                {
                    next.pending = pending;
                }
            }
        }

        if next.expected_value.is_some() && next.expected_value == next.actual_value {
            next.expected_value = None;
            next.pending = Pending::Idle;
        }

        let actual_ok = next.actual_value.as_ref().is_none_or(|v| spec.check(v).is_ok());
        next.valid = actual_ok && !rejected;

        // strictly increasing, the store relies on it to detect lost races
        next.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + TimeDelta::microseconds(1)
        };

        next
    }

    /// Value external protocols should show: the expected value if a write is
    /// outstanding, the actual value otherwise
    pub fn effective_value(&self) -> Option<&PropertyValue> {
        self.expected_value.as_ref().or(self.actual_value.as_ref())
    }

    pub fn is_reconciled(&self) -> bool {
        self.expected_value.is_none()
    }

    /// Holds the `expected == null => pending == Idle` invariant
    pub fn is_consistent(&self) -> bool {
        self.expected_value.is_some() || self.pending.is_idle()
    }

    /// Whether a writer should dispatch the expected value now.
    ///
    /// In-flight writes become eligible again once `stuck_timeout` elapsed.
    pub fn is_write_eligible(&self, now: DateTime<Utc>, stuck_timeout: Duration) -> bool {
        match (&self.expected_value, self.pending) {
            (None, _) | (Some(_), Pending::Idle) => false,
            (Some(_), Pending::Requested) => true,
            (Some(_), Pending::InFlight(at)) => {
                let timeout = TimeDelta::from_std(stuck_timeout).unwrap_or(TimeDelta::MAX);
                now - at > timeout
            }
        }
    }
}
