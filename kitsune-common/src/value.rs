//! Typed property values and the declared type/format they are checked against.
//!
//! Values are stored tagged (`{"type":"int","value":20}`) and flattened to plain
//! JSON scalars only when rendered for external consumers. Parsing a flattened
//! value back always goes through a [`ValueSpec`], since a bare JSON string can
//! not tell a date, an enum payload and a text apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::{ButtonPayload, CoverPayload, SwitchPayload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Enum(String),
}

impl PropertyValue {
    /// Render as a plain JSON scalar, the form used on the bus and by bridges
    pub fn to_flat(&self) -> serde_json::Value {
        match self {
            PropertyValue::Bool(v) => serde_json::Value::Bool(*v),
            PropertyValue::Int(v) => serde_json::Value::from(*v),
            PropertyValue::Float(v) => serde_json::Value::from(*v),
            PropertyValue::String(v) | PropertyValue::Enum(v) => {
                serde_json::Value::String(v.clone())
            }
            PropertyValue::DateTime(v) => serde_json::Value::String(v.to_rfc3339()),
        }
    }

    /// False for NaN and infinite floats, which JSON cannot carry
    pub fn is_finite(&self) -> bool {
        match *self {
            PropertyValue::Float(v) => v.is_finite(),
            _ => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            PropertyValue::Int(v) => Some(v as f64),
            PropertyValue::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_owned())
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(value)
    }
}

/// Declared data type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    /// Signed 8 bit
    Char,
    /// Unsigned 8 bit
    UChar,
    /// Signed 16 bit
    Short,
    /// Unsigned 16 bit
    UShort,
    /// Signed 32 bit
    Int,
    /// Unsigned 32 bit
    UInt,
    Float,
    String,
    DateTime,
    Enum,
    Switch,
    Button,
    Cover,
}

impl DataType {
    fn integer_range(self) -> Option<(i64, i64)> {
        match self {
            DataType::Char => Some((i8::MIN.into(), i8::MAX.into())),
            DataType::UChar => Some((u8::MIN.into(), u8::MAX.into())),
            DataType::Short => Some((i16::MIN.into(), i16::MAX.into())),
            DataType::UShort => Some((u16::MIN.into(), u16::MAX.into())),
            DataType::Int => Some((i32::MIN.into(), i32::MAX.into())),
            DataType::UInt => Some((u32::MIN.into(), u32::MAX.into())),
            _ => None,
        }
    }

    fn payloads(self) -> Option<&'static [&'static str]> {
        match self {
            DataType::Switch => Some(SwitchPayload::ALL),
            DataType::Button => Some(ButtonPayload::ALL),
            DataType::Cover => Some(CoverPayload::ALL),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFormat {
    /// Inclusive numeric bounds, either side optional
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Allowed enum payloads
    Enum(Vec<String>),
}

impl ValueFormat {
    pub fn range(min: impl Into<Option<f64>>, max: impl Into<Option<f64>>) -> Self {
        ValueFormat::Range { min: min.into(), max: max.into() }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("{value:?} is not a {data_type:?} value")]
    WrongType { data_type: DataType, value: PropertyValue },
    #[error("{value} is outside of {min:?}..={max:?}")]
    OutOfRange { value: f64, min: Option<f64>, max: Option<f64> },
    #[error("{0:?} is not an allowed payload")]
    UnknownPayload(String),
    #[error("cannot parse {0} as a property value")]
    Unparsable(serde_json::Value),
    #[error("{0} is not a finite number")]
    NotFinite(f64),
    #[error("pending write without an expected value")]
    PendingWithoutExpected,
}

/// The declared type and optional format of one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ValueFormat>,
}

impl ValueSpec {
    pub fn new(data_type: DataType) -> Self {
        Self { data_type, format: None }
    }

    pub fn with_format(mut self, format: ValueFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Check the value arm against the data type only
    pub fn check_type(&self, value: &PropertyValue) -> Result<(), ValidationFailure> {
        let ok = match (self.data_type, value) {
            (DataType::Bool, PropertyValue::Bool(_)) => true,
            (DataType::Float, PropertyValue::Float(_)) => true,
            (DataType::String, PropertyValue::String(_)) => true,
            (DataType::DateTime, PropertyValue::DateTime(_)) => true,
            (
                DataType::Enum | DataType::Switch | DataType::Button | DataType::Cover,
                PropertyValue::Enum(_),
            ) => true,
            (ty, PropertyValue::Int(_)) => ty.integer_range().is_some(),
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(ValidationFailure::WrongType { data_type: self.data_type, value: value.clone() })
        }
    }

    /// Check the value against both the data type and the declared format
    pub fn check(&self, value: &PropertyValue) -> Result<(), ValidationFailure> {
        self.check_type(value)?;

        if let PropertyValue::Float(v) = value
            && !v.is_finite()
        {
            return Err(ValidationFailure::NotFinite(*v));
        }

        if let (Some((lo, hi)), PropertyValue::Int(v)) = (self.data_type.integer_range(), value)
            && !(lo..=hi).contains(v)
        {
            return Err(ValidationFailure::OutOfRange {
                value: *v as f64,
                min: Some(lo as f64),
                max: Some(hi as f64),
            });
        }

        if let (Some(allowed), PropertyValue::Enum(payload)) = (self.data_type.payloads(), value)
            && !allowed.contains(&payload.as_str())
        {
            return Err(ValidationFailure::UnknownPayload(payload.clone()));
        }

        match (&self.format, value) {
            (Some(ValueFormat::Range { min, max }), value) => {
                let Some(v) = value.as_f64() else {
                    return Ok(());
                };
                let below = min.is_some_and(|min| v < min);
                let above = max.is_some_and(|max| v > max);
                if below || above {
                    return Err(ValidationFailure::OutOfRange { value: v, min: *min, max: *max });
                }
                Ok(())
            }
            (Some(ValueFormat::Enum(allowed)), PropertyValue::Enum(payload)) => {
                if allowed.iter().any(|a| a == payload) {
                    Ok(())
                } else {
                    Err(ValidationFailure::UnknownPayload(payload.clone()))
                }
            }
            _ => Ok(()),
        }
    }

    /// Parse a flattened JSON value into a typed value, then check it.
    ///
    /// `null` parses to `None`.
    pub fn parse_flat(
        &self,
        json: &serde_json::Value,
    ) -> Result<Option<PropertyValue>, ValidationFailure> {
        let value = self.decode_flat(json)?;

        if let Some(value) = &value {
            self.check(value)?;
        }

        Ok(value)
    }

    /// Parse a flattened JSON value by data type only. Values outside of the
    /// declared format are returned as they are.
    pub fn decode_flat(
        &self,
        json: &serde_json::Value,
    ) -> Result<Option<PropertyValue>, ValidationFailure> {
        use serde_json::Value;

        let unparsable = || ValidationFailure::Unparsable(json.clone());

        let value = match (self.data_type, json) {
            (_, Value::Null) => return Ok(None),
            (DataType::Bool, Value::Bool(v)) => PropertyValue::Bool(*v),
            (DataType::Float, Value::Number(n)) => {
                PropertyValue::Float(n.as_f64().ok_or_else(unparsable)?)
            }
            (DataType::String, Value::String(s)) => PropertyValue::String(s.clone()),
            (DataType::DateTime, Value::String(s)) => PropertyValue::DateTime(
                DateTime::parse_from_rfc3339(s).map_err(|_| unparsable())?.with_timezone(&Utc),
            ),
            (
                DataType::Enum | DataType::Switch | DataType::Button | DataType::Cover,
                Value::String(s),
            ) => PropertyValue::Enum(s.clone()),
            (ty, Value::Number(n)) if ty.integer_range().is_some() => {
                PropertyValue::Int(n.as_i64().ok_or_else(unparsable)?)
            }
            _ => return Err(unparsable()),
        };

        Ok(Some(value))
    }
}
