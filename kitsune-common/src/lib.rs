use core::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

pub mod payload;

mod event;
mod meta;
mod state;
mod string;
mod value;
pub use event::*;
pub use meta::*;
pub use state::*;
pub use string::*;
pub use value::*;

/// Kind of entity owning a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Connector,
    Device,
    Channel,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Connector => "connector",
            Category::Device => "device",
            Category::Channel => "channel",
        }
    }
}

impl FromStr for Category {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connector" => Ok(Category::Connector),
            "device" => Ok(Category::Device),
            "channel" => Ok(Category::Channel),
            _ => Err("unknown category"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Updated,
    Deleted,
    /// A device confirmed a value
    Reported,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::Reported => "reported",
        }
    }
}

impl FromStr for Action {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Action::Created),
            "updated" => Ok(Action::Updated),
            "deleted" => Ok(Action::Deleted),
            "reported" => Ok(Action::Reported),
            _ => Err("unknown action"),
        }
    }
}

/// `{category}.property.state.{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub category: Category,
    pub action: Action,
}

impl RoutingKey {
    pub const EXCHANGE_PREFIX: &str = "kitsune/exchange";
    pub const EXCHANGE_WILDCARD: &str = "kitsune/exchange/#";

    pub fn new(category: Category, action: Action) -> Self {
        Self { category, action }
    }

    /// MQTT topic carrying this routing key between processes
    pub fn to_topic(&self) -> String {
        format!(
            "{}/{}/property/state/{}",
            Self::EXCHANGE_PREFIX,
            self.category.as_str(),
            self.action.as_str()
        )
    }

    pub fn from_topic(topic: &str) -> Result<Self, &'static str> {
        let rest = topic
            .strip_prefix(Self::EXCHANGE_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or("does not start with kitsune/exchange/")?;

        parse_parts(rest.split('/'))
    }
}

fn parse_parts<'a>(mut parts: impl Iterator<Item = &'a str>) -> Result<RoutingKey, &'static str> {
    let category: Category = parts.next().ok_or("{category}")?.parse()?;

    match (parts.next(), parts.next()) {
        (Some("property"), Some("state")) => {}
        _ => return Err("{category}.property.state"),
    }

    let action: Action = parts.next().ok_or("{category}.property.state.{action}")?.parse()?;

    if parts.next().is_some() {
        return Err("{category}.property.state.{action}...");
    }

    Ok(RoutingKey { category, action })
}

impl Display for RoutingKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.property.state.{}", self.category.as_str(), self.action.as_str())
    }
}

impl FromStr for RoutingKey {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_parts(s.split('.'))
    }
}
