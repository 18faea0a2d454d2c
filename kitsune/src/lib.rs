use core::time::Duration;

use kitsune_common::{EntityId, ValidationFailure};
use mqtt_endpoint_tokio::mqtt_ep;

pub mod bridge;
pub mod bus;
pub mod config;
pub mod configuration;
pub mod connector;
pub mod consumers;
pub mod exchange;
pub mod log;
pub mod queue;
pub mod storage;
pub mod store;
pub mod writer;

pub use kitsune_common as common;

pub use self::{
    bridge::PropertyBridge,
    bus::{Bus, BusEvent, Filter, Origin},
    configuration::{ConfigurationCache, ConfigurationChange, ConfigurationLookup},
    connector::Connector,
    queue::{ConnectorQueue, QueueMessage},
    store::StateStore,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{0} not found")]
    NotFound(EntityId),
    #[error("device error: {0}")]
    Device(String),
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("mqtt transport error: {0}")]
    MqttTransport(#[from] mqtt_ep::TransportError),
    #[error("mqtt connection error: {0}")]
    MqttConnection(#[from] mqtt_ep::ConnectionError),
    #[error("mqtt packet field error: {0}")]
    MqttPacketField(&'static str),
    #[error("mqtt packet error: {0}")]
    MqttPacket(mqtt_ep::result_code::MqttError),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("bad routing key: {0}")]
    BadRoutingKey(&'static str),
    #[error("config error: {0}")]
    Config(Box<figment::Error>),
}

impl From<mqtt_ep::result_code::MqttError> for Error {
    fn from(e: mqtt_ep::result_code::MqttError) -> Self {
        Error::MqttPacket(e)
    }
}

impl From<ValidationFailure> for Error {
    fn from(e: ValidationFailure) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(Box::new(e))
    }
}
