//! Channel connectors and their lifecycle.
//!
//! A [`Connector`] owns one platform's wire protocol and normalizes traffic
//! into protocol [`Message`]s. The [`ConnectionRegistry`] supervises every
//! registered channel: it drives the connect/reconnect state machine, tracks
//! heartbeats, and forwards inbound messages to the gateway. Third-party
//! connectors come in through the [`PluginRegistry`].

mod backoff;
mod connector;
mod loopback;
mod plugin;
pub mod registry;

pub use backoff::Backoff;
pub use connector::{Channel, ChannelId, Connector, ConnectorError, Credentials};
pub use loopback::{LoopbackConnector, LoopbackFactory, LoopbackHandle};
pub use plugin::{ConnectorFactory, PluginError, PluginRegistry};
pub use registry::{
    ConnectionRegistry, ConnectionSnapshot, ConnectionState, RegistryError, SendError,
    StateTransition,
};
