//! Event listener that binds a single handler to an exec event broker.
//!
//! The broker is selected by a server id resolved from the handler's
//! `execConnection` setting. Events are handed to the handler one at a time.

pub mod brokers;
pub mod config;
pub mod error;
pub mod listeners;

pub use brokers::{Broker, BrokerFactory, ChannelBrokerFactory, DispatchTarget, Event};
pub use config::{resolve_server_id, HandlerSettings, ListenerConfig, Settings};
pub use error::{BrokerError, HandlerError, ListenerError, Result};
pub use listeners::{
    ExecListener, ExecListenerFactory, Handler, HandlerResults, InitContext, Listener,
    ListenerState, Output,
};
