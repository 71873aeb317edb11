mod broker;
mod channel;

pub use broker::{Broker, BrokerFactory, DispatchTarget, Event};
pub use channel::{ChannelBroker, ChannelBrokerFactory, Publisher, DEFAULT_CAPACITY};
