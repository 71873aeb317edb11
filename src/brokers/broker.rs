use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{BrokerError, ListenerError};

/// Raw event as emitted by a broker.
pub type Event = Map<String, Value>;

/// Callback a broker hands its events to.
#[async_trait]
pub trait DispatchTarget: Send + Sync {
    async fn deliver(&self, event: Event) -> Result<(), ListenerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn server_id(&self) -> &str;

    /// Runs until [`Broker::stop`] is called.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Signals the run loop to exit and returns without waiting for it.
    async fn stop(&self);
}

/// Looks up or creates the broker for a server id.
pub trait BrokerFactory: Send + Sync {
    fn create(
        &self,
        server_id: &str,
        target: Arc<dyn DispatchTarget>,
    ) -> Result<Arc<dyn Broker>, BrokerError>;
}
