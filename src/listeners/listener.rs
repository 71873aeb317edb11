use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Span;

use crate::brokers::{BrokerFactory, Event};
use crate::config::HandlerSettings;
use crate::error::{HandlerError, Result};

#[derive(Default, Clone)]
pub struct NoBrokers;
#[derive(Clone)]
pub struct SomeBrokers(pub Arc<dyn BrokerFactory>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Initialized,
    Started,
    Stopped,
}

/// Envelope handed to the handler for every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub event: Event,
}

impl Output {
    pub fn new(event: Event) -> Self {
        Output { event }
    }
}

/// Reply data a handler may return. The listener only logs it.
pub type HandlerResults = Map<String, Value>;

#[async_trait]
pub trait Handler: Send + Sync {
    fn settings(&self) -> &HandlerSettings;

    async fn handle(&self, output: Output) -> std::result::Result<HandlerResults, HandlerError>;
}

/// What the host passes to [`Listener::initialize`].
pub struct InitContext {
    pub handlers: Vec<Arc<dyn Handler>>,
    /// Span every log line of the listener is recorded in.
    pub span: Span,
}

impl InitContext {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        InitContext {
            handlers,
            span: Span::current(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// Lifecycle driven by the host.
#[async_trait]
pub trait Listener: Send {
    fn initialize(&mut self, ctx: InitContext) -> Result<()>;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    fn state(&self) -> ListenerState;
}
