use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::brokers::{Broker, BrokerFactory, DispatchTarget, Event};
use crate::config::{resolve_server_id, ListenerConfig, Settings};
use crate::error::{ListenerError, Result};
use crate::listeners::listener::{
    Handler, InitContext, Listener, ListenerState, NoBrokers, Output, SomeBrokers,
};

/// Builds [`ExecListener`]s from host configuration.
pub struct ExecListenerFactory<B> {
    brokers: B,
}

impl ExecListenerFactory<NoBrokers> {
    pub fn new() -> Self {
        ExecListenerFactory { brokers: NoBrokers }
    }
}

impl Default for ExecListenerFactory<NoBrokers> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> ExecListenerFactory<B> {
    pub fn with_brokers<F: BrokerFactory + 'static>(
        self,
        brokers: Arc<F>,
    ) -> ExecListenerFactory<SomeBrokers> {
        ExecListenerFactory {
            brokers: SomeBrokers(brokers),
        }
    }
}

impl ExecListenerFactory<SomeBrokers> {
    pub fn new_listener(&self, config: &ListenerConfig) -> Result<ExecListener> {
        let settings = Settings::from_map(config.settings.clone())?;
        tracing::debug!("Creating listener {} with {:?}", config.id, settings);
        Ok(ExecListener::new(settings, self.brokers.0.clone()))
    }
}

/// Serializes deliveries into the single handler.
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    guard: Mutex<()>,
    invocation_timeout: Option<Duration>,
    span: Span,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Dispatcher {
            handler,
            guard: Mutex::new(()),
            invocation_timeout: None,
            span: Span::none(),
        }
    }

    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub async fn deliver(&self, event: Event) -> Result<()> {
        // held across the handler call, concurrent deliveries queue here
        let _guard = self.guard.lock().await;

        async {
            tracing::debug!("Got exec event: {:?}", event);
            let output = Output::new(event);
            tracing::debug!("Send exec event out: {:?}", output);

            let invocation = self.handler.handle(output);
            let result = match self.invocation_timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result.map_err(ListenerError::HandlerInvocation),
                    Err(_) => Err(ListenerError::HandlerTimeout(limit)),
                },
                None => invocation.await.map_err(ListenerError::HandlerInvocation),
            };

            match result {
                Ok(results) => {
                    tracing::trace!("Handler replied {:?}", results);
                    Ok(())
                }
                Err(err) => {
                    tracing::info!("Error -> {}", err);
                    Err(err)
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }
}

#[async_trait]
impl DispatchTarget for Dispatcher {
    async fn deliver(&self, event: Event) -> Result<()> {
        Dispatcher::deliver(self, event).await
    }
}

struct Running {
    broker: Arc<dyn Broker>,
    task: JoinHandle<()>,
}

/// Listener bound to a single exec event broker.
pub struct ExecListener {
    settings: Settings,
    brokers: Arc<dyn BrokerFactory>,
    state: ListenerState,
    handlers: Vec<Arc<dyn Handler>>,
    dispatcher: Option<Arc<Dispatcher>>,
    server: Option<Running>,
    span: Span,
}

impl ExecListener {
    pub fn new(settings: Settings, brokers: Arc<dyn BrokerFactory>) -> Self {
        ExecListener {
            settings,
            brokers,
            state: ListenerState::Created,
            handlers: Vec::new(),
            dispatcher: None,
            server: None,
            span: Span::none(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    /// Server id of the running broker, if any.
    pub fn server_id(&self) -> Option<&str> {
        self.server.as_ref().map(|running| running.broker.server_id())
    }

    /// True while the broker run loop is still going.
    pub fn is_running(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub async fn deliver(&self, event: Event) -> Result<()> {
        self.dispatcher
            .as_ref()
            .ok_or(ListenerError::NotInitialized)?
            .deliver(event)
            .await
    }

    async fn launch(&mut self) -> Result<()> {
        tracing::info!("Start");
        let dispatcher = self.dispatcher.clone().ok_or(ListenerError::NotInitialized)?;

        tracing::info!("Processing handlers");
        let Some(server_id) = resolve_server_id(dispatcher.handler().settings())? else {
            tracing::warn!("Exec connection has no settings, started without a broker");
            self.state = ListenerState::Started;
            return Ok(());
        };

        let broker = self.brokers.create(&server_id, dispatcher)?;
        tracing::info!("Server = {}", server_id);

        let runner = broker.clone();
        let task = tokio::spawn(
            async move {
                match runner.start().await {
                    Ok(()) => tracing::debug!("Broker {} run loop ended", runner.server_id()),
                    Err(err) => tracing::warn!("Broker {} run loop failed: {}", runner.server_id(), err),
                }
            }
            .in_current_span(),
        );
        self.server = Some(Running { broker, task });
        self.state = ListenerState::Started;
        Ok(())
    }

    async fn shutdown(&mut self, running: Running) {
        let Running { broker, mut task } = running;
        broker.stop().await;

        let limit = self.settings.shutdown_timeout;
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(())) => tracing::info!("Broker {} stopped", broker.server_id()),
            Ok(Err(err)) => tracing::warn!("Broker task failed: {}", err),
            Err(_) => {
                tracing::warn!(
                    "Broker {} did not stop within {:?}, aborting",
                    broker.server_id(),
                    limit
                );
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Listener for ExecListener {
    fn initialize(&mut self, ctx: InitContext) -> Result<()> {
        if self.state != ListenerState::Created {
            return Err(ListenerError::InvalidState {
                op: "initialize",
                state: self.state,
            });
        }

        let Some(handler) = ctx.handlers.first() else {
            return Err(ListenerError::NoHandlers);
        };
        if ctx.handlers.len() > 1 {
            tracing::warn!(
                parent: &ctx.span,
                "{} handlers registered, only the first receives events",
                ctx.handlers.len()
            );
        }

        let dispatcher = Dispatcher::new(handler.clone())
            .with_invocation_timeout(self.settings.invocation_timeout)
            .with_span(ctx.span.clone());
        self.dispatcher = Some(Arc::new(dispatcher));
        self.handlers = ctx.handlers;
        self.span = ctx.span;
        self.state = ListenerState::Initialized;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        match self.state {
            ListenerState::Initialized | ListenerState::Stopped => {}
            state => return Err(ListenerError::InvalidState { op: "start", state }),
        }

        let span = self.span.clone();
        self.launch().instrument(span).await
    }

    async fn stop(&mut self) -> Result<()> {
        let span = self.span.clone();
        match self.server.take() {
            Some(running) => self.shutdown(running).instrument(span).await,
            None => tracing::debug!(parent: &span, "Stop without a running broker"),
        }

        if self.state == ListenerState::Started {
            self.state = ListenerState::Stopped;
        }
        Ok(())
    }

    fn state(&self) -> ListenerState {
        self.state
    }
}

impl Drop for ExecListener {
    fn drop(&mut self) {
        if let Some(running) = self.server.take() {
            running.task.abort();
        }
    }
}
