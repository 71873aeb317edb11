use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dotenvy::dotenv;
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use exec_listener::brokers::{ChannelBrokerFactory, Event, DEFAULT_CAPACITY};
use exec_listener::{
    ExecListenerFactory, Handler, HandlerError, HandlerResults, HandlerSettings, InitContext,
    Listener, ListenerConfig, Output,
};

/// Logs every event it receives.
struct LogHandler {
    settings: HandlerSettings,
}

#[async_trait]
impl Handler for LogHandler {
    fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    async fn handle(&self, output: Output) -> Result<HandlerResults, HandlerError> {
        tracing::info!("Event {}", serde_json::to_string(&output)?);
        Ok(HandlerResults::new())
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    // enable logging to console
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exec_listener=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // handler settings either come as raw json or from a bare server id
    let handler_settings = match env::var("HANDLER_SETTINGS") {
        Ok(raw) => serde_json::from_str(&raw).expect("Invalid HANDLER_SETTINGS"),
        Err(_) => HandlerSettings::for_server(
            env::var("EXEC_CONNECTION").expect("EXEC_CONNECTION or HANDLER_SETTINGS must be set"),
        ),
    };

    // optionally bound handler calls and shutdown
    let mut settings = Map::new();
    for (var, key) in [
        ("INVOCATION_TIMEOUT", "invocationTimeout"),
        ("SHUTDOWN_TIMEOUT", "shutdownTimeout"),
    ] {
        if let Ok(value) = env::var(var) {
            settings.insert(key.to_string(), Value::String(value));
        }
    }

    let capacity = env::var("CHANNEL_CAPACITY")
        .map(|raw| raw.parse().expect("Invalid CHANNEL_CAPACITY"))
        .unwrap_or(DEFAULT_CAPACITY);
    let brokers = Arc::new(ChannelBrokerFactory::new().with_capacity(capacity));

    let config = ListenerConfig {
        id: "exec-listener".into(),
        settings,
    };
    let mut listener = ExecListenerFactory::new()
        .with_brokers(brokers.clone())
        .new_listener(&config)
        .expect("Invalid listener settings");

    let handler = Arc::new(LogHandler {
        settings: handler_settings,
    });
    let span = tracing::info_span!("listener", id = %config.id);
    listener
        .initialize(InitContext::new(vec![handler]).with_span(span))
        .expect("Could not initialize listener");

    if let Err(err) = listener.start().await {
        tracing::error!("Could not start listener: {}", err);
        std::process::exit(1);
    }

    let Some(publisher) = listener.server_id().and_then(|id| brokers.publisher(id)) else {
        tracing::warn!("No broker bound, nothing to publish to");
        let _ = listener.stop().await;
        return;
    };

    // set the killswitch
    let (stop_tx, mut stop_rx) = watch::channel(());
    listen_killswitch(stop_tx);

    // publish json events read line by line from stdin
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Event>(&line) {
                    Ok(event) => {
                        if let Err(err) = publisher.publish(event).await {
                            tracing::error!("{}", err);
                            break;
                        }
                    }
                    Err(err) => tracing::warn!("Skipping invalid event: {}", err),
                },
                Ok(None) => {
                    tracing::info!("End of input");
                    while !publisher.is_drained() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    break;
                }
                Err(err) => {
                    tracing::error!("Could not read input: {}", err);
                    break;
                }
            },
            _ = stop_rx.changed() => {
                tracing::warn!("Killswitch triggered, shutting down");
                break;
            }
        }
    }

    if let Err(err) = listener.stop().await {
        tracing::error!("Could not stop listener: {}", err);
    }
}

fn listen_killswitch(tx: watch::Sender<()>) {
    tokio::spawn(async move {
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            tracing::warn!("Could not install signal handlers");
            return;
        };
        loop {
            select! {
                _ = sigterm.recv() => tracing::warn!("Received SIGTERM"),
                _ = sigint.recv() => tracing::warn!("Received SIGINT"),
            };
            if tx.send(()).is_err() {
                break;
            }
        }
    });
}
