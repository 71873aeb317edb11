use std::time::Duration;

use thiserror::Error;

use crate::listeners::ListenerState;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("exec connection `{0}` is not configured")]
    ConfigMissing(&'static str),

    #[error("exec connection could not be parsed: {0}")]
    ConfigInvalid(String),

    #[error("exec connection name must be a string, found {found}")]
    ConnectionValueType { found: &'static str },

    #[error("failed to create event broker: {0}")]
    BrokerCreate(#[from] BrokerError),

    #[error("handler failed: {0}")]
    HandlerInvocation(#[source] HandlerError),

    #[error("handler did not finish within {0:?}")]
    HandlerTimeout(Duration),

    #[error("no handlers registered")]
    NoHandlers,

    #[error("listener has not been initialized")]
    NotInitialized,

    #[error("cannot {op} while listener is {state:?}")]
    InvalidState {
        op: &'static str,
        state: ListenerState,
    },

    #[error("invalid listener settings: {0}")]
    Settings(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker `{server_id}` could not be created: {reason}")]
    Create { server_id: String, reason: String },

    #[error("broker `{0}` is closed")]
    Closed(String),

    #[error("broker `{0}` is already running")]
    AlreadyRunning(String),
}

pub type Result<T> = std::result::Result<T, ListenerError>;
