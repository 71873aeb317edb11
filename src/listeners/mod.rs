mod exec;
mod listener;

pub use exec::{Dispatcher, ExecListener, ExecListenerFactory};
pub use listener::{
    Handler, HandlerResults, InitContext, Listener, ListenerState, NoBrokers, Output, SomeBrokers,
};
