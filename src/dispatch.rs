//! Message Dispatcher
//!
//! Routes decoded inbound messages to a registered handler by command name.
//! Dispatch is synchronous and happens in wire-arrival order on the engine
//! task. Unknown commands are ignored for forward compatibility.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::command_of;

/// A handler for one inbound command.
pub type Handler<E> = fn(&mut E, Value);

/// Command-name keyed handler table.
pub struct Dispatcher<E> {
    handlers: HashMap<&'static str, Handler<E>>,
}

impl<E> Dispatcher<E> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `command`. One handler per command; a second
    /// registration replaces the first.
    pub fn register(&mut self, command: &'static str, handler: Handler<E>) {
        if self.handlers.insert(command, handler).is_some() {
            warn!("handler for {command} replaced");
        }
    }

    /// Route `message` to its handler. Messages without a recognized
    /// `command` are dropped.
    pub fn dispatch(&self, engine: &mut E, message: Value) {
        let Some(command) = command_of(&message).map(str::to_owned) else {
            warn!("dropping message without command field: {message}");
            return;
        };
        match self.handlers.get(command.as_str()) {
            Some(handler) => handler(engine, message),
            None => debug!("ignoring unknown command {command}"),
        }
    }
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}
