use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::{self, CodecError, Fields, Value};

/// A typed application-level message.
///
/// The type string links the event to a handler on the receiving side; the
/// sender does not need to have a handler registered for it. Positional and
/// keyword arguments are passed through to the handler verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "handler_args", default)]
    pub args: Vec<Value>,
    #[serde(rename = "handler_kwargs", default)]
    pub kwargs: Fields,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Event {
            event_type: event_type.into(),
            args: Vec::new(),
            kwargs: Fields::new(),
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Attach a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        value::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        value::decode(bytes)
    }
}

/// Handler shape used by servers and clients for received events.
pub type EventHandler = Box<dyn FnMut(&Event) + Send>;

/// Maps event type strings to handlers of an arbitrary callable shape.
///
/// The registry itself is shape-agnostic so that connections (handlers that
/// just consume an event) and the simulation loop (handlers that return a
/// state update) can share it.
pub struct EventHandlerRegistry<H> {
    handlers: HashMap<String, H>,
}

impl<H> EventHandlerRegistry<H> {
    pub fn new() -> Self {
        EventHandlerRegistry {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `event_type`, replacing any previous one.
    pub fn register(&mut self, event_type: impl Into<String>, handler: H) {
        self.handlers.insert(event_type.into(), handler);
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn get_mut(&mut self, event_type: &str) -> Option<&mut H> {
        self.handlers.get_mut(event_type)
    }
}

impl<H> Default for EventHandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
