//! # Message Bus Implementation
//!
//! The MessageBus is the in-process messaging hub the collector runs against.
//! It provides a broadcast-based publish-subscribe mechanism so that
//! components can communicate without direct dependencies.
//!
//! ## Features
//!
//! - **Broadcast Channel**: Efficiently delivers messages to multiple subscribers
//! - **Non-blocking Communication**: Asynchronous publishing and handling
//! - **Lag Recovery**: A lagged receiver resubscribes instead of going dead
//!
//! ## Design Decisions
//!
//! The implementation uses Tokio's broadcast channel rather than MPSC channels to:
//!
//! 1. Allow multiple subscribers to receive the same message
//! 2. Handle backpressure through the channel capacity
//! 3. Support non-blocking publish operations
//!
//! The bus holds an internal receiver so that publishing with no external
//! subscribers succeeds; a request that nobody answers must degrade to an
//! empty collection result, not a send error.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// # Message
///
/// Represents one envelope on the bus: a topic identifier, a `data` payload
/// and a free-form `context` that travels with the conversation.
///
/// ## Derived event names
///
/// A request of type `"weather.query"` expects responders to declare intent
/// on `"weather.query.handling"` and to answer on `"weather.query.response"`;
/// see [`Message::handling_type`] and [`Message::response_type`].
///
/// ## Example
///
/// ```rust,no_run
/// # use msgcollect::event_bus::{Message, Value};
/// let request = Message::new("weather.query")
///     .with_data("location", Value::String("Helsinki".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Topic identifier, determines how the message is routed
    pub message_type: String,
    /// Payload data as key-value pairs
    pub data: HashMap<String, Value>,
    /// Conversation context, carried across request and replies
    pub context: HashMap<String, Value>,
}

impl Message {
    pub fn new(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_string(),
            data: HashMap::new(),
            context: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Event name on which responders declare intent to answer this message.
    pub fn handling_type(&self) -> String {
        format!("{}.handling", self.message_type)
    }

    /// Event name on which responders send their final answer to this message.
    pub fn response_type(&self) -> String {
        format!("{}.response", self.message_type)
    }

    /// Builds a reply to this message. The reply inherits the request's
    /// context, so correlation keys carry over.
    fn reply(&self, reply_type: String, responder: &str) -> Self {
        Self {
            message_type: reply_type,
            data: {
                let mut data = HashMap::new();
                data.insert("handler".to_string(), Value::String(responder.to_string()));
                data
            },
            context: self.context.clone(),
        }
    }

    /// Builds a handling declaration for this request: "I intend to answer
    /// within `timeout`".
    pub fn handling_reply(&self, responder: &str, timeout: Duration) -> Self {
        let mut msg = self.reply(self.handling_type(), responder);
        msg.data
            .insert("timeout".to_string(), Value::Duration(timeout));
        msg
    }

    /// Builds a final answer to this request carrying the given payload.
    pub fn response_reply(&self, responder: &str, data: HashMap<String, Value>) -> Self {
        let mut msg = self.reply(self.response_type(), responder);
        msg.data.extend(data);
        msg
    }

    /// Responder id (`handler` field) of a handling declaration or response.
    pub fn handler_id(&self) -> Option<&str> {
        match self.data.get("handler") {
            Some(Value::String(id)) => Some(id),
            _ => None,
        }
    }

    /// Declared timeout of a handling declaration.
    pub fn declared_timeout(&self) -> Option<Duration> {
        self.data.get("timeout").and_then(Value::as_duration)
    }
}

/// Message parameter values.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Duration(Duration),
    Map(HashMap<String, Value>),
    Null,
}

impl Value {
    /// Interprets the value as a duration; numeric values are seconds.
    /// Negative, non-finite or overflowing values are `None`, never a panic;
    /// the bus carries arbitrary payloads from arbitrary peers.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Value::Duration(d) => Some(*d),
            Value::Float(secs) => Duration::try_from_secs_f64(*secs).ok(),
            Value::Integer(secs) if *secs >= 0 => Some(Duration::from_secs(*secs as u64)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

/// # MessageBus
///
/// Central hub for the publish-subscribe message flow. The bus broadcasts
/// every published message to all current subscribers.
///
/// ## Capacity and Backpressure
///
/// The capacity bounds how many unprocessed messages can be buffered per
/// subscriber; a subscriber that falls further behind observes a lag and
/// resubscribes, skipping the missed messages.
pub struct MessageBus {
    /// Broadcast sender for messages
    sender: broadcast::Sender<Message>,
    /// Maximum number of messages that can be buffered
    capacity: usize,
    /// Internal receiver to keep the broadcast channel active
    _internal_receiver: broadcast::Receiver<Message>,
}

impl MessageBus {
    /// Creates a new MessageBus with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            _internal_receiver: receiver,
        }
    }

    /// Subscribes to all messages on the bus.
    pub fn subscribe(&self) -> MessageReceiver {
        MessageReceiver::new(self.sender.subscribe())
    }

    /// Publishes a message to all subscribers asynchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be sent, typically because
    /// the channel is closed.
    pub async fn publish(&self, message: Message) -> MessageResult<()> {
        debug_message("Publishing", &message);
        self.sender
            .send(message)
            .map_err(|e| MessageError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Publishes a message synchronously without awaiting.
    ///
    /// Useful when publishing from a synchronous context; same behavior as
    /// the async version.
    pub fn sync_publish(&self, message: Message) -> MessageResult<()> {
        debug_message("Sync Publishing", &message);
        self.sender
            .send(message)
            .map_err(|e| MessageError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn queue_size(&self) -> usize {
        self.sender.len()
    }

    pub fn subscribers_size(&self) -> usize {
        // the internal receiver does not count as a subscriber
        self.sender.receiver_count() - 1
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn debug_message(prefix: &str, message: &Message) {
    if message.message_type.ends_with(".handling") {
        trace!("{} Message: {:?}", prefix, message);
    } else {
        debug!("{} Message: {:?}", prefix, message);
    }
}

pub struct MessageReceiver {
    receiver: broadcast::Receiver<Message>,
}

impl MessageReceiver {
    fn new(receiver: broadcast::Receiver<Message>) -> Self {
        Self { receiver }
    }

    /// Receives the next message. On lag the receiver resubscribes and
    /// returns the error; callers should call `recv` again promptly.
    pub async fn recv(&mut self) -> MessageResult<Message> {
        match self.receiver.recv().await {
            Ok(message) => Ok(message),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(MessageError::Lagged { count: n })
            }
            Err(e) => Err(MessageError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message send failed: {message}")]
    SendFailed { message: String },

    #[error("Message receive failed: {message}")]
    ReceiveFailed { message: String },

    #[error("Receiver lagged by {count} messages")]
    Lagged { count: u64 },
}

pub type MessageResult<T> = Result<T, MessageError>;
