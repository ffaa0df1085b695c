//! # msgcollect: multi-responder response collection
//!
//! A scatter/gather protocol over a publish-subscribe message bus: broadcast
//! one request, discover which subscribers intend to answer (and their
//! self-declared timeouts), wait for their answers subject to a min/max wait
//! window and an optional early-exit predicate, and return the collected
//! answers.
//!
//! The collection is best-effort by design: nobody answering yields an empty
//! result, a responder that registers but never answers is bounded by the
//! `max_wait` ceiling, and every failure mode degrades to a partial or empty
//! result rather than an error.
//!
//! See the [`event`] module for the protocol and usage examples.

pub mod config;
pub mod event;

// Re-exports
pub use config::{CollectorConfig, ConfigError, ConfigResult};
pub use event::event_bus;
pub use event::event_bus::{Message, MessageBus, MessageError, MessageReceiver, MessageResult, Value};
pub use event::response_collector;
pub use event::response_collector::{CollectError, CollectResult, ResponseCollector, COLLECT_ID_KEY};
