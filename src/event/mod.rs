//! # Bus-Mediated Scatter/Gather
//!
//! The event layer holds the two halves of the collection protocol: the
//! broadcast message bus and the response collector that coordinates an
//! unknown set of responders over it.
//!
//! ## Architecture Overview
//!
//! - **MessageBus**: Publish-subscribe hub built on a broadcast channel
//! - **ResponseCollector**: One-shot scatter/gather cycle with correlation,
//!   per-responder timeouts and an optional early exit
//!
//! ## Protocol Flow
//!
//! ```text
//! ┌─────────┐  <type>              ┌──────────┐          ┌──────────┐
//! │Collector│─────────────────────▶│MessageBus│─────────▶│Responder │
//! └────┬────┘                      └──────────┘          └────┬─────┘
//!      │                                                      │
//!      │   <type>.handling  (id, timeout)                     │
//!      │◀─────────────────────────────────────────────────────┤
//!      │                                                      │
//!      │   <type>.response  (id, answer)                      │
//!      │◀─────────────────────────────────────────────────────┘
//! ```
//!
//! 1. The collector broadcasts one request, stamped with a collection id
//! 2. Each interested responder declares intent on `"<type>.handling"` with
//!    its own timeout, then answers on `"<type>.response"`
//! 3. The collector waits until everyone who declared has answered, the
//!    early-exit predicate fires, or the wait window closes
//!
//! Concurrent collections share the bus safely: replies echo the collection
//! id in their context, and each collector ignores everything else.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use msgcollect::event_bus::{Message, MessageBus, Value};
//! # use msgcollect::response_collector::ResponseCollector;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(MessageBus::new(100));
//!
//! let request = Message::new("question.query")
//!     .with_data("phrase", Value::String("what is the weather".to_string()));
//! let collector = ResponseCollector::new(
//!     Arc::clone(&bus),
//!     request,
//!     Duration::from_millis(200),
//!     Duration::from_secs(3),
//! );
//!
//! for answer in collector.collect().await? {
//!     println!("answer from {:?}", answer.handler_id());
//! }
//! # Ok(())
//! # }
//! ```

pub mod event_bus;
pub mod response_collector;
