//! # Response Collector
//!
//! The ResponseCollector provides a scatter/gather pattern on top of the
//! asynchronous message bus. It broadcasts a single request, lets an unknown
//! and dynamically growing set of responders declare intent to answer (each
//! with a self-declared timeout), waits for their answers subject to a
//! min/max wait window, and returns the collected answers.
//!
//! ## Key Features
//!
//! - **Responder Discovery**: Responders announce themselves on
//!   `"<type>.handling"` with their own timeout
//! - **Correlation**: A collection id stamped into the request context
//!   isolates concurrent collections sharing one bus
//! - **Dynamic Deadline**: Late-registering responders extend the wait
//!   window, up to a hard `max_wait` ceiling
//! - **Early Exit**: An optional predicate can end the collection on a
//!   sufficiently good answer, once `min_wait` has elapsed
//! - **Cancellation**: An in-flight collection can be aborted; teardown runs
//!   on every exit path
//!
//! ## Implementation Details
//!
//! One listener task per collector drains a broadcast receiver and performs
//! all bookkeeping under a single mutex. Completion is signalled through a
//! watch channel that the wait loop observes with a short poll slice, so a
//! late registration that pushes the deadline out is noticed within one
//! polling interval.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::event_bus::{Message, MessageBus, MessageError, MessageReceiver, Value};
use crate::config::CollectorConfig;

/// Context key carrying the collection correlation id.
pub const COLLECT_ID_KEY: &str = "__collect_id__";

type EarlyExitFn = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
type ResponseCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Responder bookkeeping for one collection, guarded by a single mutex.
///
/// The registry and the answer set must be read together for the completion
/// check, which is why this is one struct under one lock rather than two
/// concurrent maps.
#[derive(Default)]
struct CollectorState {
    /// responder id -> remaining timeout; reset to zero once answered
    handlers: HashMap<String, Duration>,
    /// answers in arrival order, at most one per responder id
    responses: Vec<Message>,
    /// responder ids that have answered
    responded: HashSet<String>,
    /// latched once the early-exit predicate accepts an answer; unlike the
    /// all-answered condition it is never re-evaluated
    early_exited: bool,
}

/// Locks a mutex, recovering the inner value if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// # ResponseCollector
///
/// Runs one request/collect cycle: broadcast a request, let interested
/// parties register intent-to-respond with an individual timeout, wait for
/// their answers, and return them. Nobody registering is not an error; the
/// collection fails open with an empty result.
///
/// A collector is one-shot: it broadcasts exactly once and is dropped by the
/// caller after [`collect`](Self::collect) returns.
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use msgcollect::event_bus::{Message, MessageBus};
/// # use msgcollect::response_collector::ResponseCollector;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = Arc::new(MessageBus::new(100));
/// let request = Message::new("question.query");
/// let collector = ResponseCollector::new(
///     bus,
///     request,
///     Duration::from_millis(200),
///     Duration::from_secs(3),
/// );
/// let answers = collector.collect().await?;
/// println!("{} answers", answers.len());
/// # Ok(())
/// # }
/// ```
pub struct ResponseCollector {
    bus: Arc<MessageBus>,
    request: Message,
    collect_id: String,
    min_wait: Duration,
    max_wait: Duration,
    poll_interval: Duration,
    early_exit: Option<EarlyExitFn>,
    state: Arc<Mutex<CollectorState>>,
    complete_tx: Arc<watch::Sender<bool>>,
    on_response: Arc<Mutex<Option<ResponseCallback>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseCollector {
    /// Creates a collector for one broadcast of `request`.
    ///
    /// `min_wait` is the floor every responder gets to declare intent before
    /// any completion check runs; `max_wait` is the hard ceiling on the whole
    /// collection.
    pub fn new(
        bus: Arc<MessageBus>,
        request: Message,
        min_wait: Duration,
        max_wait: Duration,
    ) -> Self {
        let (complete_tx, _) = watch::channel(false);
        Self {
            bus,
            request,
            collect_id: Uuid::new_v4().to_string(),
            min_wait,
            max_wait,
            poll_interval: Duration::from_millis(100),
            early_exit: None,
            state: Arc::new(Mutex::new(CollectorState::default())),
            complete_tx: Arc::new(complete_tx),
            on_response: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            started_at: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Creates a collector with the wait window and poll interval taken from
    /// a [`CollectorConfig`].
    pub fn with_config(bus: Arc<MessageBus>, request: Message, config: &CollectorConfig) -> Self {
        let mut collector = Self::new(bus, request, config.min_wait, config.max_wait);
        collector.poll_interval = config.poll_interval;
        collector
    }

    /// Attaches an early-exit predicate: the collection ends as soon as the
    /// predicate accepts a received answer (never before `min_wait`).
    ///
    /// The predicate runs on the bus listener task, so it should be fast and
    /// non-blocking.
    pub fn early_exit<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.early_exit = Some(Arc::new(predicate));
        self
    }

    /// The correlation id stamped into the outgoing request's context.
    pub fn collect_id(&self) -> &str {
        &self.collect_id
    }

    /// Registers a callback invoked once per recorded answer, outside the
    /// state lock, for streaming consumption independent of the final list.
    pub fn on_response<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        *lock(&self.on_response) = Some(Arc::new(callback));
    }

    /// Broadcasts the request and blocks for `min_wait`.
    ///
    /// Spawns the listener for `"<type>.handling"` and `"<type>.response"`
    /// events, stamps the collection id into the request context, publishes
    /// the request and then sleeps the floor wait unconditionally, so every
    /// responder has at least `min_wait` to declare intent.
    ///
    /// Only the first call does anything; repeated calls return `Ok` without
    /// re-broadcasting.
    #[instrument(skip(self), fields(collect_id = %self.collect_id))]
    pub async fn start(&self) -> CollectResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // subscribe before publishing so the broadcast cannot outrun the listener
        let receiver = self.bus.subscribe();
        let context = ListenerContext {
            collect_id: self.collect_id.clone(),
            handling_type: self.request.handling_type(),
            response_type: self.request.response_type(),
            state: Arc::clone(&self.state),
            complete_tx: Arc::clone(&self.complete_tx),
            early_exit: self.early_exit.clone(),
            on_response: Arc::clone(&self.on_response),
        };
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(run_listener(receiver, context, cancel));
        *lock(&self.listener) = Some(handle);

        let mut request = self.request.clone();
        request.context.insert(
            COLLECT_ID_KEY.to_string(),
            Value::String(self.collect_id.clone()),
        );
        self.bus.publish(request).await?;
        *lock(&self.started_at) = Some(Instant::now());

        tokio::time::sleep(self.min_wait).await;
        Ok(())
    }

    /// Runs the full collection cycle and returns the answers in arrival
    /// order.
    ///
    /// Calls [`start`](Self::start); if no responder registered during the
    /// floor wait the collection fails open with an empty list. Teardown of
    /// the bus subscription runs on every exit path, including broadcast
    /// failure and [`abort`](Self::abort).
    #[instrument(skip(self), fields(collect_id = %self.collect_id))]
    pub async fn collect(&self) -> CollectResult<Vec<Message>> {
        if let Err(e) = self.start().await {
            self.shutdown();
            return Err(e);
        }

        let registered = !lock(&self.state).handlers.is_empty();
        let responses = if registered {
            self.wait().await
        } else {
            debug!("no responders registered, failing open with empty result");
            Vec::new()
        };
        self.shutdown();
        Ok(responses)
    }

    /// Re-enters the wait loop without re-broadcasting and returns the
    /// answers recorded so far, in arrival order.
    ///
    /// Waiting ends when every registered responder has answered, when the
    /// early-exit predicate fired, when the dynamic deadline derived from the
    /// responders' timeouts runs out, or at `max_wait`, whichever comes
    /// first. Returns immediately if [`start`](Self::start) has not run.
    #[instrument(skip(self), fields(collect_id = %self.collect_id))]
    pub async fn wait(&self) -> Vec<Message> {
        let started_at = match *lock(&self.started_at) {
            Some(instant) => instant,
            None => return self.responses(),
        };

        // Covers the race where every responder answered before the floor
        // wait ended. The all-answered condition is re-evaluated here so a
        // responder that registered after an earlier completion clears the
        // signal again; an early exit stays latched. send_replace stores the
        // value even while no receiver is subscribed.
        {
            let state = lock(&self.state);
            let done = state.early_exited || state.responded.len() == state.handlers.len();
            self.complete_tx.send_replace(done);
        }

        let mut complete_rx = self.complete_tx.subscribe();
        loop {
            if *complete_rx.borrow() {
                break;
            }
            let elapsed = started_at.elapsed();
            if elapsed >= self.max_wait {
                debug!("max_wait reached with outstanding responders");
                break;
            }
            // Re-derive the budget each pass: later-registering responders
            // can push the deadline out.
            let budget = {
                let state = lock(&self.state);
                state
                    .handlers
                    .values()
                    .copied()
                    .max()
                    .unwrap_or(Duration::ZERO)
            };
            if budget <= elapsed {
                break;
            }
            let slice = self
                .poll_interval
                .min(budget - elapsed)
                .min(self.max_wait - elapsed);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("collection aborted");
                    break;
                }
                changed = complete_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(slice) => {}
            }
        }
        self.responses()
    }

    /// Cancels an in-flight collection. The wait loop exits promptly and
    /// `collect()` returns whatever answers were recorded; teardown still
    /// runs.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Detaches the bus subscription and drops the response callback.
    /// Callable any number of times, including after `collect()` already
    /// tore down internally.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
        *lock(&self.on_response) = None;
    }

    fn responses(&self) -> Vec<Message> {
        lock(&self.state).responses.clone()
    }
}

impl Drop for ResponseCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything the listener task needs to do its bookkeeping.
struct ListenerContext {
    collect_id: String,
    handling_type: String,
    response_type: String,
    state: Arc<Mutex<CollectorState>>,
    complete_tx: Arc<watch::Sender<bool>>,
    early_exit: Option<EarlyExitFn>,
    on_response: Arc<Mutex<Option<ResponseCallback>>>,
}

async fn run_listener(
    mut receiver: MessageReceiver,
    context: ListenerContext,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(message) => context.handle(message),
                Err(MessageError::Lagged { count }) => {
                    warn!(
                        "collection {} receiver lagged by {} messages",
                        context.collect_id, count
                    );
                }
                Err(_) => break,
            },
        }
    }
}

impl ListenerContext {
    /// A message belongs to this collection only if it echoes our id; the
    /// bus may carry many concurrent collections at once.
    fn correlated(&self, message: &Message) -> bool {
        message
            .context
            .get(COLLECT_ID_KEY)
            .and_then(Value::as_str)
            .is_some_and(|id| id == self.collect_id)
    }

    fn handle(&self, message: Message) {
        if !self.correlated(&message) {
            return;
        }
        if message.message_type == self.handling_type {
            self.handle_handling(&message);
        } else if message.message_type == self.response_type {
            self.handle_response(message);
        }
    }

    fn handle_handling(&self, message: &Message) {
        let Some(id) = message.handler_id() else {
            trace!("handling declaration without handler id ignored");
            return;
        };
        // A declaration without a usable timeout still registers the
        // responder; it just does not extend the wait window.
        let timeout = message.declared_timeout().unwrap_or(Duration::ZERO);
        let mut state = lock(&self.state);
        // first declaration wins, duplicates are ignored
        state.handlers.entry(id.to_string()).or_insert(timeout);
        debug!(
            "responder {} registered with timeout {:?} ({} total)",
            id,
            timeout,
            state.handlers.len()
        );
    }

    fn handle_response(&self, message: Message) {
        let Some(id) = message.handler_id().map(str::to_string) else {
            trace!("response without handler id ignored");
            return;
        };
        // The predicate runs before the lock is taken, so a slow or
        // panicking predicate cannot hold up the registry.
        let exit_early = match &self.early_exit {
            Some(predicate) => {
                catch_unwind(AssertUnwindSafe(|| predicate(&message))).unwrap_or_else(|_| {
                    warn!("early-exit predicate panicked, treating answer as not matching");
                    false
                })
            }
            None => false,
        };

        let recorded = {
            let mut state = lock(&self.state);
            // answered responders no longer hold the window open; this also
            // registers a responder that answered without ever declaring
            state.handlers.insert(id.clone(), Duration::ZERO);
            let first = state.responded.insert(id);
            if first {
                state.responses.push(message.clone());
            }
            if exit_early {
                state.early_exited = true;
            }
            if exit_early || state.responded.len() == state.handlers.len() {
                // send_replace: the value must survive even when the wait
                // loop has not subscribed yet (completion during the floor
                // wait)
                self.complete_tx.send_replace(true);
            }
            first
        };

        if recorded {
            let callback = lock(&self.on_response).clone();
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(&message))).is_err() {
                    warn!("on_response callback panicked");
                }
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Broadcast failed: {0}")]
    Bus(#[from] MessageError),
}

pub type CollectResult<T> = Result<T, CollectError>;
