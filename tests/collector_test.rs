use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use msgcollect::{Message, MessageBus, ResponseCollector, Value, COLLECT_ID_KEY};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Spawns a responder that declares intent on every request of
/// `request_type` with `declared` as its timeout, then answers after `delay`.
/// Subscribes before returning, so the responder never misses the broadcast.
fn spawn_responder(
    bus: &Arc<MessageBus>,
    id: &'static str,
    request_type: &'static str,
    declared: Duration,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    let bus = Arc::clone(bus);
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(message) = rx.recv().await {
            if message.message_type != request_type {
                continue;
            }
            bus.publish(message.handling_reply(id, declared))
                .await
                .unwrap();
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut data = HashMap::new();
                data.insert("answer".to_string(), Value::from(id));
                let _ = bus.publish(message.response_reply(id, data)).await;
            });
        }
    })
}

/// Like `spawn_responder`, but the responder declares and then goes silent.
fn spawn_silent_responder(
    bus: &Arc<MessageBus>,
    id: &'static str,
    request_type: &'static str,
    declared: Duration,
) -> tokio::task::JoinHandle<()> {
    let bus = Arc::clone(bus);
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(message) = rx.recv().await {
            if message.message_type == request_type {
                bus.publish(message.handling_reply(id, declared))
                    .await
                    .unwrap();
            }
        }
    })
}

fn answered_by(responses: &[Message]) -> Vec<&str> {
    let mut ids: Vec<&str> = responses.iter().filter_map(Message::handler_id).collect();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn test_no_responders_returns_empty_after_min_wait() {
    let bus = Arc::new(MessageBus::new(100));
    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(200),
        Duration::from_secs(3),
    );

    let started = Instant::now();
    let responses = collector.collect().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(responses, Vec::new());
    assert!(elapsed >= Duration::from_millis(180), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
}

#[tokio::test]
async fn test_single_fast_responder() {
    let bus = Arc::new(MessageBus::new(100));
    let responder = spawn_responder(
        &bus,
        "skill-a",
        "question.query",
        Duration::from_millis(200),
        Duration::from_millis(50),
    );

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(100),
        Duration::from_secs(3),
    );

    let started = Instant::now();
    let responses = collector.collect().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(answered_by(&responses), vec!["skill-a"]);
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");

    responder.abort();
}

#[tokio::test]
async fn test_early_exit_predicate_skips_slow_responder() {
    let bus = Arc::new(MessageBus::new(100));
    let fast = spawn_responder(
        &bus,
        "fast",
        "question.query",
        Duration::from_millis(300),
        Duration::from_millis(50),
    );
    let slow = spawn_responder(
        &bus,
        "slow",
        "question.query",
        Duration::from_secs(2),
        Duration::from_millis(1500),
    );

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(100),
        Duration::from_secs(3),
    )
    .early_exit(|_| true);

    let started = Instant::now();
    let responses = collector.collect().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(answered_by(&responses), vec!["fast"]);
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");

    fast.abort();
    slow.abort();
}

#[tokio::test]
async fn test_early_exit_during_floor_wait_ends_at_the_floor() {
    let bus = Arc::new(MessageBus::new(100));
    let fast = spawn_responder(
        &bus,
        "fast",
        "question.query",
        Duration::from_millis(300),
        Duration::from_millis(50),
    );
    // would otherwise hold the window open for its full 3s
    let silent = spawn_silent_responder(&bus, "slow", "question.query", Duration::from_secs(3));

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(500),
        Duration::from_secs(5),
    )
    .early_exit(|_| true);

    let started = Instant::now();
    let responses = collector.collect().await.unwrap();
    let elapsed = started.elapsed();

    // the predicate fired while the floor wait was still sleeping; the
    // collection must end at the floor, not run out the silent window
    assert_eq!(answered_by(&responses), vec!["fast"]);
    assert!(elapsed >= Duration::from_millis(480), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

    fast.abort();
    silent.abort();
}

#[tokio::test]
async fn test_late_joiner_extends_the_window() {
    let bus = Arc::new(MessageBus::new(100));
    // A's window alone would close the collection almost immediately
    let a = spawn_responder(
        &bus,
        "skill-a",
        "question.query",
        Duration::from_millis(100),
        Duration::ZERO,
    );
    let b = spawn_responder(
        &bus,
        "skill-b",
        "question.query",
        Duration::from_millis(2200),
        Duration::from_millis(700),
    );

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(200),
        Duration::from_secs(5),
    );

    let started = Instant::now();
    let responses = collector.collect().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(answered_by(&responses), vec!["skill-a", "skill-b"]);
    assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    a.abort();
    b.abort();
}

#[tokio::test]
async fn test_wait_again_blocks_for_late_registration() {
    let bus = Arc::new(MessageBus::new(100));
    let a = spawn_responder(
        &bus,
        "skill-a",
        "question.query",
        Duration::from_millis(300),
        Duration::ZERO,
    );

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(200),
        Duration::from_secs(5),
    );
    collector.start().await.unwrap();
    assert_eq!(answered_by(&collector.wait().await), vec!["skill-a"]);

    // skill-b registers only after the first wait already completed
    let request = Message::new("question.query")
        .with_context(COLLECT_ID_KEY, Value::from(collector.collect_id()));
    bus.publish(request.handling_reply("skill-b", Duration::from_secs(2)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let answer_bus = Arc::clone(&bus);
    let late_request = request.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = answer_bus
            .publish(late_request.response_reply("skill-b", HashMap::new()))
            .await;
    });

    // the earlier all-answered completion must not short-circuit this wait
    let started = Instant::now();
    let responses = collector.wait().await;
    let elapsed = started.elapsed();

    assert_eq!(answered_by(&responses), vec!["skill-a", "skill-b"]);
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    collector.shutdown();
    a.abort();
}

#[tokio::test]
async fn test_max_wait_ceiling() {
    let bus = Arc::new(MessageBus::new(100));
    let silent = spawn_silent_responder(&bus, "stuck", "question.query", Duration::from_secs(30));

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(100),
        Duration::from_millis(600),
    );

    let started = Instant::now();
    let responses = collector.collect().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(responses, Vec::new());
    assert!(elapsed >= Duration::from_millis(550), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

    silent.abort();
}

#[tokio::test]
async fn test_duplicate_declaration_does_not_extend_window() {
    let bus = Arc::new(MessageBus::new(100));

    // hand-rolled responder: declares twice, second time with a huge
    // timeout, and never answers
    let responder_bus = Arc::clone(&bus);
    let mut rx = bus.subscribe();
    let responder = tokio::spawn(async move {
        while let Ok(message) = rx.recv().await {
            if message.message_type == "question.query" {
                responder_bus
                    .publish(message.handling_reply("flaky", Duration::from_millis(100)))
                    .await
                    .unwrap();
                responder_bus
                    .publish(message.handling_reply("flaky", Duration::from_secs(30)))
                    .await
                    .unwrap();
            }
        }
    });

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(100),
        Duration::from_secs(5),
    );

    let started = Instant::now();
    let responses = collector.collect().await.unwrap();
    let elapsed = started.elapsed();

    // first declaration wins, so the 30s re-declaration must not hold the
    // window open
    assert_eq!(responses, Vec::new());
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    responder.abort();
}

#[tokio::test]
async fn test_idempotent_teardown() {
    let bus = Arc::new(MessageBus::new(100));
    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(50),
        Duration::from_millis(500),
    );

    // collect tears down internally; explicit shutdowns afterwards must be
    // harmless
    collector.collect().await.unwrap();
    collector.shutdown();
    collector.shutdown();
}

#[tokio::test]
async fn test_correlation_isolation_between_concurrent_collections() {
    let bus = Arc::new(MessageBus::new(100));

    // each responder only answers requests addressed to it, but both
    // collections use the same message type
    for id in ["skill-one", "skill-two"] {
        let responder_bus = Arc::clone(&bus);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(message) = rx.recv().await {
                if message.message_type == "question.query"
                    && message.data.get("target").and_then(Value::as_str) == Some(id)
                {
                    responder_bus
                        .publish(message.handling_reply(id, Duration::from_millis(300)))
                        .await
                        .unwrap();
                    responder_bus
                        .publish(message.response_reply(id, HashMap::new()))
                        .await
                        .unwrap();
                }
            }
        });
    }

    let one = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query").with_data("target", Value::from("skill-one")),
        Duration::from_millis(150),
        Duration::from_secs(3),
    );
    let two = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query").with_data("target", Value::from("skill-two")),
        Duration::from_millis(150),
        Duration::from_secs(3),
    );

    let (responses_one, responses_two) = tokio::join!(one.collect(), two.collect());
    let responses_one = responses_one.unwrap();
    let responses_two = responses_two.unwrap();

    assert_eq!(answered_by(&responses_one), vec!["skill-one"]);
    assert_eq!(answered_by(&responses_two), vec!["skill-two"]);
}

#[tokio::test]
async fn test_on_response_streams_each_answer_once() {
    let bus = Arc::new(MessageBus::new(100));
    let a = spawn_responder(
        &bus,
        "skill-a",
        "question.query",
        Duration::from_millis(400),
        Duration::from_millis(50),
    );
    let b = spawn_responder(
        &bus,
        "skill-b",
        "question.query",
        Duration::from_millis(400),
        Duration::from_millis(100),
    );

    let collector = ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(200),
        Duration::from_secs(3),
    );
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    collector.on_response(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let responses = collector.collect().await.unwrap();

    assert_eq!(responses.len(), 2);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    a.abort();
    b.abort();
}

#[tokio::test]
async fn test_abort_ends_collection_early() {
    let bus = Arc::new(MessageBus::new(100));
    let silent = spawn_silent_responder(&bus, "stuck", "question.query", Duration::from_secs(30));

    let collector = Arc::new(ResponseCollector::new(
        Arc::clone(&bus),
        Message::new("question.query"),
        Duration::from_millis(100),
        Duration::from_secs(30),
    ));

    let task = tokio::spawn({
        let collector = Arc::clone(&collector);
        async move { collector.collect().await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    collector.abort();

    let started = Instant::now();
    let responses = task.await.unwrap().unwrap();
    assert_eq!(responses, Vec::new());
    assert!(started.elapsed() < Duration::from_secs(1));

    silent.abort();
}
