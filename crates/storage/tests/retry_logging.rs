//! Integration test verifying the log events emitted by the retry policy.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use cloudtable_storage::{
    RetryConfig, StorageError, retry::with_fallback, with_retry, with_retry_if,
};
use tracing::{Level, Subscriber};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records level and message of every event
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct EventCollector {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for EventCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events.lock().expect("lock poisoned").push((*event.metadata().level(), visitor.0));
    }
}

impl EventCollector {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    fn count(&self, level: Level, message: &str) -> usize {
        self.events
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(l, m)| *l == level && m == message)
            .count()
    }
}

fn policy() -> RetryConfig {
    RetryConfig::builder().max_retries(3).delay(Duration::from_millis(50)).build()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn two_failures_log_two_warnings() {
    let collector = EventCollector::default();
    let _guard = collector.install();

    let calls = Arc::new(AtomicU32::new(0));
    let value = with_retry(&policy(), "flaky_read", None, || {
        let calls = Arc::clone(&calls);
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::unavailable("busy"))
            } else {
                Ok(42)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(collector.count(Level::WARN, "execution failed"), 2);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_logs_every_attempt() {
    let collector = EventCollector::default();
    let _guard = collector.install();

    let err = with_retry(&policy(), "always_down", None, || async {
        Err::<(), _>(StorageError::timeout())
    })
    .await
    .unwrap_err();

    assert_eq!(err.attempts(), 4);
    assert_eq!(collector.count(Level::WARN, "execution failed"), 4);
}

#[tokio::test]
async fn rejected_failures_are_not_logged_as_retries() {
    let collector = EventCollector::default();
    let _guard = collector.install();

    let err = with_retry_if(&policy(), "conflicting_write", None, StorageError::is_transient, || {
        async { Err::<(), _>(StorageError::conflict("t/p/r")) }
    })
    .await
    .unwrap_err();

    assert_eq!(err.attempts(), 1);
    assert_eq!(collector.count(Level::WARN, "execution failed"), 0);
}

#[tokio::test(start_paused = true)]
async fn fallback_logs_error_once() {
    let collector = EventCollector::default();
    let _guard = collector.install();

    let value = with_fallback(&policy(), "lookup", None, 7, || async {
        Err::<i32, _>(StorageError::connection("reset"))
    })
    .await;

    assert_eq!(value, 7);
    assert_eq!(collector.count(Level::ERROR, "returning fallback value"), 1);
}
