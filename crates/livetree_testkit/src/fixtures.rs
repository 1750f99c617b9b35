//! Test fixtures: tracing setup and event recorders.

use livetree_client::{EventType, Snapshot, Value};
use parking_lot::Mutex;
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One event seen by a [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    /// Kind of event.
    pub event_type: EventType,
    /// Key of the snapshot; `None` at the root.
    pub key: Option<String>,
    /// Plain value of the snapshot.
    pub value: Value,
    /// Key of the preceding sibling, for child events.
    pub prev_key: Option<String>,
}

/// Collects events from listener callbacks.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback recording events of `event_type`.
    pub fn callback(
        &self,
        event_type: EventType,
    ) -> impl Fn(&Snapshot, Option<&str>) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |snapshot, prev_key| {
            events.lock().push(Recorded {
                event_type,
                key: snapshot.key().map(str::to_string),
                value: snapshot.value(),
                prev_key: prev_key.map(str::to_string),
            });
        }
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Values of recorded events, in order.
    pub fn values(&self) -> Vec<Value> {
        self.events.lock().iter().map(|e| e.value.clone()).collect()
    }

    /// `(event type, key, prev key)` of recorded events, in order.
    pub fn keys(&self) -> Vec<(EventType, Option<String>, Option<String>)> {
        self.events
            .lock()
            .iter()
            .map(|e| (e.event_type, e.key.clone(), e.prev_key.clone()))
            .collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forgets everything recorded.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Counts calls, for cancel callbacks and the like.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallCounter {
    /// Creates a counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback recording the display form of its argument.
    pub fn callback<E: std::fmt::Display + 'static>(&self) -> impl Fn(&E) + Send + Sync + 'static {
        let calls = Arc::clone(&self.calls);
        move |arg| calls.lock().push(arg.to_string())
    }

    /// Number of calls.
    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Display forms of the arguments, in call order.
    pub fn messages(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}
