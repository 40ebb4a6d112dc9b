//! Event bus (spec.md §4.11): a typed, synchronous, per-instance pub/sub
//! channel the pipeline uses to surface everything callers might want to
//! observe without forcing them to poll stats objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// The fixed set of event names the pipeline can emit (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    RequestBlocked,
    RequestAllowed,
    CacheHit,
    CacheMiss,
    CacheStore,
    ContextTrimmed,
    RouterDowngraded,
    RouterHoldback,
    LedgerEntry,
    BreakerWarning,
    BreakerTripped,
    UserBudgetWarning,
    UserBudgetExceeded,
    UserBudgetSpend,
    StreamChunk,
    StreamAbort,
    StreamComplete,
    AnomalyDetected,
    CompressorApplied,
    DeltaApplied,
    StorageError,
    CostFallback,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RequestBlocked => "request:blocked",
            EventKind::RequestAllowed => "request:allowed",
            EventKind::CacheHit => "cache:hit",
            EventKind::CacheMiss => "cache:miss",
            EventKind::CacheStore => "cache:store",
            EventKind::ContextTrimmed => "context:trimmed",
            EventKind::RouterDowngraded => "router:downgraded",
            EventKind::RouterHoldback => "router:holdback",
            EventKind::LedgerEntry => "ledger:entry",
            EventKind::BreakerWarning => "breaker:warning",
            EventKind::BreakerTripped => "breaker:tripped",
            EventKind::UserBudgetWarning => "userBudget:warning",
            EventKind::UserBudgetExceeded => "userBudget:exceeded",
            EventKind::UserBudgetSpend => "userBudget:spend",
            EventKind::StreamChunk => "stream:chunk",
            EventKind::StreamAbort => "stream:abort",
            EventKind::StreamComplete => "stream:complete",
            EventKind::AnomalyDetected => "anomaly:detected",
            EventKind::CompressorApplied => "compressor:applied",
            EventKind::DeltaApplied => "delta:applied",
            EventKind::StorageError => "storage:error",
            EventKind::CostFallback => "cost:fallback",
        }
    }
}

/// A single event, carrying a JSON payload so subscribers don't need a
/// concrete type per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

struct BusState {
    subscribers: Vec<Subscriber>,
    disposed: bool,
}

/// Per-instance event bus. Callbacks run synchronously, in registration
/// order, on the thread that calls [`EventBus::emit`] — subscribers that
/// need async work should hand off to a task themselves.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<RwLock<BusState>>,
    /// Optional forwarding to a process-global bus. Disabled by default
    /// (spec.md DESIGN NOTES): an instance's events stay local unless a
    /// caller explicitly wires this up.
    forward_to: Option<Arc<EventBus>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState {
                subscribers: Vec::new(),
                disposed: false,
            })),
            forward_to: None,
        }
    }

    /// Build a bus that also forwards every emitted event to `global`.
    pub fn with_forwarding(global: Arc<EventBus>) -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState {
                subscribers: Vec::new(),
                disposed: false,
            })),
            forward_to: Some(global),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&Event) + Send + Sync + 'static) {
        let mut state = self.state.write().expect("event bus lock poisoned");
        if state.disposed {
            return;
        }
        state.subscribers.push(Arc::new(callback));
    }

    pub fn emit(&self, kind: EventKind, payload: Value) {
        let event = Event::new(kind, payload);
        let state = self.state.read().expect("event bus lock poisoned");
        if state.disposed {
            return;
        }
        for subscriber in &state.subscribers {
            subscriber(&event);
        }
        if let Some(forward) = &self.forward_to {
            forward.emit(kind, event.payload.clone());
        }
    }

    /// Drop all subscribers and stop forwarding. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.write().expect("event bus lock poisoned");
        state.subscribers.clear();
        state.disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        bus.subscribe(move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        bus.subscribe(move |_| o2.lock().unwrap().push(2));
        bus.emit(EventKind::CacheHit, json!({}));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn dispose_silences_further_emits() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EventKind::CacheMiss, json!({}));
        bus.dispose();
        bus.emit(EventKind::CacheMiss, json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forwarding_propagates_to_global_bus() {
        let global = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        global.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let local = EventBus::with_forwarding(global);
        local.emit(EventKind::LedgerEntry, json!({"cost": 0.01}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_kind_strings_use_expected_format() {
        assert_eq!(EventKind::RequestBlocked.as_str(), "request:blocked");
        assert_eq!(EventKind::UserBudgetWarning.as_str(), "userBudget:warning");
    }
}
