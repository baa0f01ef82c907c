//! Asynchronous read-side dispatch.
//!
//! At-least-once delivery of appended envelopes to registered projections.
//! Each projection gets a FIFO inbox worker fed by post-append publication,
//! a processed-set for dedup, a checkpoint at its last insertion position,
//! a bounded-retry policy that dead-letters poisoned events, and a catch-up
//! path that polls the store for anything the inbox missed. Durability never
//! depends on this module: events are already appended when they arrive
//! here.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use caresync_core::EventId;
use caresync_events::Projection;

use crate::config::CoreConfig;
use crate::event_store::{EventFilter, EventStore, Sequenced};

/// How a projection wants its events.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Inbox worker fed by post-append publication.
    Live,
    /// No worker; the owner calls `catch_up` explicitly.
    OnDemand,
    /// Background poller at this interval.
    Periodic(Duration),
}

/// An event a projection repeatedly failed on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event_id: EventId,
    pub reason: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ProjectionState {
    processed: HashSet<EventId>,
    checkpoint: u64,
    dead_letters: Vec<DeadLetter>,
}

struct Registration {
    projection: Arc<dyn Projection>,
    mode: DeliveryMode,
    state: Arc<Mutex<ProjectionState>>,
    inbox: Option<mpsc::Sender<Sequenced>>,
    worker: Option<WorkerHandle>,
}

/// Handle to control and join a background worker.
struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

pub struct EventDispatcher {
    store: Arc<dyn EventStore>,
    config: CoreConfig,
    registry: RwLock<HashMap<&'static str, Registration>>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn EventStore>, config: CoreConfig) -> Self {
        Self {
            store,
            config,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Register a projection. Live and Periodic modes spawn their worker
    /// thread here.
    pub fn register(&self, projection: Arc<dyn Projection>, mode: DeliveryMode) {
        let name = projection.name();
        let state = Arc::new(Mutex::new(ProjectionState::default()));

        let (inbox, worker) = match mode {
            DeliveryMode::Live => {
                let (tx, rx) = mpsc::channel::<Sequenced>();
                let worker = spawn_inbox_worker(
                    name,
                    rx,
                    projection.clone(),
                    state.clone(),
                    self.config.clone(),
                );
                (Some(tx), Some(worker))
            }
            DeliveryMode::Periodic(interval) => {
                let worker = spawn_poll_worker(
                    name,
                    interval,
                    self.store.clone(),
                    projection.clone(),
                    state.clone(),
                    self.config.clone(),
                );
                (None, Some(worker))
            }
            DeliveryMode::OnDemand => (None, None),
        };

        let registration = Registration {
            projection,
            mode,
            state,
            inbox,
            worker,
        };

        if let Ok(mut registry) = self.registry.write() {
            if let Some(previous) = registry.insert(name, registration) {
                warn!(projection = name, "projection re-registered; stopping previous worker");
                if let Some(w) = previous.worker {
                    w.shutdown();
                }
            }
        }
    }

    /// Post-append notification. Non-blocking: enqueues to interested Live
    /// inboxes and returns; failures only mean the catch-up poller will
    /// deliver instead.
    pub fn publish(&self, item: &Sequenced) {
        let Ok(registry) = self.registry.read() else {
            return;
        };
        for (name, reg) in registry.iter() {
            if reg.mode != DeliveryMode::Live {
                continue;
            }
            if !reg.projection.interested_in(&item.envelope) {
                continue;
            }
            if let Some(inbox) = &reg.inbox {
                if inbox.send(item.clone()).is_err() {
                    debug!(projection = name, "inbox closed; catch-up will cover");
                }
            }
        }
    }

    /// Poll the store for events past the projection's checkpoint and apply
    /// them in insertion order. Returns how many events were delivered.
    pub fn catch_up(&self, name: &str) -> usize {
        let Some((projection, state)) = self.lookup(name) else {
            return 0;
        };
        run_catch_up(
            &*self.store,
            &projection,
            &state,
            &self.config,
            self.config.sync_page_size,
        )
    }

    /// Catch up every registered projection. Doubles as a deterministic
    /// flush in tests.
    pub fn catch_up_all(&self) {
        let names: Vec<&'static str> = self
            .registry
            .read()
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default();
        for name in names {
            self.catch_up(name);
        }
    }

    pub fn checkpoint(&self, name: &str) -> u64 {
        self.lookup(name)
            .and_then(|(_, state)| state.lock().ok().map(|s| s.checkpoint))
            .unwrap_or(0)
    }

    pub fn dead_letters(&self, name: &str) -> Vec<DeadLetter> {
        self.lookup(name)
            .and_then(|(_, state)| state.lock().ok().map(|s| s.dead_letters.clone()))
            .unwrap_or_default()
    }

    /// Stop all workers. Registered projections stay queryable.
    pub fn shutdown(&self) {
        if let Ok(mut registry) = self.registry.write() {
            for reg in registry.values_mut() {
                if let Some(w) = reg.worker.take() {
                    w.shutdown();
                }
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<(Arc<dyn Projection>, Arc<Mutex<ProjectionState>>)> {
        self.registry
            .read()
            .ok()?
            .get(name)
            .map(|reg| (reg.projection.clone(), reg.state.clone()))
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_inbox_worker(
    name: &'static str,
    inbox: mpsc::Receiver<Sequenced>,
    projection: Arc<dyn Projection>,
    state: Arc<Mutex<ProjectionState>>,
    config: CoreConfig,
) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let tick = Duration::from_millis(50);

    let join = thread::Builder::new()
        .name(format!("projection-{name}"))
        .spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                match inbox.recv_timeout(tick) {
                    Ok(item) => deliver(&*projection, &state, &item, &config),
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("failed to spawn projection worker thread");

    WorkerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    }
}

fn spawn_poll_worker(
    name: &'static str,
    interval: Duration,
    store: Arc<dyn EventStore>,
    projection: Arc<dyn Projection>,
    state: Arc<Mutex<ProjectionState>>,
    config: CoreConfig,
) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let page = config.sync_page_size;

    let join = thread::Builder::new()
        .name(format!("projection-poll-{name}"))
        .spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        run_catch_up(&*store, &projection, &state, &config, page);
                    }
                }
            }
        })
        .expect("failed to spawn projection poll thread");

    WorkerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    }
}

fn run_catch_up(
    store: &dyn EventStore,
    projection: &Arc<dyn Projection>,
    state: &Arc<Mutex<ProjectionState>>,
    config: &CoreConfig,
    page_size: usize,
) -> usize {
    let mut delivered = 0;
    loop {
        let cursor = match state.lock() {
            Ok(s) => s.checkpoint,
            Err(_) => return delivered,
        };
        let (page, next) = match store.read_after(&EventFilter::any(), cursor, page_size) {
            Ok(result) => result,
            Err(err) => {
                warn!(projection = projection.name(), error = %err, "catch-up read failed");
                return delivered;
            }
        };
        if page.is_empty() {
            // Advance past filtered-out positions so we do not rescan them.
            if let Ok(mut s) = state.lock() {
                s.checkpoint = s.checkpoint.max(next);
            }
            return delivered;
        }
        for item in &page {
            if projection.interested_in(&item.envelope) {
                deliver(&**projection, state, item, config);
                delivered += 1;
            } else if let Ok(mut s) = state.lock() {
                s.checkpoint = s.checkpoint.max(item.position);
            }
        }
        if let Ok(mut s) = state.lock() {
            s.checkpoint = s.checkpoint.max(next);
        }
    }
}

/// Apply one envelope to one projection, holding its state lock for the
/// duration: one event per projection at a time, projections isolated from
/// each other.
fn deliver(
    projection: &dyn Projection,
    state: &Arc<Mutex<ProjectionState>>,
    item: &Sequenced,
    config: &CoreConfig,
) {
    let Ok(mut guard) = state.lock() else {
        return;
    };
    let event_id = item.envelope.event_id();
    if guard.processed.contains(&event_id) {
        guard.checkpoint = guard.checkpoint.max(item.position);
        return;
    }

    let mut attempts = 0;
    let mut first_failed_at: Option<DateTime<Utc>> = None;
    loop {
        match projection.apply(&item.envelope) {
            Ok(()) => {
                guard.processed.insert(event_id);
                guard.checkpoint = guard.checkpoint.max(item.position);
                return;
            }
            Err(err) => {
                attempts += 1;
                first_failed_at.get_or_insert_with(Utc::now);
                if attempts > config.dispatcher_retries {
                    warn!(
                        projection = projection.name(),
                        event = %event_id,
                        error = %err,
                        "projection handler exhausted retries; dead-lettering"
                    );
                    guard.dead_letters.push(DeadLetter {
                        event_id,
                        reason: err.to_string(),
                        attempts,
                        first_failed_at: first_failed_at.unwrap_or_else(Utc::now),
                        last_failed_at: Utc::now(),
                    });
                    // Poisoned events do not wedge the inbox: mark processed,
                    // advance, continue with the next event.
                    guard.processed.insert(event_id);
                    guard.checkpoint = guard.checkpoint.max(item.position);
                    return;
                }
                if config.dispatcher_backoff_ms > 0 {
                    thread::sleep(Duration::from_millis(
                        config.dispatcher_backoff_ms << (attempts - 1).min(6),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::test_support::envelope_for_stream;
    use crate::event_store::{AppendOutcome, InMemoryEventStore};
    use caresync_core::{AggregateId, AggregateKind, OrganizationId};
    use caresync_events::StoredEnvelope;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProjection {
        applied: AtomicU32,
        fail_first: AtomicU32,
    }

    impl CountingProjection {
        fn new(fail_first: u32) -> Self {
            Self {
                applied: AtomicU32::new(0),
                fail_first: AtomicU32::new(fail_first),
            }
        }
    }

    impl Projection for CountingProjection {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interested_in(&self, envelope: &StoredEnvelope) -> bool {
            envelope.aggregate_type() == AggregateKind::VitalSigns
        }

        fn apply(&self, _envelope: &StoredEnvelope) -> anyhow::Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient projection failure");
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn append_vitals(store: &InMemoryEventStore, org: OrganizationId, lsn: u64) -> Sequenced {
        let env = envelope_for_stream(AggregateKind::VitalSigns, AggregateId::new(), 1, org, "d1", lsn);
        match store.append(&env).unwrap() {
            AppendOutcome::Appended { position } => Sequenced {
                position,
                envelope: env,
            },
            AppendOutcome::AlreadyExists => unreachable!(),
        }
    }

    #[test]
    fn catch_up_delivers_missed_events_exactly_once() {
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = EventDispatcher::new(store.clone(), CoreConfig::immediate());
        let projection = Arc::new(CountingProjection::new(0));
        dispatcher.register(projection.clone(), DeliveryMode::OnDemand);

        let org = OrganizationId::new();
        let a = append_vitals(&store, org, 1);
        let _b = append_vitals(&store, org, 2);

        assert_eq!(dispatcher.catch_up("counting"), 2);
        assert_eq!(projection.applied.load(Ordering::SeqCst), 2);

        // Live publication of an already-processed event is deduped.
        dispatcher.publish(&a);
        assert_eq!(dispatcher.catch_up("counting"), 0);
        assert_eq!(projection.applied.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.checkpoint("counting"), 2);
    }

    #[test]
    fn transient_failures_retry_then_succeed() {
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = EventDispatcher::new(store.clone(), CoreConfig::immediate());
        let projection = Arc::new(CountingProjection::new(2));
        dispatcher.register(projection.clone(), DeliveryMode::OnDemand);

        append_vitals(&store, OrganizationId::new(), 1);
        dispatcher.catch_up("counting");

        assert_eq!(projection.applied.load(Ordering::SeqCst), 1);
        assert!(dispatcher.dead_letters("counting").is_empty());
    }

    #[test]
    fn exhausted_retries_dead_letter_and_continue() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut config = CoreConfig::immediate();
        config.dispatcher_retries = 1;
        let dispatcher = EventDispatcher::new(store.clone(), config);
        // Fails more times than the retry budget for the first event only.
        let projection = Arc::new(CountingProjection::new(2));
        dispatcher.register(projection.clone(), DeliveryMode::OnDemand);

        let org = OrganizationId::new();
        append_vitals(&store, org, 1);
        append_vitals(&store, org, 2);
        dispatcher.catch_up("counting");

        let dead = dispatcher.dead_letters("counting");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        // The second event still went through.
        assert_eq!(projection.applied.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.checkpoint("counting"), 2);
    }
}
