use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use log::debug;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backend::{Backend, BackendConfig};
use crate::error::EventIdNotFound;
use crate::event_log::{EventHandler, EventLog};
use crate::membership::MembershipEvent;
use crate::registration::Registration;
use crate::snapshot_store::SnapshotStore;

#[derive(Clone)]
struct Record {
    id: Uuid,
    payload: Value,
}

struct Subscriber {
    id: u64,
    /// Absolute position of the first event this subscriber gets live.
    /// Everything before it was covered by the subscribe-time replay.
    from: usize,
    handler: EventHandler,
}

struct LogState {
    records: Vec<Record>,
    /// Absolute position of `records[0]`; grows as the log is truncated.
    base: usize,
    /// Id of the newest truncated event. Subscribing from it is still
    /// valid: the whole retained log comes strictly after it.
    boundary: Option<Uuid>,
    pending: VecDeque<Record>,
    delivering: bool,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

/// In-memory event log with synchronous, totally-ordered delivery.
///
/// Submissions made from inside an event handler (for example a state
/// machine emitting compensating changes while applying one) are queued and
/// delivered by the outer drain loop, preserving the total order without
/// re-entering any lock. Subscribing from inside a handler of the same log
/// is not supported.
pub struct LocalEventLog {
    state: Arc<Mutex<LogState>>,
    /// Held while handlers run, so replay and live delivery never interleave
    /// for any subscriber.
    delivery: Mutex<()>,
}

impl LocalEventLog {
    pub fn new() -> Self {
        LocalEventLog {
            state: Arc::new(Mutex::new(LogState {
                records: Vec::new(),
                base: 0,
                boundary: None,
                pending: VecDeque::new(),
                delivering: false,
                subscribers: Vec::new(),
                next_subscriber: 0,
            })),
            delivery: Mutex::new(()),
        }
    }

    fn drain(&self) {
        let _guard = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        self.drain_locked();
    }

    /// Deliver queued records. The delivery lock must be held and the
    /// delivering flag set, so nested submissions queue up instead of
    /// re-entering.
    fn drain_locked(&self) {
        // Clears the delivering flag even when a handler panics, so the
        // queue is not wedged for every later submission.
        let mut reset = DeliveringReset {
            state: &self.state,
            armed: true,
        };
        loop {
            let (record, handlers) = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                match state.pending.pop_front() {
                    Some(record) => {
                        let position = state.base + state.records.len();
                        state.records.push(record.clone());
                        let handlers: Vec<EventHandler> = state
                            .subscribers
                            .iter()
                            .filter(|s| s.from <= position)
                            .map(|s| s.handler.clone())
                            .collect();
                        (record, handlers)
                    }
                    None => {
                        state.delivering = false;
                        reset.armed = false;
                        return;
                    }
                }
            };
            for handler in handlers {
                handler(record.id, &record.payload);
            }
        }
    }
}

impl Default for LocalEventLog {
    fn default() -> Self {
        Self::new()
    }
}

struct DeliveringReset<'a> {
    state: &'a Arc<Mutex<LogState>>,
    armed: bool,
}

impl Drop for DeliveringReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.delivering = false;
        }
    }
}

impl EventLog for LocalEventLog {
    fn submit_event(&self, id: Uuid, payload: Value) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.push_back(Record { id, payload });
            if state.delivering {
                // A drain loop (possibly this thread, further up the stack)
                // will pick the record up.
                return;
            }
            state.delivering = true;
        }
        self.drain();
    }

    fn subscribe(
        &self,
        since: Option<Uuid>,
        handler: EventHandler,
    ) -> Result<Registration, EventIdNotFound> {
        // Excludes live delivery while the replay runs.
        let _guard = self.delivery.lock().unwrap_or_else(|e| e.into_inner());

        let (replay, subscriber_id) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let start = match since {
                None => 0,
                Some(id) if state.boundary == Some(id) => 0,
                Some(id) => match state.records.iter().position(|r| r.id == id) {
                    Some(position) => position + 1,
                    None => return Err(EventIdNotFound { id }),
                },
            };
            let replay: Vec<Record> = state.records[start..].to_vec();
            let subscriber_id = state.next_subscriber;
            state.next_subscriber += 1;
            let from = state.base + state.records.len();
            state.subscribers.push(Subscriber {
                id: subscriber_id,
                from,
                handler: handler.clone(),
            });
            // Replay handlers may submit new records (a state machine
            // reacting to what it replays); flag delivery in progress so
            // those queue up for the drain below.
            state.delivering = true;
            (replay, subscriber_id)
        };

        {
            let mut replay_reset = DeliveringReset {
                state: &self.state,
                armed: true,
            };
            for record in replay {
                handler(record.id, &record.payload);
            }
            replay_reset.armed = false;
        }
        self.drain_locked();

        let state = Arc::clone(&self.state);
        Ok(Registration::new(move || {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.subscribers.retain(|s| s.id != subscriber_id);
        }))
    }

    fn truncate(&self, older_than: Uuid) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(position) = state.records.iter().position(|r| r.id == older_than) {
            let removed = position + 1;
            state.records.drain(..removed);
            state.base += removed;
            state.boundary = Some(older_than);
            debug!("Truncated {} events from log", removed);
        }
    }
}

/// Substrate shared by every backend of one local cluster.
struct SharedState {
    logs: Mutex<HashMap<String, Arc<LocalEventLog>>>,
    membership: Arc<LocalEventLog>,
    snapshots: SnapshotStore,
}

impl SharedState {
    fn new(snapshots: SnapshotStore) -> Self {
        SharedState {
            logs: Mutex::new(HashMap::new()),
            membership: Arc::new(LocalEventLog::new()),
            snapshots,
        }
    }

    fn open_log(&self, log_id: &str) -> Arc<LocalEventLog> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            logs.entry(log_id.to_string())
                .or_insert_with(|| Arc::new(LocalEventLog::new())),
        )
    }
}

/// A factory for backends sharing one in-process substrate.
///
/// All backends created from the same cluster observe the same event logs,
/// membership log, and snapshot store, which is what lets multi-node
/// behaviors (leader failover, stale-entry sweeps, late joiners) run in a
/// single process. `join`/`leave` announce membership transitions; `leave`
/// doubles as the failure detector for in-process tests.
pub struct LocalCluster {
    shared: Arc<SharedState>,
}

impl LocalCluster {
    pub fn new() -> Self {
        LocalCluster {
            shared: Arc::new(SharedState::new(SnapshotStore::in_memory())),
        }
    }

    pub fn with_config(config: BackendConfig) -> io::Result<Self> {
        let snapshots = match config.data_dir {
            Some(ref dir) => SnapshotStore::with_dir(dir)?,
            None => SnapshotStore::in_memory(),
        };
        Ok(LocalCluster {
            shared: Arc::new(SharedState::new(snapshots)),
        })
    }

    /// Create a backend representing one node of this cluster.
    ///
    /// The node is not announced until [`join`](Self::join) is called.
    pub fn create_backend(&self) -> Arc<LocalBackend> {
        Arc::new(LocalBackend {
            node_id: Uuid::new_v4(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Announce a node as joined on the membership log.
    pub fn join(&self, backend: &LocalBackend) {
        self.shared.membership.submit_event(
            Uuid::new_v4(),
            MembershipEvent::join(backend.node_id).to_value(),
        );
    }

    /// Announce a node as left on the membership log.
    pub fn leave(&self, backend: &LocalBackend) {
        self.shared.membership.submit_event(
            Uuid::new_v4(),
            MembershipEvent::leave(backend.node_id).to_value(),
        );
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-process backend over in-memory logs.
pub struct LocalBackend {
    node_id: Uuid,
    shared: Arc<SharedState>,
}

impl LocalBackend {
    /// Create a standalone single-node backend, already joined.
    pub fn new() -> Arc<Self> {
        let cluster = LocalCluster::new();
        let backend = cluster.create_backend();
        cluster.join(&backend);
        backend
    }

    /// Create a standalone single-node backend with configuration,
    /// already joined.
    pub fn with_config(config: BackendConfig) -> io::Result<Arc<Self>> {
        let cluster = LocalCluster::with_config(config)?;
        let backend = cluster.create_backend();
        cluster.join(&backend);
        Ok(backend)
    }
}

impl Backend for LocalBackend {
    fn node_id(&self) -> Uuid {
        self.node_id
    }

    fn open_event_log(&self, log_id: &str) -> Arc<dyn EventLog> {
        self.shared.open_log(log_id)
    }

    fn membership_log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.shared.membership) as Arc<dyn EventLog>
    }

    fn load_latest_snapshot(&self, name: &str) -> oneshot::Receiver<Option<Value>> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(self.shared.snapshots.load(name));
        rx
    }

    fn submit_snapshot(&self, name: &str, snapshot: Value) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.shared.snapshots.save(name, &snapshot) {
            log::warn!("Failed to persist snapshot for '{}': {}", name, e);
        }
        let _ = tx.send(());
        rx
    }
}
