//! The topic state machine: a named dataset materialized by folding an
//! event log's change stream, with membership/leadership bookkeeping,
//! connection-scoped cleanup sweeps, idle expiration, and periodic
//! snapshotting.

use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use log::{debug, error, warn};
use serde_json::Value;
use tokio::runtime::Handle;
use uuid::Uuid;

use backend::{add_membership_listener, Backend, EventHandler, EventLog, MembershipKind, Registration};

use crate::change::{Change, ChangeDetails, ChangeResult, ListChange, MapChange};
use crate::entry_list::EntryList;
use crate::json::{duration_from_iso, duration_to_iso};
use crate::snapshot::{ListEntrySnapshot, MapEntrySnapshot, TopicSnapshot};

/// A snapshot is submitted and the log truncated after this many applied
/// mutating changes.
const SNAPSHOT_EVERY: u64 = 100;

/// How many times topic bootstrap retries snapshot-load-then-subscribe when
/// the snapshot's resume id has been truncated away.
const MAX_BOOTSTRAP_ATTEMPTS: usize = 50;

/// Callback observing every applied change, invoked under the topic lock.
///
/// The second argument is the topic's delivery sequence number: a counter
/// incremented for every notified change, letting late subscribers fence
/// their catch-up reads against changes already in flight.
pub type ChangeSubscriber = Arc<dyn Fn(Uuid, u64, &ChangeDetails) + Send + Sync>;

type ResultTracker = Box<dyn FnOnce(ChangeResult) + Send>;
type ReadyCallback = Box<dyn FnOnce(bool) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub revision: Uuid,
    pub value: Value,
    pub scope_owner: Option<Uuid>,
}

/// One named map: entries plus their key insertion order.
#[derive(Default)]
struct MapData {
    entries: HashMap<String, MapEntry>,
    order: Vec<String>,
}

enum ReadyState {
    Pending(Vec<ReadyCallback>),
    Ready,
    Failed,
}

struct TopicState {
    maps: HashMap<String, MapData>,
    lists: HashMap<String, EntryList>,
    map_timeouts: HashMap<String, std::time::Duration>,
    list_timeouts: HashMap<String, std::time::Duration>,
    /// Nodes with at least one active connection on this topic.
    active_nodes: Vec<Uuid>,
    /// All attached backend nodes, in join order; the first one leads.
    backend_nodes: Vec<Uuid>,
    last_disconnected: Option<Instant>,
    leader: bool,
    applied_changes: u64,
    latest_change_id: Option<Uuid>,
    delivery_seq: u64,
    subscribers: Vec<(u64, ChangeSubscriber)>,
    next_subscriber: u64,
}

impl TopicState {
    fn new() -> Self {
        TopicState {
            maps: HashMap::new(),
            lists: HashMap::new(),
            map_timeouts: HashMap::new(),
            list_timeouts: HashMap::new(),
            active_nodes: Vec::new(),
            backend_nodes: Vec::new(),
            last_disconnected: None,
            leader: false,
            applied_changes: 0,
            latest_change_id: None,
            delivery_seq: 0,
            subscribers: Vec::new(),
            next_subscriber: 0,
        }
    }

    fn has_data(&self) -> bool {
        !self.maps.is_empty() || !self.lists.is_empty()
    }
}

/// A named, isolated coordination namespace whose state is the fold of its
/// event log.
///
/// Every state transition happens while holding the topic monitor, so
/// application is single-threaded per topic. Subscribers run under the
/// lock and must not re-enter the topic; they dispatch onward instead.
pub struct Topic {
    id: String,
    local_node: Uuid,
    backend: Arc<dyn Backend>,
    event_log: Arc<dyn EventLog>,
    state: Mutex<TopicState>,
    trackers: Mutex<HashMap<Uuid, ResultTracker>>,
    ready: Mutex<ReadyState>,
    log_registration: Mutex<Option<Registration>>,
    membership_registration: Mutex<Option<Registration>>,
}

impl Topic {
    /// Create the topic and start its asynchronous bootstrap: load the
    /// latest snapshot, subscribe to the event log from its resume point,
    /// catch up on membership, and announce the local node.
    pub fn new(id: impl Into<String>, backend: Arc<dyn Backend>, runtime: &Handle) -> Arc<Topic> {
        let id = id.into();
        let event_log = backend.open_event_log(&id);
        let topic = Arc::new(Topic {
            local_node: backend.node_id(),
            id,
            backend,
            event_log,
            state: Mutex::new(TopicState::new()),
            trackers: Mutex::new(HashMap::new()),
            ready: Mutex::new(ReadyState::Pending(Vec::new())),
            log_registration: Mutex::new(None),
            membership_registration: Mutex::new(None),
        });

        let weak = Arc::downgrade(&topic);
        runtime.spawn(async move {
            Topic::bootstrap(weak).await;
        });
        topic
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> Uuid {
        self.local_node
    }

    pub fn is_leader(&self) -> bool {
        self.state().leader
    }

    fn state(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn bootstrap(weak: Weak<Topic>) {
        for attempt in 0..MAX_BOOTSTRAP_ATTEMPTS {
            let Some(topic) = weak.upgrade() else {
                return;
            };

            let snapshot = match topic.backend.load_latest_snapshot(&topic.id).await {
                Ok(snapshot) => snapshot,
                Err(_) => None,
            };
            let since = match snapshot {
                Some(blob) => match TopicSnapshot::from_value(blob) {
                    Ok(snapshot) => {
                        let latest = snapshot.latest;
                        topic.load_snapshot(snapshot);
                        Some(latest)
                    }
                    Err(e) => {
                        warn!("Discarding undecodable snapshot for topic '{}': {}", topic.id, e);
                        None
                    }
                },
                None => None,
            };

            let handler_weak = weak.clone();
            let handler: EventHandler = Arc::new(move |id, payload| {
                if let Some(topic) = handler_weak.upgrade() {
                    topic.handle_log_event(id, payload);
                }
            });

            match topic.event_log.subscribe(since, handler) {
                Ok(registration) => {
                    *topic.log_registration.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(registration);

                    // Membership catch-up runs after the log replay so that
                    // join records of nodes that have already left are
                    // pruned again by the replayed leave events.
                    let leave_weak = weak.clone();
                    let membership = add_membership_listener(
                        &topic.backend.membership_log(),
                        move |event| {
                            if event.kind == MembershipKind::Leave {
                                if let Some(topic) = leave_weak.upgrade() {
                                    topic.handle_node_leave(event.node_id);
                                }
                            }
                        },
                    );
                    *topic
                        .membership_registration
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(membership);

                    let join = Change::NodeJoin {
                        node_id: topic.local_node,
                    };
                    topic.submit(Uuid::new_v4(), &join);
                    topic.mark_ready(true);
                    return;
                }
                Err(e) => {
                    debug!(
                        "Topic '{}' bootstrap attempt {} failed ({}), retrying",
                        topic.id,
                        attempt + 1,
                        e
                    );
                    // Forget the stale snapshot before trying again.
                    topic.reset_state();
                }
            }
        }

        if let Some(topic) = weak.upgrade() {
            error!(
                "Topic '{}' failed to initialize after {} attempts",
                topic.id, MAX_BOOTSTRAP_ATTEMPTS
            );
            topic.mark_ready(false);
        }
    }

    /// Run a callback once bootstrap has finished (immediately if it
    /// already has). The argument is `false` when bootstrap gave up.
    pub fn when_ready(&self, callback: impl FnOnce(bool) + Send + 'static) {
        let state = {
            let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *ready {
                ReadyState::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                ReadyState::Ready => true,
                ReadyState::Failed => false,
            }
        };
        callback(state);
    }

    /// Await bootstrap completion; `false` when it failed.
    pub async fn await_ready(&self) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.when_ready(move |ok| {
            let _ = tx.send(ok);
        });
        rx.await.unwrap_or(false)
    }

    fn mark_ready(&self, ok: bool) {
        let callbacks = {
            let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            let previous = std::mem::replace(
                &mut *ready,
                if ok { ReadyState::Ready } else { ReadyState::Failed },
            );
            match previous {
                ReadyState::Pending(callbacks) => callbacks,
                _ => Vec::new(),
            }
        };
        for callback in callbacks {
            callback(ok);
        }
    }

    fn reset_state(&self) {
        let mut state = self.state();
        state.maps.clear();
        state.lists.clear();
        state.map_timeouts.clear();
        state.list_timeouts.clear();
        state.active_nodes.clear();
        state.backend_nodes.clear();
        state.latest_change_id = None;
    }

    // ---------------------------------------------------------------
    // Subscriptions and result trackers
    // ---------------------------------------------------------------

    /// Register a subscriber for applied changes.
    ///
    /// Subscribers are invoked under the topic lock; a panicking subscriber
    /// is dropped from the list after the others have run. On each new
    /// subscription the leader prunes collections whose idle expiration has
    /// elapsed.
    pub fn subscribe_to_change(self: &Arc<Self>, subscriber: ChangeSubscriber) -> Registration {
        let (subscriber_id, expired) = {
            let mut state = self.state();
            let subscriber_id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push((subscriber_id, subscriber));
            let expired = if state.leader && state.active_nodes.is_empty() {
                self.collect_expired_purge(&state, Instant::now())
            } else {
                Vec::new()
            };
            (subscriber_id, expired)
        };
        for change in expired {
            self.submit(Uuid::new_v4(), &change);
        }

        let weak = Arc::downgrade(self);
        Registration::new(move || {
            if let Some(topic) = weak.upgrade() {
                let mut state = topic.state();
                state.subscribers.retain(|(id, _)| *id != subscriber_id);
            }
        })
    }

    /// Register the callback resolving a submitted change's result.
    ///
    /// Must be set before the change is submitted; it is consumed exactly
    /// once when the change is applied. Registering two trackers for the
    /// same tracking id is a programming error.
    pub fn set_change_result_tracker(
        &self,
        tracking_id: Uuid,
        tracker: impl FnOnce(ChangeResult) + Send + 'static,
    ) {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        let previous = trackers.insert(tracking_id, Box::new(tracker));
        assert!(
            previous.is_none(),
            "Cannot set multiple result trackers for tracking id {}",
            tracking_id
        );
    }

    /// Number of submitted changes still waiting for their result.
    pub fn pending_trackers(&self) -> usize {
        self.trackers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Serialize a change record and append it to the event log.
    pub fn submit(&self, tracking_id: Uuid, change: &Change) {
        let payload = match serde_json::to_value(change) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode change record: {}", e);
                return;
            }
        };
        self.event_log.submit_event(tracking_id, payload);
    }

    // ---------------------------------------------------------------
    // Change application
    // ---------------------------------------------------------------

    fn handle_log_event(&self, id: Uuid, payload: &Value) {
        let change: Change = match serde_json::from_value(payload.clone()) {
            Ok(change) => change,
            Err(e) => {
                warn!("Ignoring malformed change record {}: {}", id, e);
                return;
            }
        };
        self.apply_change(id, &change);
    }

    /// Apply one change record; the single entry point mutating topic data.
    pub fn apply_change(&self, id: Uuid, change: &Change) -> ChangeResult {
        let mut followups: Vec<Change> = Vec::new();
        let mut snapshot_due: Option<TopicSnapshot> = None;

        let result = {
            let mut state = self.state();
            let (result, details) = self.apply_locked(&mut state, id, change, &mut followups);
            state.latest_change_id = Some(id);
            if result == ChangeResult::Accepted && change.is_mutating() {
                state.applied_changes += 1;
                if state.leader && state.applied_changes % SNAPSHOT_EVERY == 0 {
                    snapshot_due = Some(self.build_snapshot(&state, id));
                }
            }
            if let Some(details) = details {
                Self::notify_subscribers(&mut state, id, &details);
            }
            result
        };

        let tracker = {
            let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            trackers.remove(&id)
        };
        if let Some(tracker) = tracker {
            tracker(result);
        }

        for change in followups {
            self.submit(Uuid::new_v4(), &change);
        }

        if let Some(snapshot) = snapshot_due {
            let latest = snapshot.latest;
            debug!(
                "Topic '{}' submitting snapshot at change {}",
                self.id, latest
            );
            drop(self.backend.submit_snapshot(&self.id, snapshot.to_value()));
            self.event_log.truncate(latest);
        }

        result
    }

    fn apply_locked(
        &self,
        state: &mut TopicState,
        id: Uuid,
        change: &Change,
        followups: &mut Vec<Change>,
    ) -> (ChangeResult, Option<ChangeDetails>) {
        match change {
            Change::Put {
                name,
                key,
                expected_id,
                expected_value,
                value,
                scope_owner,
            } => Self::apply_put(
                state,
                id,
                name,
                key,
                *expected_id,
                expected_value.as_ref(),
                value,
                *scope_owner,
            ),
            Change::Replace {
                name,
                key,
                expected_value,
                value,
            } => Self::apply_put(state, id, name, key, None, Some(expected_value), value, None),
            Change::Insert {
                name,
                reference_key,
                before,
                item,
                conditions,
                scope_owner,
            } => {
                let list = state.lists.entry(name.clone()).or_default();
                let all_hold = conditions
                    .iter()
                    .all(|c| list.holds_adjacent(c.left, c.right));
                if !all_hold {
                    return (ChangeResult::Rejected, None);
                }
                match list.insert(id, item.clone(), *reference_key, *before, *scope_owner) {
                    Some((prev, next)) => (
                        ChangeResult::Accepted,
                        Some(ChangeDetails::List(ListChange {
                            name: name.clone(),
                            key: id,
                            old_value: None,
                            new_value: Some(item.clone()),
                            old_prev: None,
                            old_next: None,
                            new_prev: prev,
                            new_next: next,
                            expected_id: None,
                        })),
                    ),
                    None => (ChangeResult::Rejected, None),
                }
            }
            Change::MoveBefore {
                name,
                reference_key,
                key_to_move,
            } => Self::apply_move(state, id, name, *key_to_move, *reference_key, true),
            Change::MoveAfter {
                name,
                reference_key,
                key_to_move,
            } => Self::apply_move(state, id, name, *key_to_move, *reference_key, false),
            Change::ListSet {
                name,
                key,
                value,
                expected_id,
                scope_owner,
            } => Self::apply_list_set(state, id, name, *key, value, *expected_id, *scope_owner),
            Change::MapTimeout { name, value } => {
                Self::apply_timeout(&mut state.map_timeouts, name, value.as_deref());
                (ChangeResult::Accepted, None)
            }
            Change::ListTimeout { name, value } => {
                Self::apply_timeout(&mut state.list_timeouts, name, value.as_deref());
                (ChangeResult::Accepted, None)
            }
            Change::NodeJoin { node_id } => {
                if !state.backend_nodes.contains(node_id) {
                    state.backend_nodes.push(*node_id);
                }
                if !state.leader && state.backend_nodes.first() == Some(&self.local_node) {
                    state.leader = true;
                    debug!("Topic '{}': local node became leader", self.id);
                    followups.extend(Self::collect_orphan_sweep(state));
                }
                (ChangeResult::Accepted, None)
            }
            Change::NodeActivate { node_id } => {
                let was_empty = state.active_nodes.is_empty();
                if was_empty && state.leader {
                    followups.extend(self.collect_expired_purge(state, Instant::now()));
                }
                if !state.active_nodes.contains(node_id) {
                    state.active_nodes.push(*node_id);
                }
                if was_empty {
                    state.last_disconnected = None;
                }
                (ChangeResult::Accepted, None)
            }
            Change::NodeDeactivate { node_id } => {
                let was_empty = state.active_nodes.is_empty();
                state.active_nodes.retain(|n| n != node_id);
                if !was_empty && state.active_nodes.is_empty() {
                    state.last_disconnected = Some(Instant::now());
                }
                (ChangeResult::Accepted, None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_put(
        state: &mut TopicState,
        id: Uuid,
        name: &str,
        key: &str,
        expected_id: Option<Uuid>,
        expected_value: Option<&Value>,
        value: &Value,
        scope_owner: Option<Uuid>,
    ) -> (ChangeResult, Option<ChangeDetails>) {
        let current = state.maps.get(name).and_then(|m| m.entries.get(key));

        if let Some(expected) = expected_id {
            if current.map(|e| e.revision) != Some(expected) {
                return (ChangeResult::Rejected, None);
            }
        }
        if let Some(expected) = expected_value {
            let matches = match current {
                None => expected.is_null(),
                Some(entry) => !expected.is_null() && entry.value == *expected,
            };
            if !matches {
                return (ChangeResult::Rejected, None);
            }
        }

        let old_value = current.map(|e| e.value.clone());
        if value.is_null() {
            if old_value.is_some() {
                if let Some(map) = state.maps.get_mut(name) {
                    map.entries.remove(key);
                    map.order.retain(|k| k != key);
                }
            }
            (
                ChangeResult::Accepted,
                Some(ChangeDetails::Map(MapChange {
                    name: name.to_string(),
                    key: key.to_string(),
                    old_value,
                    new_value: None,
                    expected_id,
                })),
            )
        } else {
            let map = state.maps.entry(name.to_string()).or_default();
            match map.entries.get_mut(key) {
                Some(entry) => {
                    entry.revision = id;
                    entry.value = value.clone();
                    entry.scope_owner = scope_owner;
                }
                None => {
                    map.entries.insert(
                        key.to_string(),
                        MapEntry {
                            revision: id,
                            value: value.clone(),
                            scope_owner,
                        },
                    );
                    map.order.push(key.to_string());
                }
            }
            (
                ChangeResult::Accepted,
                Some(ChangeDetails::Map(MapChange {
                    name: name.to_string(),
                    key: key.to_string(),
                    old_value,
                    new_value: Some(value.clone()),
                    expected_id,
                })),
            )
        }
    }

    fn apply_move(
        state: &mut TopicState,
        id: Uuid,
        name: &str,
        key_to_move: Uuid,
        reference: Uuid,
        before: bool,
    ) -> (ChangeResult, Option<ChangeDetails>) {
        let Some(list) = state.lists.get_mut(name) else {
            return (ChangeResult::Rejected, None);
        };
        let outcome = if before {
            list.move_before(key_to_move, reference, id)
        } else {
            list.move_after(key_to_move, reference, id)
        };
        match outcome {
            Some(outcome) => {
                let value = list.get(key_to_move).map(|e| e.value.clone());
                (
                    ChangeResult::Accepted,
                    Some(ChangeDetails::List(ListChange {
                        name: name.to_string(),
                        key: key_to_move,
                        old_value: value.clone(),
                        new_value: value,
                        old_prev: outcome.old_prev,
                        old_next: outcome.old_next,
                        new_prev: outcome.new_prev,
                        new_next: outcome.new_next,
                        expected_id: None,
                    })),
                )
            }
            None => (ChangeResult::Rejected, None),
        }
    }

    fn apply_list_set(
        state: &mut TopicState,
        id: Uuid,
        name: &str,
        key: Uuid,
        value: &Value,
        expected_id: Option<Uuid>,
        scope_owner: Option<Uuid>,
    ) -> (ChangeResult, Option<ChangeDetails>) {
        let Some(list) = state.lists.get_mut(name) else {
            return (ChangeResult::Rejected, None);
        };
        let Some(entry) = list.get(key) else {
            // Also covers removal of an already-absent key.
            return (ChangeResult::Rejected, None);
        };
        if let Some(expected) = expected_id {
            if entry.revision != expected {
                return (ChangeResult::Rejected, None);
            }
        }

        let old_value = entry.value.clone();
        if value.is_null() {
            let removed = match list.remove(key) {
                Some(entry) => entry,
                None => return (ChangeResult::Rejected, None),
            };
            (
                ChangeResult::Accepted,
                Some(ChangeDetails::List(ListChange {
                    name: name.to_string(),
                    key,
                    old_value: Some(old_value),
                    new_value: None,
                    old_prev: removed.prev,
                    old_next: removed.next,
                    new_prev: None,
                    new_next: None,
                    expected_id,
                })),
            )
        } else {
            let (prev, next) = (entry.prev, entry.next);
            list.set_value(key, value.clone(), id, scope_owner);
            (
                ChangeResult::Accepted,
                Some(ChangeDetails::List(ListChange {
                    name: name.to_string(),
                    key,
                    old_value: Some(old_value),
                    new_value: Some(value.clone()),
                    old_prev: prev,
                    old_next: next,
                    new_prev: prev,
                    new_next: next,
                    expected_id,
                })),
            )
        }
    }

    fn apply_timeout(
        timeouts: &mut HashMap<String, std::time::Duration>,
        name: &str,
        value: Option<&str>,
    ) {
        match value {
            Some(iso) => match duration_from_iso(iso) {
                Some(duration) => {
                    timeouts.insert(name.to_string(), duration);
                }
                None => {
                    warn!("Ignoring invalid expiration timeout '{}' for '{}'", iso, name);
                }
            },
            None => {
                timeouts.remove(name);
            }
        }
    }

    /// Fan out one applied change; a panicking subscriber is removed and the
    /// first panic resumed after the remaining subscribers have run.
    fn notify_subscribers(state: &mut TopicState, id: Uuid, details: &ChangeDetails) {
        state.delivery_seq += 1;
        let seq = state.delivery_seq;
        let snapshot: Vec<(u64, ChangeSubscriber)> = state.subscribers.clone();
        let mut failed: Vec<u64> = Vec::new();
        let mut panics = Vec::new();
        for (subscriber_id, subscriber) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber(id, seq, details)));
            if let Err(panic) = outcome {
                failed.push(subscriber_id);
                panics.push(panic);
            }
        }
        if !failed.is_empty() {
            warn!("Removing {} failed topic subscriber(s)", failed.len());
            state
                .subscribers
                .retain(|(subscriber_id, _)| !failed.contains(subscriber_id));
        }
        if let Some(first) = panics.into_iter().next() {
            resume_unwind(first);
        }
    }

    // ---------------------------------------------------------------
    // Membership, sweeps, and expiration
    // ---------------------------------------------------------------

    /// React to a node leaving the cluster: prune it from the node sets and,
    /// when this node leads (possibly as of now), emit compensating changes
    /// removing every entry the departed node owned.
    pub fn handle_node_leave(&self, node_id: Uuid) {
        let followups = {
            let mut state = self.state();
            state.backend_nodes.retain(|n| *n != node_id);
            let was_empty = state.active_nodes.is_empty();
            state.active_nodes.retain(|n| *n != node_id);
            if !was_empty && state.active_nodes.is_empty() {
                state.last_disconnected = Some(Instant::now());
            }

            // Leadership is monotonic until the local node itself leaves.
            if node_id == self.local_node {
                state.leader = false;
            }

            if !state.leader
                && !state.backend_nodes.is_empty()
                && state.backend_nodes.first() == Some(&self.local_node)
            {
                state.leader = true;
                debug!(
                    "Topic '{}': local node became leader after {} left",
                    self.id, node_id
                );
            }

            if state.leader {
                Self::collect_scope_sweep(&state, |owner| owner == node_id)
            } else {
                Vec::new()
            }
        };
        for change in followups {
            self.submit(Uuid::new_v4(), &change);
        }
    }

    /// Compensating changes for every entry owned by a matching scope owner.
    fn collect_scope_sweep(
        state: &TopicState,
        matches: impl Fn(Uuid) -> bool,
    ) -> Vec<Change> {
        let mut changes = Vec::new();
        for (name, map) in &state.maps {
            for key in &map.order {
                if let Some(entry) = map.entries.get(key) {
                    if entry.scope_owner.map(&matches).unwrap_or(false) {
                        changes.push(Change::Put {
                            name: name.clone(),
                            key: key.clone(),
                            expected_id: Some(entry.revision),
                            expected_value: None,
                            value: Value::Null,
                            scope_owner: None,
                        });
                    }
                }
            }
        }
        for (name, list) in &state.lists {
            for (key, entry) in list.iter() {
                if entry.scope_owner.map(&matches).unwrap_or(false) {
                    changes.push(Change::ListSet {
                        name: name.clone(),
                        key,
                        value: Value::Null,
                        expected_id: Some(entry.revision),
                        scope_owner: None,
                    });
                }
            }
        }
        changes
    }

    /// Sweep for entries whose owner is no longer a backend node.
    fn collect_orphan_sweep(state: &TopicState) -> Vec<Change> {
        let nodes = state.backend_nodes.clone();
        Self::collect_scope_sweep(state, move |owner| !nodes.contains(&owner))
    }

    /// Removal changes for every collection whose idle expiration elapsed.
    fn collect_expired_purge(&self, state: &TopicState, now: Instant) -> Vec<Change> {
        let Some(idle_since) = state.last_disconnected else {
            return Vec::new();
        };
        let mut changes = Vec::new();
        for (name, timeout) in &state.map_timeouts {
            if idle_since + *timeout <= now {
                if let Some(map) = state.maps.get(name) {
                    for key in &map.order {
                        if let Some(entry) = map.entries.get(key) {
                            changes.push(Change::Put {
                                name: name.clone(),
                                key: key.clone(),
                                expected_id: Some(entry.revision),
                                expected_value: None,
                                value: Value::Null,
                                scope_owner: None,
                            });
                        }
                    }
                }
            }
        }
        for (name, timeout) in &state.list_timeouts {
            if idle_since + *timeout <= now {
                if let Some(list) = state.lists.get(name) {
                    for (key, entry) in list.iter() {
                        changes.push(Change::ListSet {
                            name: name.clone(),
                            key,
                            value: Value::Null,
                            expected_id: Some(entry.revision),
                            scope_owner: None,
                        });
                    }
                }
            }
        }
        if !changes.is_empty() {
            debug!(
                "Topic '{}': expiring {} idle entries",
                self.id,
                changes.len()
            );
        }
        changes
    }

    // ---------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------

    fn build_snapshot(&self, state: &TopicState, latest: Uuid) -> TopicSnapshot {
        let maps = state
            .maps
            .iter()
            .map(|(name, map)| {
                let entries = map
                    .order
                    .iter()
                    .filter_map(|key| {
                        map.entries.get(key).map(|entry| MapEntrySnapshot {
                            key: key.clone(),
                            revision: entry.revision,
                            value: entry.value.clone(),
                            scope_owner: entry.scope_owner,
                        })
                    })
                    .collect();
                (name.clone(), entries)
            })
            .collect();
        let lists = state
            .lists
            .iter()
            .map(|(name, list)| {
                let entries = list
                    .iter()
                    .map(|(id, entry)| ListEntrySnapshot {
                        id,
                        revision: entry.revision,
                        value: entry.value.clone(),
                        scope_owner: entry.scope_owner,
                    })
                    .collect();
                (name.clone(), entries)
            })
            .collect();
        TopicSnapshot {
            latest,
            lists,
            maps,
            list_timeouts: state
                .list_timeouts
                .iter()
                .map(|(name, d)| (name.clone(), duration_to_iso(*d)))
                .collect(),
            map_timeouts: state
                .map_timeouts
                .iter()
                .map(|(name, d)| (name.clone(), duration_to_iso(*d)))
                .collect(),
            active_nodes: state.active_nodes.clone(),
            backend_nodes: state.backend_nodes.clone(),
        }
    }

    /// Materialize a snapshot into this topic. Loading into a topic that
    /// already holds data is a programming error.
    pub fn load_snapshot(&self, snapshot: TopicSnapshot) {
        let mut state = self.state();
        assert!(
            !state.has_data(),
            "Cannot load a snapshot into a non-empty topic"
        );
        for (name, entries) in snapshot.maps {
            let map = state.maps.entry(name).or_default();
            for entry in entries {
                map.order.push(entry.key.clone());
                map.entries.insert(
                    entry.key,
                    MapEntry {
                        revision: entry.revision,
                        value: entry.value,
                        scope_owner: entry.scope_owner,
                    },
                );
            }
        }
        for (name, entries) in snapshot.lists {
            let list = state.lists.entry(name).or_default();
            for entry in entries {
                list.push_back_restored(entry.id, entry.value, entry.revision, entry.scope_owner);
            }
        }
        state.map_timeouts = snapshot
            .map_timeouts
            .iter()
            .filter_map(|(name, iso)| duration_from_iso(iso).map(|d| (name.clone(), d)))
            .collect();
        state.list_timeouts = snapshot
            .list_timeouts
            .iter()
            .filter_map(|(name, iso)| duration_from_iso(iso).map(|d| (name.clone(), d)))
            .collect();
        state.active_nodes = snapshot.active_nodes;
        state.backend_nodes = snapshot.backend_nodes;
        state.latest_change_id = Some(snapshot.latest);
        state.leader = state.backend_nodes.first() == Some(&self.local_node);
    }

    /// Snapshot of the current state, for tests and diagnostics.
    pub fn current_snapshot(&self) -> Option<TopicSnapshot> {
        let state = self.state();
        state
            .latest_change_id
            .map(|latest| self.build_snapshot(&state, latest))
    }

    // ---------------------------------------------------------------
    // Reads (deep copies taken under the topic lock)
    // ---------------------------------------------------------------

    pub fn map_value(&self, name: &str, key: &str) -> Option<Value> {
        let state = self.state();
        state
            .maps
            .get(name)
            .and_then(|m| m.entries.get(key))
            .map(|e| e.value.clone())
    }

    pub fn map_keys(&self, name: &str) -> Vec<String> {
        let state = self.state();
        state.maps.get(name).map(|m| m.order.clone()).unwrap_or_default()
    }

    /// Entries of a named map in key insertion order.
    pub fn map_entries(&self, name: &str) -> Vec<(String, Value)> {
        self.map_catch_up(name).0
    }

    /// Map entries plus the delivery sequence they are current as of, read
    /// atomically for subscribe catch-up.
    pub fn map_catch_up(&self, name: &str) -> (Vec<(String, Value)>, u64) {
        let state = self.state();
        let entries = match state.maps.get(name) {
            Some(map) => map
                .order
                .iter()
                .filter_map(|key| {
                    map.entries
                        .get(key)
                        .map(|entry| (key.clone(), entry.value.clone()))
                })
                .collect(),
            None => Vec::new(),
        };
        (entries, state.delivery_seq)
    }

    pub fn list_value(&self, name: &str, key: Uuid) -> Option<Value> {
        let state = self.state();
        state
            .lists
            .get(name)
            .and_then(|l| l.get(key))
            .map(|e| e.value.clone())
    }

    pub fn list_keys(&self, name: &str) -> Vec<Uuid> {
        let state = self.state();
        state.lists.get(name).map(|l| l.keys()).unwrap_or_default()
    }

    /// Entries of a named list in head-to-tail order.
    pub fn list_entries(&self, name: &str) -> Vec<(Uuid, Value)> {
        self.list_catch_up(name).0
    }

    /// List entries plus the delivery sequence they are current as of, read
    /// atomically for subscribe catch-up.
    pub fn list_catch_up(&self, name: &str) -> (Vec<(Uuid, Value)>, u64) {
        let state = self.state();
        let entries = match state.lists.get(name) {
            Some(list) => list
                .iter()
                .map(|(key, entry)| (key, entry.value.clone()))
                .collect(),
            None => Vec::new(),
        };
        (entries, state.delivery_seq)
    }

    pub fn map_timeout(&self, name: &str) -> Option<std::time::Duration> {
        self.state().map_timeouts.get(name).copied()
    }

    pub fn list_timeout(&self, name: &str) -> Option<std::time::Duration> {
        self.state().list_timeouts.get(name).copied()
    }

    pub fn backend_nodes(&self) -> Vec<Uuid> {
        self.state().backend_nodes.clone()
    }

    pub fn active_nodes(&self) -> Vec<Uuid> {
        self.state().active_nodes.clone()
    }
}
