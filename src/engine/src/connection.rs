//! Topic connections: the per-consumer handle mediating reads, authored
//! mutations, subscriptions, and connection-scoped entry cleanup.

use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use backend::Registration;
use topic::{
    AdjacencyCondition, Change, ChangeDetails, ChangeResult, ChangeSubscriber, ListChange,
    MapChange, Topic,
};

use crate::context::{ActionDispatcher, ActivationHandler, ConnectionContext};
use crate::executor::Executor;
use crate::user::UserInfo;

/// Visibility and lifetime of a written entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryScope {
    /// The entry persists until explicitly removed or expired.
    #[default]
    Topic,
    /// The entry is removed when the writing connection deactivates or its
    /// node leaves the cluster.
    Connection,
}

/// Stable key of a list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListKey(pub Uuid);

/// One observed transition of a map key.
#[derive(Debug, Clone, PartialEq)]
pub struct MapChangeEvent {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangeKind {
    Insert,
    Set,
    Move,
    Remove,
}

/// One observed transition of a list entry, with enough neighbor context to
/// mirror the list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListChangeEvent {
    pub kind: ListChangeKind,
    pub key: ListKey,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub old_prev: Option<ListKey>,
    pub old_next: Option<ListKey>,
    pub new_prev: Option<ListKey>,
    pub new_next: Option<ListKey>,
}

impl ListChangeEvent {
    fn from_change(change: &ListChange) -> Self {
        let kind = if change.old_value.is_none() {
            ListChangeKind::Insert
        } else if change.new_value.is_none() {
            ListChangeKind::Remove
        } else if (change.old_prev, change.old_next) != (change.new_prev, change.new_next) {
            ListChangeKind::Move
        } else {
            ListChangeKind::Set
        };
        ListChangeEvent {
            kind,
            key: ListKey(change.key),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            old_prev: change.old_prev.map(ListKey),
            old_next: change.old_next.map(ListKey),
            new_prev: change.new_prev.map(ListKey),
            new_next: change.new_next.map(ListKey),
        }
    }
}

/// Result of a list insert: the new entry's key plus the future resolving
/// once the insert was applied (`false` when a condition rejected it).
pub struct ListInsertResult {
    pub key: ListKey,
    pub completion: oneshot::Receiver<bool>,
}

enum InsertPosition {
    Last,
    First,
    Before(ListKey),
    After(ListKey),
}

/// Builder describing a list insert: position, scope, and adjacency
/// conditions that must hold atomically when the insert is applied.
pub struct ListOperation {
    value: Value,
    position: InsertPosition,
    scope: EntryScope,
    conditions: Vec<(Option<ListKey>, Option<ListKey>)>,
}

impl ListOperation {
    pub fn insert_last(value: Value) -> Self {
        Self::at(value, InsertPosition::Last)
    }

    pub fn insert_first(value: Value) -> Self {
        Self::at(value, InsertPosition::First)
    }

    pub fn insert_before(key: ListKey, value: Value) -> Self {
        Self::at(value, InsertPosition::Before(key))
    }

    pub fn insert_after(key: ListKey, value: Value) -> Self {
        Self::at(value, InsertPosition::After(key))
    }

    /// Insert between two existing neighbors (`None` meaning the head or
    /// tail boundary), requiring them to still be adjacent when applied.
    pub fn insert_between(prev: Option<ListKey>, next: Option<ListKey>, value: Value) -> Self {
        let position = match (prev, next) {
            (_, Some(next)) => InsertPosition::Before(next),
            (Some(prev), None) => InsertPosition::After(prev),
            (None, None) => InsertPosition::Last,
        };
        let mut operation = Self::at(value, position);
        operation.conditions.push((prev, next));
        operation
    }

    pub fn with_scope(mut self, scope: EntryScope) -> Self {
        self.scope = scope;
        self
    }

    /// Require `right` to be the immediate successor of `left` when the
    /// operation is applied.
    pub fn if_adjacent(mut self, left: Option<ListKey>, right: Option<ListKey>) -> Self {
        self.conditions.push((left, right));
        self
    }

    fn at(value: Value, position: InsertPosition) -> Self {
        ListOperation {
            value,
            position,
            scope: EntryScope::Topic,
            conditions: Vec::new(),
        }
    }

    fn into_change(self, name: &str, scope_owner: Option<Uuid>) -> Change {
        let (reference_key, before) = match self.position {
            InsertPosition::Last => (None, true),
            InsertPosition::First => (None, false),
            InsertPosition::Before(key) => (Some(key.0), true),
            InsertPosition::After(key) => (Some(key.0), false),
        };
        Change::Insert {
            name: name.to_string(),
            reference_key,
            before,
            item: self.value,
            conditions: self
                .conditions
                .iter()
                .map(|(left, right)| AdjacencyCondition {
                    left: left.map(|k| k.0),
                    right: right.map(|k| k.0),
                })
                .collect(),
            scope_owner,
        }
    }
}

type MapSubscriberFn = Arc<Mutex<Box<dyn FnMut(MapChangeEvent) + Send>>>;
type ListSubscriberFn = Arc<Mutex<Box<dyn FnMut(ListChangeEvent) + Send>>>;
type TopicActivationHandler = Box<dyn Fn(bool) + Send + Sync>;
type ActivationCallback = Box<dyn Fn(&TopicConnection) -> Option<Registration> + Send + Sync>;

struct MapSubscriberEntry {
    id: u64,
    /// Delivery sequence this subscriber's catch-up is current as of;
    /// `u64::MAX` until the catch-up action has run.
    from_seq: u64,
    handler: MapSubscriberFn,
}

struct ListSubscriberEntry {
    id: u64,
    from_seq: u64,
    handler: ListSubscriberFn,
}

struct ConnectionState {
    dispatcher: Option<ActionDispatcher>,
    close_registration: Option<Registration>,
    deactivate_registrations: Vec<Registration>,
    map_subscribers: HashMap<String, Vec<MapSubscriberEntry>>,
    list_subscribers: HashMap<String, Vec<ListSubscriberEntry>>,
    scoped_map_keys: HashMap<String, HashMap<String, Uuid>>,
    scoped_list_keys: HashMap<String, HashMap<Uuid, Uuid>>,
    next_subscriber: u64,
}

pub(crate) struct ConnectionInner {
    topic: Arc<Topic>,
    user: UserInfo,
    topic_activation_handler: TopicActivationHandler,
    activation_callback: ActivationCallback,
    /// Whether activation has happened, which is not the same as being
    /// active: the dispatcher is installed by an asynchronous action that
    /// may still be queued.
    activated: AtomicBool,
    cleanup_pending: AtomicBool,
    state: Mutex<ConnectionState>,
}

/// A per-consumer handle onto one topic.
///
/// Moves through created → active → deactivated → closed, driven by its
/// connection context. Reads copy state under the topic lock; writes submit
/// change records and resolve their futures on the context's dispatcher.
#[derive(Clone)]
pub struct TopicConnection {
    inner: Arc<ConnectionInner>,
}

impl TopicConnection {
    pub(crate) fn open(
        context: &dyn ConnectionContext,
        topic: Arc<Topic>,
        user: UserInfo,
        topic_activation_handler: TopicActivationHandler,
        activation_callback: ActivationCallback,
        executor: &Executor,
    ) -> TopicConnection {
        let inner = Arc::new(ConnectionInner {
            topic,
            user,
            topic_activation_handler,
            activation_callback,
            activated: AtomicBool::new(false),
            cleanup_pending: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                dispatcher: None,
                close_registration: None,
                deactivate_registrations: Vec::new(),
                map_subscribers: HashMap::new(),
                list_subscribers: HashMap::new(),
                scoped_map_keys: HashMap::new(),
                scoped_list_keys: HashMap::new(),
                next_subscriber: 0,
            }),
        });

        let weak = Arc::downgrade(&inner);
        let handler: ActivationHandler = Arc::new(move |dispatcher| {
            if let Some(inner) = weak.upgrade() {
                ConnectionInner::accept_dispatcher(&inner, dispatcher);
            }
        });
        let close_registration = context.init(handler, executor);
        inner.state().close_registration = Some(close_registration);

        TopicConnection { inner }
    }

    /// The user this connection acts for.
    pub fn user_info(&self) -> &UserInfo {
        &self.inner.user
    }

    /// The topic this connection is attached to.
    pub fn topic(&self) -> &Arc<Topic> {
        &self.inner.topic
    }

    /// A named map of this connection's topic.
    pub fn named_map(&self, name: impl Into<String>) -> NamedMap {
        self.inner.ensure_active();
        NamedMap {
            name: name.into(),
            connection: self.clone(),
        }
    }

    /// A named list of this connection's topic.
    pub fn named_list(&self, name: impl Into<String>) -> NamedList {
        self.inner.ensure_active();
        NamedList {
            name: name.into(),
            connection: self.clone(),
        }
    }

    pub(crate) fn deactivate_and_close(&self) {
        self.inner.deactivate_and_close();
    }
}

impl ConnectionInner {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_active(&self) {
        assert!(
            self.state().dispatcher.is_some(),
            "Cannot perform this operation on a connection that is inactive \
             or about to become inactive"
        );
    }

    fn dispatcher(&self) -> ActionDispatcher {
        self.state()
            .dispatcher
            .clone()
            .expect(
                "Cannot perform this operation on a connection that is inactive \
                 or about to become inactive",
            )
    }

    /// The context's activation transitions. Consecutive same-state calls
    /// are contract violations; a queued transition whose precondition no
    /// longer holds when its dispatch runs exits without effect.
    fn accept_dispatcher(inner: &Arc<Self>, dispatcher: Option<ActionDispatcher>) {
        match dispatcher {
            Some(dispatcher) => {
                let was_activated = inner.activated.swap(true, Ordering::SeqCst);
                assert!(!was_activated, "The topic connection is already active");

                if inner.state().dispatcher.is_some() {
                    // Deactivation has been triggered but its dispatch has
                    // not run yet; the flag cancels it, so nothing needs to
                    // be activated again.
                    return;
                }

                let activation = Arc::clone(inner);
                inner.topic.when_ready(move |ok| {
                    if !ok {
                        warn!("Dropping connection activation: topic failed to initialize");
                        return;
                    }
                    let run_on = dispatcher.clone();
                    let run = Arc::clone(&activation);
                    run_on.dispatch(move || run.run_activation(dispatcher.clone()));
                });
            }
            None => {
                let was_activated = inner.activated.swap(false, Ordering::SeqCst);
                assert!(was_activated, "The topic connection is already inactive");

                let dispatcher = match inner.state().dispatcher.clone() {
                    Some(dispatcher) => dispatcher,
                    // Activation has been triggered but its dispatch has
                    // not run yet; the flag cancels it.
                    None => return,
                };
                let run = Arc::clone(inner);
                dispatcher.dispatch(move || run.run_deactivation());
            }
        }
    }

    fn run_activation(self: &Arc<Self>, dispatcher: ActionDispatcher) {
        if !self.activated.load(Ordering::SeqCst) {
            // Activation canceled while waiting for dispatch.
            return;
        }
        {
            let mut state = self.state();
            if state.dispatcher.is_some() {
                return;
            }
            state.dispatcher = Some(dispatcher);
        }
        self.cleanup_pending.store(true, Ordering::SeqCst);
        (self.topic_activation_handler)(true);

        let weak = Arc::downgrade(self);
        let subscriber: ChangeSubscriber = Arc::new(move |id, seq, details| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Dispatch only while still active.
            let Some(dispatcher) = inner.state().dispatcher.clone() else {
                return;
            };
            let details = details.clone();
            let handle = Arc::clone(&inner);
            dispatcher.dispatch(move || handle.handle_change(id, seq, &details));
        });
        let change_registration = self.topic.subscribe_to_change(subscriber);

        let connection = TopicConnection {
            inner: Arc::clone(self),
        };
        let callback_registration = (self.activation_callback)(&connection);

        let mut state = self.state();
        state.deactivate_registrations.push(change_registration);
        if let Some(registration) = callback_registration {
            state.deactivate_registrations.push(registration);
        }
    }

    fn run_deactivation(self: &Arc<Self>) {
        if self.activated.load(Ordering::SeqCst) {
            // Deactivation canceled while waiting for dispatch.
            return;
        }
        if self.state().dispatcher.take().is_none() {
            // Already torn down by a direct close.
            return;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| self.deactivate()));
        (self.topic_activation_handler)(false);
        if let Err(panic) = outcome {
            self.close_without_deactivating();
            resume_unwind(panic);
        }
    }

    /// Scoped-entry cleanup plus removal of everything registered during
    /// activation. Runs before the deactivation is reported externally.
    fn deactivate(&self) {
        self.cleanup_scoped_data();
        let registrations = {
            let mut state = self.state();
            std::mem::take(&mut state.deactivate_registrations)
        };
        let mut panics = Vec::new();
        for registration in registrations {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| registration.remove())) {
                panics.push(panic);
            }
        }
        if let Some(first) = panics.into_iter().next() {
            resume_unwind(first);
        }
    }

    fn deactivate_and_close(self: &Arc<Self>) {
        let had_dispatcher = self.state().dispatcher.take().is_some();
        self.activated.store(false, Ordering::SeqCst);

        let outcome = if had_dispatcher {
            let result = catch_unwind(AssertUnwindSafe(|| self.deactivate()));
            (self.topic_activation_handler)(false);
            result
        } else {
            Ok(())
        };
        self.close_without_deactivating();
        if let Err(panic) = outcome {
            resume_unwind(panic);
        }
    }

    fn close_without_deactivating(&self) {
        let registration = self.state().close_registration.take();
        if let Some(registration) = registration {
            registration.remove();
        }
    }

    /// Emit compensating removals for every connection-scoped entry this
    /// connection wrote.
    fn cleanup_scoped_data(&self) {
        let mut changes: Vec<Change> = Vec::new();
        {
            let mut state = self.state();
            for (name, keys) in std::mem::take(&mut state.scoped_map_keys) {
                for (key, id) in keys {
                    changes.push(Change::Put {
                        name: name.clone(),
                        key,
                        expected_id: Some(id),
                        expected_value: None,
                        value: Value::Null,
                        scope_owner: None,
                    });
                }
            }
            for (name, keys) in std::mem::take(&mut state.scoped_list_keys) {
                for (key, id) in keys {
                    changes.push(Change::ListSet {
                        name: name.clone(),
                        key,
                        value: Value::Null,
                        expected_id: Some(id),
                        scope_owner: None,
                    });
                }
            }
        }
        self.cleanup_pending.store(false, Ordering::SeqCst);
        for change in changes {
            self.topic.submit(Uuid::new_v4(), &change);
        }
    }

    fn record_scoped_map_key(&self, name: &str, key: &str, id: Uuid) {
        {
            let mut state = self.state();
            state
                .scoped_map_keys
                .entry(name.to_string())
                .or_default()
                .insert(key.to_string(), id);
        }
        if !self.cleanup_pending.load(Ordering::SeqCst) {
            // The result arrived after deactivation cleanup already ran;
            // remove the straggler right away.
            self.cleanup_scoped_data();
        }
    }

    fn record_scoped_list_key(&self, name: &str, key: Uuid, id: Uuid) {
        {
            let mut state = self.state();
            state
                .scoped_list_keys
                .entry(name.to_string())
                .or_default()
                .insert(key, id);
        }
        if !self.cleanup_pending.load(Ordering::SeqCst) {
            self.cleanup_scoped_data();
        }
    }

    /// Process one applied change on the dispatcher thread. A panic in a
    /// user handler deactivates and closes the connection, then resumes.
    fn handle_change(self: &Arc<Self>, id: Uuid, seq: u64, details: &ChangeDetails) {
        let outcome = catch_unwind(AssertUnwindSafe(|| match details {
            ChangeDetails::Map(change) => self.handle_map_change(id, seq, change),
            ChangeDetails::List(change) => self.handle_list_change(id, seq, change),
        }));
        if let Err(panic) = outcome {
            self.deactivate_and_close();
            resume_unwind(panic);
        }
    }

    fn handle_map_change(&self, id: Uuid, seq: u64, change: &MapChange) {
        let subscribers = {
            let mut state = self.state();
            // A connection-scoped entry overwritten by someone else no
            // longer needs cleanup, unless this is our own compensating
            // removal still in flight.
            if let Some(keys) = state.scoped_map_keys.get_mut(&change.name) {
                if let Some(&recorded) = keys.get(&change.key) {
                    if recorded != id && change.expected_id != Some(recorded) {
                        keys.remove(&change.key);
                    }
                }
            }
            if change.has_changes() {
                collect_map_subscribers(&state, &change.name, seq)
            } else {
                Vec::new()
            }
        };
        let event = MapChangeEvent {
            key: change.key.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
        };
        for handler in subscribers {
            let mut handler = handler.lock().unwrap_or_else(|e| e.into_inner());
            (handler)(event.clone());
        }
    }

    fn handle_list_change(&self, id: Uuid, seq: u64, change: &ListChange) {
        let subscribers = {
            let mut state = self.state();
            if let Some(keys) = state.scoped_list_keys.get_mut(&change.name) {
                if let Some(&recorded) = keys.get(&change.key) {
                    if recorded != id && change.expected_id != Some(recorded) {
                        keys.remove(&change.key);
                    }
                }
            }
            collect_list_subscribers(&state, &change.name, seq)
        };
        let event = ListChangeEvent::from_change(change);
        for handler in subscribers {
            let mut handler = handler.lock().unwrap_or_else(|e| e.into_inner());
            (handler)(event.clone());
        }
    }

    fn add_registration(&self, registration: Registration) {
        self.state().deactivate_registrations.push(registration);
    }
}

fn collect_map_subscribers(
    state: &ConnectionState,
    name: &str,
    seq: u64,
) -> Vec<MapSubscriberFn> {
    state
        .map_subscribers
        .get(name)
        .map(|subscribers| {
            subscribers
                .iter()
                .filter(|s| seq > s.from_seq)
                .map(|s| Arc::clone(&s.handler))
                .collect()
        })
        .unwrap_or_default()
}

fn collect_list_subscribers(
    state: &ConnectionState,
    name: &str,
    seq: u64,
) -> Vec<ListSubscriberFn> {
    state
        .list_subscribers
        .get(name)
        .map(|subscribers| {
            subscribers
                .iter()
                .filter(|s| seq > s.from_seq)
                .map(|s| Arc::clone(&s.handler))
                .collect()
        })
        .unwrap_or_default()
}

/// Shared multi-value store of one topic, keyed by strings.
pub struct NamedMap {
    name: String,
    connection: TopicConnection,
}

impl NamedMap {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &TopicConnection {
        &self.connection
    }

    /// Current value of a key, or `None` when absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.connection.inner.ensure_active();
        self.connection.inner.topic.map_value(&self.name, key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.connection.inner.ensure_active();
        self.connection.inner.topic.map_keys(&self.name)
    }

    /// Write a value; `Value::Null` removes the key. The future resolves on
    /// the connection's dispatcher once the change was applied everywhere
    /// this node can observe.
    pub fn put(&self, key: &str, value: Value, scope: EntryScope) -> oneshot::Receiver<()> {
        let inner = Arc::clone(&self.connection.inner);
        let dispatcher = inner.dispatcher();
        let (completer, receiver) = dispatcher.create_completable::<()>();

        let connection_scope = scope == EntryScope::Connection;
        let change = Change::Put {
            name: self.name.clone(),
            key: key.to_string(),
            expected_id: None,
            expected_value: None,
            value,
            scope_owner: connection_scope.then(|| inner.topic.node_id()),
        };

        let id = Uuid::new_v4();
        let name = self.name.clone();
        let key = key.to_string();
        let tracked = Arc::clone(&inner);
        inner.topic.set_change_result_tracker(id, move |result| {
            if connection_scope && result == ChangeResult::Accepted {
                tracked.record_scoped_map_key(&name, &key, id);
            }
            completer.complete(());
        });
        inner.topic.submit(id, &change);
        receiver
    }

    /// Compare-and-set on the current value; `Value::Null` as the expected
    /// value means "expect the key absent", as the new value it removes.
    pub fn replace(
        &self,
        key: &str,
        expected_value: Value,
        new_value: Value,
    ) -> oneshot::Receiver<bool> {
        let inner = Arc::clone(&self.connection.inner);
        let dispatcher = inner.dispatcher();
        let (completer, receiver) = dispatcher.create_completable::<bool>();

        let change = Change::Replace {
            name: self.name.clone(),
            key: key.to_string(),
            expected_value,
            value: new_value,
        };

        let id = Uuid::new_v4();
        inner.topic.set_change_result_tracker(id, move |result| {
            completer.complete(result == ChangeResult::Accepted);
        });
        inner.topic.submit(id, &change);
        receiver
    }

    /// Subscribe to changes of this map. One synthetic event per current
    /// entry (in insertion order) is delivered first, then the live stream
    /// follows without loss or duplication.
    pub fn subscribe(
        &self,
        handler: impl FnMut(MapChangeEvent) + Send + 'static,
    ) -> Registration {
        let inner = Arc::clone(&self.connection.inner);
        let handler: MapSubscriberFn = Arc::new(Mutex::new(Box::new(handler)));
        let (subscriber_id, dispatcher) = {
            let mut state = inner.state();
            let dispatcher = state
                .dispatcher
                .clone()
                .expect("Cannot subscribe on an inactive connection");
            let subscriber_id = state.next_subscriber;
            state.next_subscriber += 1;
            state
                .map_subscribers
                .entry(self.name.clone())
                .or_default()
                .push(MapSubscriberEntry {
                    id: subscriber_id,
                    from_seq: u64::MAX,
                    handler: Arc::clone(&handler),
                });
            (subscriber_id, dispatcher)
        };

        // The catch-up runs on the dispatcher so it cannot interleave with
        // change deliveries already queued for this connection.
        let name = self.name.clone();
        let catch_up = Arc::clone(&inner);
        dispatcher.dispatch(move || {
            let (entries, seq) = catch_up.topic.map_catch_up(&name);
            {
                let mut state = catch_up.state();
                let Some(subscribers) = state.map_subscribers.get_mut(&name) else {
                    return;
                };
                match subscribers.iter_mut().find(|s| s.id == subscriber_id) {
                    Some(subscriber) => subscriber.from_seq = seq,
                    // Unsubscribed before the catch-up ran.
                    None => return,
                }
            }
            let mut handler = handler.lock().unwrap_or_else(|e| e.into_inner());
            for (key, value) in entries {
                (handler)(MapChangeEvent {
                    key,
                    old_value: None,
                    new_value: Some(value),
                });
            }
        });

        let name = self.name.clone();
        let unsubscribe = Arc::clone(&inner);
        let registration = Registration::new(move || {
            let mut state = unsubscribe.state();
            if let Some(subscribers) = state.map_subscribers.get_mut(&name) {
                subscribers.retain(|s| s.id != subscriber_id);
                if subscribers.is_empty() {
                    state.map_subscribers.remove(&name);
                }
            }
        });
        inner.add_registration(registration.clone());
        registration
    }

    /// The idle-expiration timeout configured for this map, if any.
    pub fn expiration_timeout(&self) -> Option<std::time::Duration> {
        self.connection.inner.topic.map_timeout(&self.name)
    }

    /// Set (`Some`) or clear (`None`) this map's idle-expiration timeout.
    pub fn set_expiration_timeout(&self, timeout: Option<std::time::Duration>) {
        let inner = &self.connection.inner;
        let change = Change::MapTimeout {
            name: self.name.clone(),
            value: timeout.map(topic::json::duration_to_iso),
        };
        inner.topic.submit(Uuid::new_v4(), &change);
    }
}

/// Shared ordered collection of one topic.
pub struct NamedList {
    name: String,
    connection: TopicConnection,
}

impl NamedList {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &TopicConnection {
        &self.connection
    }

    /// Current value of an entry, or `None` when absent.
    pub fn get(&self, key: ListKey) -> Option<Value> {
        self.connection.inner.ensure_active();
        self.connection.inner.topic.list_value(&self.name, key.0)
    }

    /// Keys in list order, head to tail.
    pub fn keys(&self) -> Vec<ListKey> {
        self.connection.inner.ensure_active();
        self.connection
            .inner
            .topic
            .list_keys(&self.name)
            .into_iter()
            .map(ListKey)
            .collect()
    }

    /// Values in list order, head to tail.
    pub fn items(&self) -> Vec<Value> {
        self.connection.inner.ensure_active();
        self.connection
            .inner
            .topic
            .list_entries(&self.name)
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }

    /// Apply a list insert operation.
    pub fn apply(&self, operation: ListOperation) -> ListInsertResult {
        let inner = Arc::clone(&self.connection.inner);
        let dispatcher = inner.dispatcher();
        let (completer, receiver) = dispatcher.create_completable::<bool>();

        let connection_scope = operation.scope == EntryScope::Connection;
        let scope_owner = connection_scope.then(|| inner.topic.node_id());
        let change = operation.into_change(&self.name, scope_owner);

        let id = Uuid::new_v4();
        let name = self.name.clone();
        let tracked = Arc::clone(&inner);
        inner.topic.set_change_result_tracker(id, move |result| {
            if connection_scope && result == ChangeResult::Accepted {
                // For inserts the entry key is the tracking id itself.
                tracked.record_scoped_list_key(&name, id, id);
            }
            completer.complete(result == ChangeResult::Accepted);
        });
        inner.topic.submit(id, &change);

        ListInsertResult {
            key: ListKey(id),
            completion: receiver,
        }
    }

    pub fn insert_last(&self, value: Value, scope: EntryScope) -> ListInsertResult {
        self.apply(ListOperation::insert_last(value).with_scope(scope))
    }

    pub fn insert_first(&self, value: Value, scope: EntryScope) -> ListInsertResult {
        self.apply(ListOperation::insert_first(value).with_scope(scope))
    }

    pub fn insert_before(&self, key: ListKey, value: Value, scope: EntryScope) -> ListInsertResult {
        self.apply(ListOperation::insert_before(key, value).with_scope(scope))
    }

    pub fn insert_after(&self, key: ListKey, value: Value, scope: EntryScope) -> ListInsertResult {
        self.apply(ListOperation::insert_after(key, value).with_scope(scope))
    }

    pub fn insert_between(
        &self,
        prev: Option<ListKey>,
        next: Option<ListKey>,
        value: Value,
        scope: EntryScope,
    ) -> ListInsertResult {
        self.apply(ListOperation::insert_between(prev, next, value).with_scope(scope))
    }

    /// Rewrite the value at a key. Resolves `false` when the key is absent.
    pub fn set(&self, key: ListKey, value: Value, scope: EntryScope) -> oneshot::Receiver<bool> {
        self.submit_list_set(key, value, scope)
    }

    /// Remove an entry. Resolves `false` when the key is absent.
    pub fn delete(&self, key: ListKey) -> oneshot::Receiver<bool> {
        self.submit_list_set(key, Value::Null, EntryScope::Topic)
    }

    fn submit_list_set(
        &self,
        key: ListKey,
        value: Value,
        scope: EntryScope,
    ) -> oneshot::Receiver<bool> {
        let inner = Arc::clone(&self.connection.inner);
        let dispatcher = inner.dispatcher();
        let (completer, receiver) = dispatcher.create_completable::<bool>();

        let connection_scope = scope == EntryScope::Connection;
        let change = Change::ListSet {
            name: self.name.clone(),
            key: key.0,
            value,
            expected_id: None,
            scope_owner: connection_scope.then(|| inner.topic.node_id()),
        };

        let id = Uuid::new_v4();
        let name = self.name.clone();
        let tracked = Arc::clone(&inner);
        inner.topic.set_change_result_tracker(id, move |result| {
            if connection_scope && result == ChangeResult::Accepted {
                tracked.record_scoped_list_key(&name, key.0, id);
            }
            completer.complete(result == ChangeResult::Accepted);
        });
        inner.topic.submit(id, &change);
        receiver
    }

    /// Move an entry immediately before another. Resolves `false` when
    /// either key is absent.
    pub fn move_before(&self, key: ListKey, reference: ListKey) -> oneshot::Receiver<bool> {
        self.submit_move(Change::MoveBefore {
            name: self.name.clone(),
            reference_key: reference.0,
            key_to_move: key.0,
        })
    }

    /// Move an entry immediately after another. Resolves `false` when
    /// either key is absent.
    pub fn move_after(&self, key: ListKey, reference: ListKey) -> oneshot::Receiver<bool> {
        self.submit_move(Change::MoveAfter {
            name: self.name.clone(),
            reference_key: reference.0,
            key_to_move: key.0,
        })
    }

    /// Move an entry between two neighbors; at least one must be given.
    pub fn move_between(
        &self,
        key: ListKey,
        prev: Option<ListKey>,
        next: Option<ListKey>,
    ) -> oneshot::Receiver<bool> {
        match (prev, next) {
            (Some(prev), _) => self.move_after(key, prev),
            (None, Some(next)) => self.move_before(key, next),
            (None, None) => panic!("move_between requires at least one neighbor key"),
        }
    }

    fn submit_move(&self, change: Change) -> oneshot::Receiver<bool> {
        let inner = Arc::clone(&self.connection.inner);
        let dispatcher = inner.dispatcher();
        let (completer, receiver) = dispatcher.create_completable::<bool>();

        let id = Uuid::new_v4();
        inner.topic.set_change_result_tracker(id, move |result| {
            completer.complete(result == ChangeResult::Accepted);
        });
        inner.topic.submit(id, &change);
        receiver
    }

    /// Subscribe to changes of this list. One synthetic insert event per
    /// current entry (head to tail) is delivered first, then the live
    /// stream follows without loss or duplication.
    pub fn subscribe(
        &self,
        handler: impl FnMut(ListChangeEvent) + Send + 'static,
    ) -> Registration {
        let inner = Arc::clone(&self.connection.inner);
        let handler: ListSubscriberFn = Arc::new(Mutex::new(Box::new(handler)));
        let (subscriber_id, dispatcher) = {
            let mut state = inner.state();
            let dispatcher = state
                .dispatcher
                .clone()
                .expect("Cannot subscribe on an inactive connection");
            let subscriber_id = state.next_subscriber;
            state.next_subscriber += 1;
            state
                .list_subscribers
                .entry(self.name.clone())
                .or_default()
                .push(ListSubscriberEntry {
                    id: subscriber_id,
                    from_seq: u64::MAX,
                    handler: Arc::clone(&handler),
                });
            (subscriber_id, dispatcher)
        };

        let name = self.name.clone();
        let catch_up = Arc::clone(&inner);
        dispatcher.dispatch(move || {
            let (entries, seq) = catch_up.topic.list_catch_up(&name);
            {
                let mut state = catch_up.state();
                let Some(subscribers) = state.list_subscribers.get_mut(&name) else {
                    return;
                };
                match subscribers.iter_mut().find(|s| s.id == subscriber_id) {
                    Some(subscriber) => subscriber.from_seq = seq,
                    None => return,
                }
            }
            let mut handler = handler.lock().unwrap_or_else(|e| e.into_inner());
            let mut prev: Option<ListKey> = None;
            for (key, value) in entries {
                let key = ListKey(key);
                (handler)(ListChangeEvent {
                    kind: ListChangeKind::Insert,
                    key,
                    old_value: None,
                    new_value: Some(value),
                    old_prev: None,
                    old_next: None,
                    new_prev: prev,
                    new_next: None,
                });
                prev = Some(key);
            }
        });

        let name = self.name.clone();
        let unsubscribe = Arc::clone(&inner);
        let registration = Registration::new(move || {
            let mut state = unsubscribe.state();
            if let Some(subscribers) = state.list_subscribers.get_mut(&name) {
                subscribers.retain(|s| s.id != subscriber_id);
                if subscribers.is_empty() {
                    state.list_subscribers.remove(&name);
                }
            }
        });
        inner.add_registration(registration.clone());
        registration
    }

    /// The idle-expiration timeout configured for this list, if any.
    pub fn expiration_timeout(&self) -> Option<std::time::Duration> {
        self.connection.inner.topic.list_timeout(&self.name)
    }

    /// Set (`Some`) or clear (`None`) this list's idle-expiration timeout.
    pub fn set_expiration_timeout(&self, timeout: Option<std::time::Duration>) {
        let inner = &self.connection.inner;
        let change = Change::ListTimeout {
            name: self.name.clone(),
            value: timeout.map(topic::json::duration_to_iso),
        };
        inner.topic.submit(Uuid::new_v4(), &change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ComponentConnectionContext;
    use crate::context::ComponentRef;
    use crate::engine::{Engine, EngineConfig};
    use backend::LocalBackend;
    use serde_json::json;
    use std::time::Duration;
    use tokio::runtime::Handle;
    use tokio::sync::mpsc;

    fn test_engine() -> Engine {
        Engine::new(
            EngineConfig::new(LocalBackend::new()).with_executor(Handle::current()),
        )
        .unwrap()
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn component_context_drives_connection_lifecycle() {
        let engine = test_engine();
        let context = ComponentConnectionContext::new();
        let component = ComponentRef::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _registration = engine.open_topic_connection(
            context.as_ref(),
            "t",
            UserInfo::new("alice"),
            move |connection| {
                let _ = tx.send(connection.clone());
                None
            },
        );

        // Nothing attached yet: the callback must not have run.
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        context.component_attached(component);
        let connection = recv(&mut rx).await;
        connection
            .named_map("m")
            .put("presence", json!("here"), EntryScope::Connection)
            .await
            .unwrap();

        // Observe the cleanup through a second connection.
        let (observer_tx, mut observer) = mpsc::unbounded_channel();
        let observer_tx = Mutex::new(Some(observer_tx));
        let system = engine.system_context();
        engine.open_topic_connection(
            system.as_ref(),
            "t",
            UserInfo::new("bob"),
            move |connection| {
                if let Some(tx) = observer_tx.lock().unwrap().take() {
                    let _ = tx.send(connection.clone());
                }
                None
            },
        );
        let observer_conn = recv(&mut observer).await;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        observer_conn.named_map("m").subscribe(move |event| {
            let _ = events_tx.send(event);
        });
        let event = recv(&mut events).await;
        assert_eq!(event.new_value, Some(json!("here")));

        // Detaching the last component deactivates the connection and
        // removes its scoped entries.
        context.component_detached(component);
        let event = recv(&mut events).await;
        assert_eq!(event.key, "presence");
        assert_eq!(event.new_value, None);

        // Re-attaching activates again and runs the callback anew.
        context.component_attached(component);
        let reactivated = recv(&mut rx).await;
        assert_eq!(
            reactivated.named_map("m").get("presence"),
            None
        );
    }

    #[tokio::test]
    async fn rapid_detach_attach_is_tolerated() {
        let engine = test_engine();
        let context = ComponentConnectionContext::new();
        let component = ComponentRef::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.open_topic_connection(
            context.as_ref(),
            "t",
            UserInfo::new("alice"),
            move |connection| {
                let _ = tx.send(connection.clone());
                None
            },
        );

        context.component_attached(component);
        let connection = recv(&mut rx).await;

        // Detach and immediately re-attach: the queued deactivation finds
        // its precondition gone and exits without effect.
        context.component_detached(component);
        context.component_attached(component);
        tokio::task::yield_now().await;

        // A detach after the dust settles still deactivates properly.
        connection
            .named_map("m")
            .put("k", json!("v"), EntryScope::Connection)
            .await
            .unwrap();
        context.component_detached(component);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let gone = connection.topic().map_value("m", "k").is_none();
            if gone {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "scoped entry not cleaned");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn panicking_subscriber_closes_the_connection() {
        let engine = test_engine();
        let system = engine.system_context();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx = Mutex::new(Some(tx));
        engine.open_topic_connection(
            system.as_ref(),
            "t",
            UserInfo::new("alice"),
            move |connection| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(connection.clone());
                }
                None
            },
        );
        let connection = recv(&mut rx).await;

        connection
            .named_map("m")
            .put("scoped", json!("v"), EntryScope::Connection)
            .await
            .unwrap();
        connection.named_map("m").subscribe(|_| {
            panic!("broken subscriber");
        });

        // Trigger delivery; the panic deactivates and closes the
        // connection, which cleans up its scoped entries.
        let topic = Arc::clone(connection.topic());
        connection
            .named_map("m")
            .put("other", json!(1), EntryScope::Topic)
            .await
            .ok();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while topic.map_value("m", "scoped").is_some() {
            assert!(
                std::time::Instant::now() < deadline,
                "scoped entry not cleaned after subscriber panic"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn list_operation_conditions_reach_the_log() {
        let engine = test_engine();
        let system = engine.system_context();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx = Mutex::new(Some(tx));
        engine.open_topic_connection(
            system.as_ref(),
            "t",
            UserInfo::new("alice"),
            move |connection| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(connection.clone());
                }
                None
            },
        );
        let connection = recv(&mut rx).await;
        let list = connection.named_list("l");

        let a = list.insert_last(json!("a"), EntryScope::Topic);
        assert!(a.completion.await.unwrap());
        let b = list.insert_last(json!("b"), EntryScope::Topic);
        assert!(b.completion.await.unwrap());

        // Inserting between adjacent keys succeeds.
        let between = list.insert_between(Some(a.key), Some(b.key), json!("x"), EntryScope::Topic);
        assert!(between.completion.await.unwrap());

        // The same neighbors are no longer adjacent: the insert rejects.
        let stale = list.insert_between(Some(a.key), Some(b.key), json!("y"), EntryScope::Topic);
        assert!(!stale.completion.await.unwrap());

        assert_eq!(list.items(), vec![json!("a"), json!("x"), json!("b")]);

        // move_between with a single neighbor.
        assert!(list.move_between(b.key, None, Some(a.key)).await.unwrap());
        assert_eq!(list.items(), vec![json!("b"), json!("a"), json!("x")]);
    }

    #[tokio::test]
    async fn delete_and_set_resolve_false_on_absent_keys() {
        let engine = test_engine();
        let system = engine.system_context();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx = Mutex::new(Some(tx));
        engine.open_topic_connection(
            system.as_ref(),
            "t",
            UserInfo::new("alice"),
            move |connection| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(connection.clone());
                }
                None
            },
        );
        let connection = recv(&mut rx).await;
        let list = connection.named_list("l");

        let ghost = ListKey(Uuid::new_v4());
        assert!(!list.delete(ghost).await.unwrap());
        assert!(!list.set(ghost, json!("v"), EntryScope::Topic).await.unwrap());
        assert!(!list.move_before(ghost, ghost).await.unwrap());
    }
}
