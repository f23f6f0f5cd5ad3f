//! The process-wide engine facade: topic registry, connection lifecycle,
//! user colors, and orderly shutdown.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::runtime::Handle;
use uuid::Uuid;

use backend::{Backend, Registration};
use topic::{Change, Topic};

use crate::connection::TopicConnection;
use crate::context::{ConnectionContext, SystemConnectionContext};
use crate::executor::Executor;
use crate::registration::TopicConnectionRegistration;
use crate::user::UserInfo;

/// Number of distinct user colors cycled through by default.
pub const USER_COLOR_COUNT: usize = 7;

/// How long shutdown waits for in-flight change results before forcing the
/// executor down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Engine configuration
pub struct EngineConfig {
    /// The substrate topics run on (required).
    pub backend: Arc<dyn Backend>,
    /// Externally supplied worker pool; when absent the engine creates and
    /// owns one sized to the CPU count.
    pub executor: Option<Handle>,
}

impl EngineConfig {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        EngineConfig {
            backend,
            executor: None,
        }
    }

    pub fn with_executor(mut self, handle: Handle) -> Self {
        self.executor = Some(handle);
        self
    }
}

#[derive(Default)]
struct ColorState {
    assigned: HashMap<String, usize>,
    next: usize,
}

struct EngineInner {
    backend: Arc<dyn Backend>,
    executor: Executor,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    colors: Mutex<ColorState>,
    active_topics: Mutex<HashMap<String, usize>>,
    connections: Mutex<HashMap<u64, TopicConnection>>,
    next_connection: AtomicU64,
    system_context: Arc<SystemConnectionContext>,
    active: AtomicBool,
}

/// The coordination fabric's process-wide entry point.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> std::io::Result<Engine> {
        let executor = match config.executor {
            Some(handle) => Executor::from_handle(handle),
            None => Executor::owned()?,
        };
        Ok(Engine {
            inner: Arc::new(EngineInner {
                backend: config.backend,
                executor,
                topics: Mutex::new(HashMap::new()),
                colors: Mutex::new(ColorState::default()),
                active_topics: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(0),
                system_context: SystemConnectionContext::new(),
                active: AtomicBool::new(true),
            }),
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// The always-active context for engine-internal and background
    /// consumers.
    pub fn system_context(&self) -> Arc<SystemConnectionContext> {
        Arc::clone(&self.inner.system_context)
    }

    /// Open a connection to the topic with the given id, creating the topic
    /// on demand.
    ///
    /// The activation callback runs (on the context's dispatcher) every
    /// time the connection becomes active; the registration it returns is
    /// removed on deactivation. The returned handle deactivates the
    /// connection when removed and reports backend failures.
    pub fn open_topic_connection(
        &self,
        context: &dyn ConnectionContext,
        topic_id: &str,
        user: UserInfo,
        on_activation: impl Fn(&TopicConnection) -> Option<Registration> + Send + Sync + 'static,
    ) -> TopicConnectionRegistration {
        assert!(!topic_id.is_empty(), "Topic id cannot be empty");
        if !self.inner.active.load(Ordering::SeqCst) {
            return TopicConnectionRegistration::failed("Engine is not active");
        }

        let topic = self.topic(topic_id);

        let activation_inner = Arc::clone(&self.inner);
        let activation_topic = Arc::clone(&topic);
        let topic_activation_handler = Box::new(move |active: bool| {
            activation_inner.handle_topic_activation(&activation_topic, active);
        });

        let connection = TopicConnection::open(
            context,
            Arc::clone(&topic),
            user,
            topic_activation_handler,
            Box::new(on_activation),
            &self.inner.executor,
        );

        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        {
            let mut connections = self.inner.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.insert(connection_id, connection.clone());
        }

        let deregister_inner = Arc::clone(&self.inner);
        let registration = TopicConnectionRegistration::new(Registration::new(move || {
            let removed = {
                let mut connections = deregister_inner
                    .connections
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                connections.remove(&connection_id)
            };
            if let Some(connection) = removed {
                connection.deactivate_and_close();
            }
        }));

        let failure_handle = registration.clone();
        topic.when_ready(move |ok| {
            if !ok {
                failure_handle.fail("Topic failed to initialize");
            }
        });

        registration
    }

    /// The color index to use for a user, stable for the user's id.
    ///
    /// An explicit index on the user wins. A local backend assigns indexes
    /// sequentially in first-seen order; a clustered backend derives them
    /// from the user id so every node agrees without coordination.
    pub fn user_color_index(&self, user: &UserInfo) -> usize {
        if user.color_index >= 0 {
            return user.color_index as usize;
        }
        if self.inner.backend.is_clustered() {
            let mut hasher = DefaultHasher::new();
            user.id.hash(&mut hasher);
            (hasher.finish() % USER_COLOR_COUNT as u64) as usize
        } else {
            let mut colors = self.inner.colors.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(&index) = colors.assigned.get(&user.id) {
                return index;
            }
            let index = colors.next % USER_COLOR_COUNT;
            colors.next += 1;
            colors.assigned.insert(user.id.clone(), index);
            index
        }
    }

    /// Shut the engine down: deactivate every open connection, wait up to
    /// one second for in-flight change results, then stop an owned
    /// executor. Errors during teardown are logged and skipped.
    pub async fn close(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down engine");

        let connections = {
            let mut connections = self
                .inner
                .connections
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *connections)
        };
        for (_, connection) in connections {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                connection.deactivate_and_close();
            }));
            if outcome.is_err() {
                warn!("Connection teardown failed during shutdown");
            }
        }

        self.inner.system_context.close_all();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let pending: usize = {
                let topics = self.inner.topics.lock().unwrap_or_else(|e| e.into_inner());
                topics.values().map(|t| t.pending_trackers()).sum()
            };
            if pending == 0 || Instant::now() >= deadline {
                if pending > 0 {
                    warn!("Forcing shutdown with {} unresolved change results", pending);
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.inner.executor.shutdown(SHUTDOWN_GRACE);
    }

    fn topic(&self, topic_id: &str) -> Arc<Topic> {
        let mut topics = self.inner.topics.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(topics.entry(topic_id.to_string()).or_insert_with(|| {
            Topic::new(
                topic_id,
                Arc::clone(&self.inner.backend),
                self.inner.executor.handle(),
            )
        }))
    }
}

impl EngineInner {
    /// Tracks per-topic active connection counts and announces the 0→1 and
    /// 1→0 transitions on the topic's log.
    fn handle_topic_activation(&self, topic: &Arc<Topic>, active: bool) {
        let transition = {
            let mut counts = self
                .active_topics
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let count = counts.entry(topic.id().to_string()).or_insert(0);
            if active {
                *count += 1;
                *count == 1
            } else if *count > 0 {
                *count -= 1;
                *count == 0
            } else {
                false
            }
        };
        if transition {
            let node_id = self.backend.node_id();
            let change = if active {
                Change::NodeActivate { node_id }
            } else {
                Change::NodeDeactivate { node_id }
            };
            topic.submit(Uuid::new_v4(), &change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{EntryScope, ListChangeKind, MapChangeEvent};
    use backend::{LocalBackend, LocalCluster};
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, oneshot};

    fn test_engine(backend: Arc<dyn Backend>) -> Engine {
        Engine::new(EngineConfig::new(backend).with_executor(Handle::current())).unwrap()
    }

    /// Open a connection on the engine's system context and hand the
    /// activated connection back to the test.
    async fn connect(engine: &Engine, topic_id: &str, user: &str) -> (TopicConnection, TopicConnectionRegistration) {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let context = engine.system_context();
        let registration = engine.open_topic_connection(
            context.as_ref(),
            topic_id,
            UserInfo::new(user),
            move |connection| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(connection.clone());
                }
                None
            },
        );
        let connection = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("connection was not activated")
            .expect("activation callback dropped");
        (connection, registration)
    }

    async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn basic_collaboration() {
        let engine = test_engine(LocalBackend::new());

        let (conn_a, _reg_a) = connect(&engine, "t", "alice").await;
        conn_a
            .named_map("m")
            .put("name", json!("foo"), EntryScope::Topic)
            .await
            .unwrap();

        let (conn_b, _reg_b) = connect(&engine, "t", "bob").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn_b.named_map("m").subscribe(move |event| {
            let _ = tx.send(event);
        });

        let event = next_event(&mut rx).await;
        assert_eq!(event.key, "name");
        assert_eq!(event.old_value, None);
        assert_eq!(event.new_value, Some(json!("foo")));

        // No further events: the single put is observed exactly once.
        conn_a
            .named_map("m")
            .put("other", json!(1), EntryScope::Topic)
            .await
            .unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event.key, "other");
    }

    #[tokio::test]
    async fn optimistic_concurrency_has_exactly_one_winner() {
        let engine = test_engine(LocalBackend::new());
        let (conn_a, _reg_a) = connect(&engine, "t", "alice").await;
        let (conn_b, _reg_b) = connect(&engine, "t", "bob").await;

        conn_a
            .named_map("m")
            .put("counter", json!(0), EntryScope::Topic)
            .await
            .unwrap();

        let attempt_a = conn_a.named_map("m").replace("counter", json!(0), json!(1));
        let attempt_b = conn_b.named_map("m").replace("counter", json!(0), json!(1));
        let result_a = attempt_a.await.unwrap();
        let result_b = attempt_b.await.unwrap();

        assert_ne!(result_a, result_b, "exactly one replace must win");
        assert_eq!(conn_a.named_map("m").get("counter"), Some(json!(1)));
    }

    #[tokio::test]
    async fn connection_scope_cleanup_on_deactivation() {
        let engine = test_engine(LocalBackend::new());
        let (conn_a, reg_a) = connect(&engine, "t", "alice").await;
        let (conn_b, _reg_b) = connect(&engine, "t", "bob").await;

        conn_a
            .named_map("m")
            .put("cursor", json!({ "x": 1 }), EntryScope::Connection)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<MapChangeEvent>();
        conn_b.named_map("m").subscribe(move |event| {
            let _ = tx.send(event);
        });
        let event = next_event(&mut rx).await;
        assert_eq!(event.new_value, Some(json!({ "x": 1 })));

        reg_a.remove();

        let event = next_event(&mut rx).await;
        assert_eq!(event.key, "cursor");
        assert_eq!(event.new_value, None);
        assert_eq!(conn_b.named_map("m").get("cursor"), None);
    }

    #[tokio::test]
    async fn leader_failover_cleans_up_departed_node() {
        let cluster = LocalCluster::new();
        let b1 = cluster.create_backend();
        let b2 = cluster.create_backend();
        cluster.join(&b1);
        cluster.join(&b2);

        let engine1 = test_engine(b1.clone());
        let engine2 = test_engine(b2.clone());

        let (conn1, _reg1) = connect(&engine1, "t", "n1-user").await;
        let (conn2, _reg2) = connect(&engine2, "t", "n2-user").await;

        conn1
            .named_map("m")
            .put("cursor", json!("n1"), EntryScope::Connection)
            .await
            .unwrap();
        conn1
            .named_list("l")
            .insert_last(json!("scoped"), EntryScope::Connection)
            .completion
            .await
            .unwrap();
        conn1
            .named_map("m")
            .put("shared", json!("keep"), EntryScope::Topic)
            .await
            .unwrap();
        assert!(!conn2.topic().is_leader());
        assert_eq!(conn2.named_map("m").get("cursor"), Some(json!("n1")));

        // Node 1 crashes: its backend leaves without engine shutdown.
        cluster.leave(&b1);

        assert!(conn2.topic().is_leader());
        assert_eq!(conn2.named_map("m").get("cursor"), None);
        assert!(conn2.named_list("l").items().is_empty());
        assert_eq!(conn2.named_map("m").get("shared"), Some(json!("keep")));
    }

    #[tokio::test]
    async fn snapshots_let_late_node_catch_up() {
        let cluster = LocalCluster::new();
        let b1 = cluster.create_backend();
        cluster.join(&b1);
        let engine1 = test_engine(b1.clone());
        let (conn1, _reg1) = connect(&engine1, "t", "writer").await;

        let map = conn1.named_map("m");
        for i in 0..250 {
            map.put(&format!("k{}", i % 10), json!(i), EntryScope::Topic)
                .await
                .unwrap();
        }
        assert!(
            b1.load_latest_snapshot("t").await.unwrap().is_some(),
            "leader should have snapshotted"
        );

        let b3 = cluster.create_backend();
        cluster.join(&b3);
        let engine3 = test_engine(b3);
        let (conn3, _reg3) = connect(&engine3, "t", "reader").await;

        let mine = conn1.named_map("m");
        let theirs = conn3.named_map("m");
        assert_eq!(mine.keys(), theirs.keys());
        for key in mine.keys() {
            assert_eq!(mine.get(&key), theirs.get(&key));
        }
    }

    #[tokio::test]
    async fn idle_expiration_clears_list_before_next_subscription() {
        let engine = test_engine(LocalBackend::new());
        let (conn, reg) = connect(&engine, "t", "alice").await;

        let chat = conn.named_list("chat");
        chat.insert_last(json!("hello"), EntryScope::Topic)
            .completion
            .await
            .unwrap();
        chat.insert_last(json!("world"), EntryScope::Topic)
            .completion
            .await
            .unwrap();
        chat.set_expiration_timeout(Some(Duration::ZERO));
        assert_eq!(chat.items().len(), 2);

        // All connections deactivate; the topic goes idle.
        reg.remove();

        // A new connection attaches; the leader cleared the expired list
        // before the first read or subscription event.
        let (conn2, _reg2) = connect(&engine, "t", "bob").await;
        let chat2 = conn2.named_list("chat");
        assert!(chat2.items().is_empty());
        assert_eq!(chat2.expiration_timeout(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn list_subscription_catch_up_then_stream() {
        let engine = test_engine(LocalBackend::new());
        let (conn_a, _reg_a) = connect(&engine, "t", "alice").await;
        let (conn_b, _reg_b) = connect(&engine, "t", "bob").await;

        let list = conn_a.named_list("l");
        let first = list.insert_last(json!("one"), EntryScope::Topic);
        first.completion.await.unwrap();
        list.insert_last(json!("two"), EntryScope::Topic)
            .completion
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn_b.named_list("l").subscribe(move |event| {
            let _ = tx.send(event);
        });

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, ListChangeKind::Insert);
        assert_eq!(event.new_value, Some(json!("one")));
        let event = next_event(&mut rx).await;
        assert_eq!(event.new_value, Some(json!("two")));

        // Live stream continues after the catch-up, without duplicates.
        list.set(first.key, json!("ONE"), EntryScope::Topic)
            .await
            .unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, ListChangeKind::Set);
        assert_eq!(event.old_value, Some(json!("one")));
        assert_eq!(event.new_value, Some(json!("ONE")));
    }

    #[tokio::test]
    async fn await_between_writes_preserves_program_order() {
        let engine = test_engine(LocalBackend::new());
        let (conn, _reg) = connect(&engine, "t", "alice").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.named_map("m").subscribe(move |event| {
            let _ = tx.send(event.key);
        });

        let map = conn.named_map("m");
        map.put("first", json!(1), EntryScope::Topic).await.unwrap();
        map.put("second", json!(2), EntryScope::Topic).await.unwrap();

        assert_eq!(next_event(&mut rx).await, "first");
        assert_eq!(next_event(&mut rx).await, "second");
    }

    #[tokio::test]
    async fn user_colors_are_sequential_on_local_backend() {
        let engine = test_engine(LocalBackend::new());

        let alice = UserInfo::new("alice");
        let bob = UserInfo::new("bob");
        assert_eq!(engine.user_color_index(&alice), 0);
        assert_eq!(engine.user_color_index(&bob), 1);
        // Stable per user.
        assert_eq!(engine.user_color_index(&alice), 0);

        // An explicit index wins.
        let carol = UserInfo::new("carol").with_color_index(5);
        assert_eq!(engine.user_color_index(&carol), 5);

        // The counter wraps around the palette.
        for i in 0..USER_COLOR_COUNT {
            engine.user_color_index(&UserInfo::new(format!("u{}", i)));
        }
        assert_eq!(engine.user_color_index(&UserInfo::new("wrapped")), 2);
    }

    #[tokio::test]
    async fn inactive_engine_returns_failed_registration() {
        let engine = test_engine(LocalBackend::new());
        engine.close().await;

        let context = engine.system_context();
        let registration = engine.open_topic_connection(
            context.as_ref(),
            "t",
            UserInfo::new("alice"),
            |_| None,
        );
        assert!(registration.is_failed());

        let (tx, rx) = oneshot::channel::<String>();
        let tx = Mutex::new(Some(tx));
        registration.on_connection_failed(move |message| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(message.to_string());
            }
        });
        assert!(rx.await.unwrap().contains("not active"));
    }

    #[tokio::test]
    async fn close_deactivates_connections_and_cleans_scoped_entries() {
        let cluster = LocalCluster::new();
        let b1 = cluster.create_backend();
        let b2 = cluster.create_backend();
        cluster.join(&b1);
        cluster.join(&b2);

        let engine1 = test_engine(b1);
        let engine2 = test_engine(b2);
        let (conn1, _reg1) = connect(&engine1, "t", "n1-user").await;
        let (conn2, _reg2) = connect(&engine2, "t", "n2-user").await;

        conn1
            .named_map("m")
            .put("presence", json!("here"), EntryScope::Connection)
            .await
            .unwrap();
        assert_eq!(conn2.named_map("m").get("presence"), Some(json!("here")));

        engine1.close().await;

        assert_eq!(conn2.named_map("m").get("presence"), None);
    }

    #[tokio::test]
    async fn values_are_deep_copied_for_readers() {
        let engine = test_engine(LocalBackend::new());
        let (conn, _reg) = connect(&engine, "t", "alice").await;

        let map = conn.named_map("m");
        map.put("doc", json!({ "nested": { "n": 1 } }), EntryScope::Topic)
            .await
            .unwrap();

        let mut copy = map.get("doc").unwrap();
        copy["nested"]["n"] = Value::from(999);
        assert_eq!(map.get("doc"), Some(json!({ "nested": { "n": 1 } })));
    }
}
