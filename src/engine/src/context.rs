//! Connection contexts: the activation/dispatch contract between a consumer
//! and its topic connections.
//!
//! A context reports activation by handing the connection a non-null
//! [`ActionDispatcher`] and deactivation by handing it `None`. Each
//! dispatcher is a FIFO queue executing one action at a time, so event
//! delivery and future completions are serialized per consumer.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use log::warn;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use backend::Registration;

use crate::executor::Executor;

type Action = Box<dyn FnOnce() + Send>;

/// Called with `Some(dispatcher)` on activation, `None` on deactivation.
pub type ActivationHandler = Arc<dyn Fn(Option<ActionDispatcher>) + Send + Sync>;

/// The contract a consumer environment implements to host topic
/// connections.
pub trait ConnectionContext: Send + Sync {
    /// Register an activation handler. The returned registration
    /// permanently tears the context down for this consumer; after removal
    /// no further activation callbacks fire.
    fn init(&self, handler: ActivationHandler, executor: &Executor) -> Registration;
}

/// Serialized executor for one consumer: actions run one at a time, FIFO,
/// on the engine's worker pool.
#[derive(Clone)]
pub struct ActionDispatcher {
    tx: mpsc::UnboundedSender<Action>,
}

impl ActionDispatcher {
    pub fn new(executor: &Executor) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Action>();
        executor.spawn(async move {
            while let Some(action) = rx.recv().await {
                // One broken action must not take the whole queue down.
                if catch_unwind(AssertUnwindSafe(action)).is_err() {
                    warn!("Dispatched action panicked");
                }
            }
        });
        ActionDispatcher { tx }
    }

    /// Enqueue an action. Actions dispatched after context teardown are
    /// silently dropped.
    pub fn dispatch(&self, action: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(action)).is_err() {
            log::debug!("Dispatcher is closed; dropping action");
        }
    }

    /// Create a future whose completion is delivered through this
    /// dispatcher, after any actions already in the queue.
    pub fn create_completable<T: Send + 'static>(
        &self,
    ) -> (Completer<T>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Completer {
                dispatcher: self.clone(),
                tx,
            },
            rx,
        )
    }
}

/// Completion side of [`ActionDispatcher::create_completable`].
pub struct Completer<T: Send + 'static> {
    dispatcher: ActionDispatcher,
    tx: oneshot::Sender<T>,
}

impl<T: Send + 'static> Completer<T> {
    pub fn complete(self, value: T) {
        let tx = self.tx;
        self.dispatcher.dispatch(move || {
            let _ = tx.send(value);
        });
    }
}

struct Consumer {
    id: u64,
    handler: ActivationHandler,
}

#[derive(Default)]
struct SystemContextState {
    consumers: Vec<Consumer>,
    next_consumer: u64,
    closed: bool,
}

/// Context for engine-internal and background consumers.
///
/// Immediately and permanently active: every `init` call gets its own
/// dispatcher, so deliveries are serialized per consumer but parallel
/// across consumers. Deactivates only when the owning engine shuts down.
pub struct SystemConnectionContext {
    state: Arc<Mutex<SystemContextState>>,
}

impl SystemConnectionContext {
    pub fn new() -> Arc<Self> {
        Arc::new(SystemConnectionContext {
            state: Arc::new(Mutex::new(SystemContextState::default())),
        })
    }

    /// Deactivate every consumer; called when the engine shuts down.
    pub(crate) fn close_all(&self) {
        let consumers = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            std::mem::take(&mut state.consumers)
        };
        for consumer in consumers {
            (consumer.handler)(None);
        }
    }
}

impl ConnectionContext for SystemConnectionContext {
    fn init(&self, handler: ActivationHandler, executor: &Executor) -> Registration {
        let id = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                warn!("Ignoring init on a closed system context");
                return Registration::noop();
            }
            let id = state.next_consumer;
            state.next_consumer += 1;
            state.consumers.push(Consumer {
                id,
                handler: handler.clone(),
            });
            id
        };

        handler(Some(ActionDispatcher::new(executor)));

        // Close tears the consumer down silently: the closing connection
        // performs its own deactivation.
        let state = Arc::clone(&self.state);
        Registration::new(move || {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.consumers.retain(|c| c.id != id);
        })
    }
}

struct ComponentContextState {
    attached: HashSet<Uuid>,
    consumers: Vec<Consumer>,
    next_consumer: u64,
    dispatcher: Option<ActionDispatcher>,
    executor: Option<Executor>,
    active: bool,
}

impl Default for ComponentContextState {
    fn default() -> Self {
        ComponentContextState {
            attached: HashSet::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            dispatcher: None,
            executor: None,
            active: false,
        }
    }
}

/// Handle representing one UI component driving a component context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentRef(Uuid);

impl ComponentRef {
    pub fn new() -> Self {
        ComponentRef(Uuid::new_v4())
    }
}

impl Default for ComponentRef {
    fn default() -> Self {
        Self::new()
    }
}

/// Context bound to a set of UI components.
///
/// Active while at least one component is attached to a live UI; the
/// integration layer forwards attach/detach events through
/// [`component_attached`](Self::component_attached) and
/// [`component_detached`](Self::component_detached). All consumers of one
/// context share a single dispatcher, mirroring the single UI access queue
/// the actions ultimately serialize on.
pub struct ComponentConnectionContext {
    state: Arc<Mutex<ComponentContextState>>,
}

impl ComponentConnectionContext {
    pub fn new() -> Arc<Self> {
        Arc::new(ComponentConnectionContext {
            state: Arc::new(Mutex::new(ComponentContextState::default())),
        })
    }

    /// A component of this context was attached to a live UI.
    pub fn component_attached(&self, component: ComponentRef) {
        let activation = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.attached.insert(component.0);
            if state.active || state.attached.is_empty() {
                None
            } else {
                state.active = true;
                let dispatcher = match (&state.dispatcher, &state.executor) {
                    (Some(dispatcher), _) => dispatcher.clone(),
                    (None, Some(executor)) => {
                        let dispatcher = ActionDispatcher::new(executor);
                        state.dispatcher = Some(dispatcher.clone());
                        dispatcher
                    }
                    (None, None) => {
                        // No consumer yet; activation is reported when one
                        // calls init.
                        state.active = false;
                        return;
                    }
                };
                let handlers: Vec<ActivationHandler> =
                    state.consumers.iter().map(|c| c.handler.clone()).collect();
                Some((dispatcher, handlers))
            }
        };
        if let Some((dispatcher, handlers)) = activation {
            for handler in handlers {
                handler(Some(dispatcher.clone()));
            }
        }
    }

    /// A component of this context was detached from its UI.
    pub fn component_detached(&self, component: ComponentRef) {
        let handlers = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.attached.remove(&component.0);
            if state.active && state.attached.is_empty() {
                state.active = false;
                state
                    .consumers
                    .iter()
                    .map(|c| c.handler.clone())
                    .collect::<Vec<_>>()
            } else {
                Vec::new()
            }
        };
        for handler in handlers {
            handler(None);
        }
    }

    /// Force deactivation of every consumer regardless of attached
    /// components; used by the session beacon.
    pub fn deactivate_all(&self) {
        let handlers = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.attached.clear();
            if state.active {
                state.active = false;
                state
                    .consumers
                    .iter()
                    .map(|c| c.handler.clone())
                    .collect::<Vec<_>>()
            } else {
                Vec::new()
            }
        };
        for handler in handlers {
            handler(None);
        }
    }
}

impl ConnectionContext for ComponentConnectionContext {
    fn init(&self, handler: ActivationHandler, executor: &Executor) -> Registration {
        let (id, activate_with) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let id = state.next_consumer;
            state.next_consumer += 1;
            state.consumers.push(Consumer {
                id,
                handler: handler.clone(),
            });
            if state.executor.is_none() {
                state.executor = Some(executor.clone());
            }

            // Components may already be attached when the consumer arrives.
            if !state.attached.is_empty() {
                state.active = true;
                let dispatcher = state
                    .dispatcher
                    .get_or_insert_with(|| ActionDispatcher::new(executor))
                    .clone();
                (id, Some(dispatcher))
            } else {
                (id, None)
            }
        };

        if let Some(dispatcher) = activate_with {
            handler(Some(dispatcher));
        }

        let state = Arc::clone(&self.state);
        Registration::new(move || {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.consumers.retain(|c| c.id != id);
        })
    }
}

/// Session-end notification fan-out: the browser beacon registers every
/// component context of a session here and a single trigger deactivates
/// them all.
pub struct SessionBeacon {
    contexts: Mutex<Vec<Weak<ComponentConnectionContext>>>,
}

impl SessionBeacon {
    pub fn new() -> Self {
        SessionBeacon {
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, context: &Arc<ComponentConnectionContext>) {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.push(Arc::downgrade(context));
    }

    /// The session ended: deactivate every registered context.
    pub fn trigger(&self) {
        let contexts = {
            let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *contexts)
        };
        for context in contexts {
            if let Some(context) = context.upgrade() {
                context.deactivate_all();
            }
        }
    }
}

impl Default for SessionBeacon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Handle;
    use tokio::sync::mpsc;

    fn executor() -> Executor {
        Executor::from_handle(Handle::current())
    }

    #[tokio::test]
    async fn dispatcher_runs_actions_in_fifo_order() {
        let dispatcher = ActionDispatcher::new(&executor());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            let tx = tx.clone();
            dispatcher.dispatch(move || {
                let _ = tx.send(i);
            });
        }

        for expected in 0..5 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn panicking_action_does_not_stop_the_queue() {
        let dispatcher = ActionDispatcher::new(&executor());
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.dispatch(|| panic!("broken action"));
        let probe = tx.clone();
        dispatcher.dispatch(move || {
            let _ = probe.send("survived");
        });

        assert_eq!(rx.recv().await, Some("survived"));
    }

    #[tokio::test]
    async fn completable_resolves_through_the_queue() {
        let dispatcher = ActionDispatcher::new(&executor());
        let (completer, receiver) = dispatcher.create_completable::<u32>();

        // An action dispatched before completion runs first.
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        dispatcher.dispatch(move || {
            first.lock().unwrap().push("action");
        });
        completer.complete(7);

        assert_eq!(receiver.await.unwrap(), 7);
        assert_eq!(*order.lock().unwrap(), vec!["action"]);
    }

    #[tokio::test]
    async fn system_context_activates_each_consumer_immediately() {
        let context = SystemConnectionContext::new();
        let executor = executor();

        let activations = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&activations);
        let handler: ActivationHandler = Arc::new(move |dispatcher| {
            if dispatcher.is_some() {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        context.init(handler.clone(), &executor);
        context.init(handler, &executor);
        assert_eq!(activations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn system_context_deactivates_on_close_all() {
        let context = SystemConnectionContext::new();
        let executor = executor();

        let deactivations = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&deactivations);
        let handler: ActivationHandler = Arc::new(move |dispatcher| {
            if dispatcher.is_none() {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        context.init(handler.clone(), &executor);
        let closed = context.init(handler, &executor);
        // A consumer torn down before shutdown is not deactivated again.
        closed.remove();

        context.close_all();
        assert_eq!(deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn component_context_follows_attach_detach() {
        let context = ComponentConnectionContext::new();
        let executor = executor();

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        let handler: ActivationHandler = Arc::new(move |dispatcher| {
            sink.lock().unwrap().push(dispatcher.is_some());
        });
        context.init(handler, &executor);

        let first = ComponentRef::new();
        let second = ComponentRef::new();

        context.component_attached(first);
        context.component_attached(second);
        // Still one component attached: no transition.
        context.component_detached(first);
        context.component_detached(second);

        assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn component_context_activates_consumer_arriving_while_attached() {
        let context = ComponentConnectionContext::new();
        let executor = executor();

        let component = ComponentRef::new();
        context.component_attached(component);

        let activated = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&activated);
        let handler: ActivationHandler = Arc::new(move |dispatcher| {
            if dispatcher.is_some() {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        context.init(handler, &executor);
        assert_eq!(activated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn beacon_deactivates_all_session_contexts() {
        let executor = executor();
        let beacon = SessionBeacon::new();

        let first = ComponentConnectionContext::new();
        let second = ComponentConnectionContext::new();
        beacon.register(&first);
        beacon.register(&second);

        let deactivations = Arc::new(AtomicUsize::new(0));
        for context in [&first, &second] {
            let count = Arc::clone(&deactivations);
            let handler: ActivationHandler = Arc::new(move |dispatcher| {
                if dispatcher.is_none() {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
            context.init(handler, &executor);
            context.component_attached(ComponentRef::new());
        }

        beacon.trigger();
        assert_eq!(deactivations.load(Ordering::SeqCst), 2);
    }
}
