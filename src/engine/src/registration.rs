use std::sync::{Arc, Mutex};

use backend::Registration;

type FailureHandler = Box<dyn FnOnce(&str) + Send>;

struct FailureSlot {
    message: Option<String>,
    handler: Option<FailureHandler>,
}

struct RegistrationInner {
    remove: Registration,
    failure: Mutex<FailureSlot>,
}

/// Handle for an open topic connection.
///
/// Removing it deactivates the connection and drops it from the engine.
/// Backend failures that prevent the connection from ever becoming usable
/// (for example a topic that could not be initialized) are surfaced through
/// [`on_connection_failed`](Self::on_connection_failed).
#[derive(Clone)]
pub struct TopicConnectionRegistration {
    inner: Arc<RegistrationInner>,
}

impl TopicConnectionRegistration {
    pub(crate) fn new(remove: Registration) -> Self {
        TopicConnectionRegistration {
            inner: Arc::new(RegistrationInner {
                remove,
                failure: Mutex::new(FailureSlot {
                    message: None,
                    handler: None,
                }),
            }),
        }
    }

    /// A registration that failed before the connection existed.
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        let registration = Self::new(Registration::noop());
        registration.fail(message);
        registration
    }

    /// Deactivate the connection and deregister it. Idempotent.
    pub fn remove(&self) {
        self.inner.remove.remove();
    }

    /// Whether the connection failed.
    pub fn is_failed(&self) -> bool {
        self.inner
            .failure
            .lock()
            .map(|slot| slot.message.is_some())
            .unwrap_or(false)
    }

    /// Register a handler for connection failure. Runs immediately when the
    /// failure already happened; at most once either way.
    pub fn on_connection_failed(&self, handler: impl FnOnce(&str) + Send + 'static) {
        let mut handler: Option<FailureHandler> = Some(Box::new(handler));
        let ready_message = {
            let mut slot = self.inner.failure.lock().unwrap_or_else(|e| e.into_inner());
            match slot.message.clone() {
                Some(message) => Some(message),
                None => {
                    slot.handler = handler.take();
                    None
                }
            }
        };
        if let (Some(message), Some(handler)) = (ready_message, handler.take()) {
            handler(&message);
        }
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let handler = {
            let mut slot = self.inner.failure.lock().unwrap_or_else(|e| e.into_inner());
            if slot.message.is_some() {
                return;
            }
            slot.message = Some(message.clone());
            slot.handler.take()
        };
        if let Some(handler) = handler {
            handler(&message);
        }
    }
}
