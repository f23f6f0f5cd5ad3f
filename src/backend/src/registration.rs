use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle for undoing a subscription or some other registered callback.
///
/// `remove` is idempotent: the underlying callback runs at most once, no
/// matter how many clones of the handle call it.
#[derive(Clone)]
pub struct Registration {
    callback: Arc<Mutex<Option<Callback>>>,
}

impl Registration {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Registration {
            callback: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// A registration that does nothing when removed.
    pub fn noop() -> Self {
        Registration {
            callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the registered callback, if it has not run yet.
    pub fn remove(&self) {
        let callback = self
            .callback
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None);
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Whether `remove` has already run (or the registration was a no-op).
    pub fn is_removed(&self) -> bool {
        self.callback.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("removed", &self.is_removed())
            .finish()
    }
}
