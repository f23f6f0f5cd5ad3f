use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use tokio::runtime::{Handle, Runtime};

/// The worker pool running dispatchers and topic bootstrap tasks.
///
/// Either borrowed from the embedding application (a tokio handle) or owned
/// by the engine, in which case the engine shuts it down on close.
#[derive(Clone)]
pub struct Executor {
    handle: Handle,
    owned: Arc<Mutex<Option<Runtime>>>,
}

impl Executor {
    /// Wrap an externally managed runtime; the engine never shuts it down.
    pub fn from_handle(handle: Handle) -> Self {
        Executor {
            handle,
            owned: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an engine-owned worker pool sized to the CPU count.
    pub fn owned() -> std::io::Result<Self> {
        let runtime = Runtime::new()?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            handle,
            owned: Arc::new(Mutex::new(Some(runtime))),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Shut down an owned runtime, waiting at most the given duration for
    /// running tasks. A borrowed runtime is left alone.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        let runtime = self
            .owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runtime) = runtime {
            info!("Shutting down engine-owned executor");
            // shutdown_timeout must not run on one of the runtime's own
            // worker threads.
            let done = std::thread::spawn(move || {
                runtime.shutdown_timeout(timeout);
            });
            let _ = done.join();
        }
    }
}
