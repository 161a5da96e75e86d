//! Cancel-and-reschedule debouncing for update handlers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{trace, warn};

const DEBOUNCE_TARGET: &str = "joinery_host::capability";

/// Coalescing window applied to update handlers.
pub const UPDATE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Runs only the last task scheduled within the coalescing window.
///
/// A task that has already started is never interrupted.
#[derive(Debug)]
pub(crate) struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Schedules `task` after the delay, superseding any task still waiting.
    pub(crate) fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!(target: DEBOUNCE_TARGET, "update dropped: no async runtime available");
            return;
        };
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let delay = self.delay;
        drop(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) != ticket {
                trace!(target: DEBOUNCE_TARGET, "update superseded");
                return;
            }
            task.await;
        }));
    }
}
