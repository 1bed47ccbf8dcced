use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
};

use log::error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_WORKER: u64;
}

/// A spawned poller loop and the token that ends it.
pub(crate) struct Worker {
    id: u64,
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns `make(token)` tagged with a fresh worker id, so `stop` can tell
    /// when it is being called from inside the loop it would join.
    pub(crate) fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(CURRENT_WORKER.scope(id, make(cancel_token.clone())));

        Self {
            id,
            cancel_token,
            handle,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the loop. Joining is left to the returned [`PendingStop`] so it
    /// can happen after the caller has released its own locks.
    pub(crate) fn cancel(self) -> PendingStop {
        self.cancel_token.cancel();
        let inside_self = CURRENT_WORKER
            .try_with(|current| *current == self.id)
            .unwrap_or(false);

        PendingStop {
            // The loop notices the token once the running callback returns.
            handle: if inside_self { None } else { Some(self.handle) },
        }
    }
}

/// Join half of a poller stop.
#[must_use = "await join() to wait for the worker to exit"]
#[derive(Default)]
pub struct PendingStop {
    handle: Option<JoinHandle<()>>,
}

impl PendingStop {
    pub fn none() -> Self {
        Self::default()
    }

    pub async fn join(self) {
        if let Some(handle) = self.handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!("poller worker failed to join: {err}");
                }
            }
        }
    }
}
