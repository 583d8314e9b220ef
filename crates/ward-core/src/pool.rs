use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::action::Action;
use crate::engine::ActionEngine;

/// A fixed set of worker tasks draining one bounded queue.
///
/// Workers hold only a weak reference to the engine, so dropping the
/// engine closes the queue and lets them exit.
pub(crate) struct WorkerPool {
    name: &'static str,
    tx: mpsc::Sender<Arc<Action>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        name: &'static str,
        workers: usize,
        capacity: usize,
        engine: Weak<ActionEngine>,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            action = rx.recv() => action,
                            _ = shutdown.cancelled() => None,
                        }
                    };
                    let Some(action) = next else { break };
                    let Some(engine) = engine.upgrade() else { break };
                    engine.execute(action).await;
                }
                debug!(pool = name, worker, "worker stopped");
            });
        }
        Self { name, tx }
    }

    /// Queue `action` without waiting. Fails when the queue is full or the
    /// workers are gone.
    pub(crate) fn submit(&self, action: Arc<Action>) -> Result<(), String> {
        self.tx.try_send(action).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => format!("{} pool is saturated", self.name),
            mpsc::error::TrySendError::Closed(_) => format!("{} pool is shut down", self.name),
        })
    }
}
