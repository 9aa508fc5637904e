use std::sync::Arc;
use std::time::Duration;

use crate::config::IntervalsConfig;
use crate::error::AppResult;
use crate::push_sender::WebPushSender;
use crate::store::Store;

const IDLE_SLEEP: Duration = Duration::from_secs(10);

/// A single long-lived worker (core spec §4.3): pops the next due
/// push-queue entry, invokes the sender, and either completes or
/// reschedules with retry. Exhausted retries trigger client
/// unsubscription. Never parallel.
pub struct PushDispatcher {
    store: Arc<Store>,
    sender: Arc<dyn WebPushSender>,
    intervals: IntervalsConfig,
}

impl PushDispatcher {
    pub fn new(store: Arc<Store>, sender: Arc<dyn WebPushSender>, intervals: IntervalsConfig) -> Self {
        Self {
            store,
            sender,
            intervals,
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            if shutdown.try_recv().is_ok() {
                tracing::info!("push dispatcher shutting down");
                return;
            }

            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            tracing::info!("push dispatcher shutting down");
                            return;
                        }
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("push dispatcher pass failed: {:?}", e);
                }
            }
        }
    }

    /// Runs one pass. Returns `Ok(false)` when there was nothing due
    /// (caller idle-sleeps), `Ok(true)` otherwise.
    async fn run_once(&self) -> AppResult<bool> {
        let Some(item) = self
            .store
            .push_queue_next(self.intervals.message_retry_interval_secs)
            .await?
        else {
            return Ok(false);
        };

        // Defensive: the enqueue path excludes clients with `push_sub =
        // null`, but concurrent unsubscription may race (core spec §4.3
        // step 2).
        let Some(push_sub) = item.push_sub.as_deref() else {
            self.store.push_queue_finish(item.id, true).await?;
            return Ok(true);
        };

        match self
            .sender
            .notify(push_sub, &item.vapid_priv, &item.message)
            .await
        {
            Ok(()) => {
                tracing::info!("delivered push queue item {}", item.id);
                self.store.push_queue_finish(item.id, false).await?;
            }
            Err(e) => {
                // `retries` is the count already incremented by the lease
                // step, so this was the `retries`-th attempt. Dropped once
                // a `max_message_retries`-th *retry* (i.e. the
                // `max_message_retries + 1`-th attempt overall) also fails;
                // see DESIGN.md for why this reads `>` and not `>=`.
                if item.retries > self.intervals.max_message_retries {
                    tracing::warn!(
                        "push queue item {} exhausted retries ({}), unsubscribing client {}: {:?}",
                        item.id,
                        item.retries,
                        item.client_id,
                        e
                    );
                    self.store.push_queue_finish(item.id, true).await?;
                } else {
                    tracing::debug!(
                        "push queue item {} failed (attempt {}), will retry: {:?}",
                        item.id,
                        item.retries,
                        e
                    );
                }
            }
        }

        Ok(true)
    }
}
