use async_trait::async_trait;
use graphrec_storage::ChangeNotification;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::Result;

/// Synchronous subscriber, awaited inline after a commit
///
/// Delivery is at-least-once; implementations must be idempotent on
/// `(entity_id, version)`.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, notification: &ChangeNotification) -> Result<()>;

    fn name(&self) -> &'static str {
        "listener"
    }
}

/// Fan-out of committed graph changes
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeNotification>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// New channel receiving every notification published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Listener failures are logged; the write they follow is already durable
    pub async fn publish(&self, notification: ChangeNotification) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            if let Err(err) = listener.on_change(&notification).await {
                warn!(
                    listener = listener.name(),
                    entity_id = %notification.entity_id,
                    version = notification.version,
                    error = %err,
                    "change listener failed"
                );
            }
        }

        // Dropped receivers are pruned here
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}
