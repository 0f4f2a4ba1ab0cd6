use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{EngineError, Result};
use crate::models::{TableKey, TableUpdatedEvent, WriteEvent};

/// In-process plumbing between loaders, the writer, the query engine and
/// transformers
///
/// Write events go through one bounded queue with a single consumer, the
/// writer; publishers wait while it is full. Table updates fan out over a
/// broadcast channel. Cloning the broker shares both.
#[derive(Clone)]
pub struct MessageBroker {
    writes: mpsc::Sender<WriteEvent>,
    write_queue: Arc<Mutex<Option<mpsc::Receiver<WriteEvent>>>>,
    table_updates: broadcast::Sender<TableUpdatedEvent>,
}

impl MessageBroker {
    pub fn new(capacity: usize) -> Self {
        let (writes, write_queue) = mpsc::channel(capacity.max(1));
        let (table_updates, _) = broadcast::channel(capacity.max(1));
        Self {
            writes,
            write_queue: Arc::new(Mutex::new(Some(write_queue))),
            table_updates,
        }
    }

    /// Queue records for the writer, waiting while the queue is full
    ///
    /// Fails once the writer has stopped taking events.
    pub async fn publish_write(&self, event: WriteEvent) -> Result<()> {
        self.writes
            .send(event)
            .await
            .map_err(|_| EngineError::Internal("Write queue is closed".to_string()))
    }

    pub fn publish_table_updated(&self, key: TableKey) -> usize {
        debug!("Publishing table update for {}", key);
        self.table_updates
            .send(TableUpdatedEvent { key })
            .unwrap_or_default()
    }

    /// Receiving end of the write queue; only the first caller gets it
    pub fn take_write_queue(&self) -> Option<mpsc::Receiver<WriteEvent>> {
        self.write_queue.lock().ok()?.take()
    }

    pub fn subscribe_table_updates(&self) -> broadcast::Receiver<TableUpdatedEvent> {
        self.table_updates.subscribe()
    }
}

/// Drive `handler` for every message until the channel closes
///
/// Lagging subscribers lose the skipped messages; that loss is logged.
pub fn spawn_subscriber<T, F, Fut>(
    name: &'static str,
    mut rx: broadcast::Receiver<T>,
    mut handler: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => handler(message).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    error!("{} lagged behind and lost {} events", name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("{} channel closed", name);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LoaderInserts;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let broker = MessageBroker::new(16);
        let mut first = broker.subscribe_table_updates();
        let mut second = broker.subscribe_table_updates();

        assert_eq!(broker.publish_table_updated(TableKey::new("crm", "users")), 2);

        assert_eq!(first.recv().await.unwrap().key, TableKey::new("crm", "users"));
        assert_eq!(second.recv().await.unwrap().key, TableKey::new("crm", "users"));
    }

    #[tokio::test]
    async fn test_table_update_without_subscribers() {
        let broker = MessageBroker::new(16);
        assert_eq!(broker.publish_table_updated(TableKey::new("a", "b")), 0);
    }

    #[tokio::test]
    async fn test_write_queue_taken_once() {
        let broker = MessageBroker::new(16);
        assert!(broker.clone().take_write_queue().is_some());
        assert!(broker.take_write_queue().is_none());
    }

    #[tokio::test]
    async fn test_full_write_queue_waits_for_consumer() {
        let broker = MessageBroker::new(1);
        let mut queue = broker.take_write_queue().unwrap();
        broker
            .publish_write(WriteEvent::Records(LoaderInserts::new()))
            .await
            .unwrap();

        let publisher = broker.clone();
        let blocked = tokio::spawn(async move {
            publisher
                .publish_write(WriteEvent::Records(LoaderInserts::new()))
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        assert!(queue.recv().await.is_some());
        blocked.await.unwrap().unwrap();
        assert!(queue.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_publish_after_queue_closed_fails() {
        let broker = MessageBroker::new(4);
        let mut queue = broker.take_write_queue().unwrap();
        queue.close();

        let result = broker
            .publish_write(WriteEvent::Records(LoaderInserts::new()))
            .await;
        assert!(matches!(result, Err(EngineError::Internal(_))));
    }

    #[tokio::test]
    async fn test_spawn_subscriber_handles_messages() {
        let broker = MessageBroker::new(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _handle = spawn_subscriber("test", broker.subscribe_table_updates(), move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        broker.publish_table_updated(TableKey::new("a", "b"));
        broker.publish_table_updated(TableKey::new("a", "c"));

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
