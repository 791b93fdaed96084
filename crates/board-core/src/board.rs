//! Session logic: durable write first, then fan-out.

use crate::broadcast::Broadcaster;
use crate::store::{Store, StoreError};
use board_protocol::{Message, MessageId, ServerEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// The message board.
///
/// Every post and delete is committed by the [`Store`] before the matching
/// event reaches the [`Broadcaster`], so no client is ever told about a
/// change that a crash could undo. Writes and their publishes run under one
/// lock, which makes the event order equal the commit order.
///
/// Each write and its publish run in a task of their own: a caller that
/// stops waiting (a dropped HTTP request, a timeout) cannot leave a commit
/// unannounced.
pub struct Board {
    store: Arc<dyn Store>,
    broadcaster: Arc<Broadcaster>,
    write_lock: Arc<Mutex<()>>,
}

impl Board {
    /// Create a board over the given store and broadcaster.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the broadcaster live connections subscribe to.
    #[must_use]
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Post a message and announce it to every subscriber.
    ///
    /// Invalid text is dropped without an event and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; nothing is published then.
    pub async fn post(&self, text: &str) -> Result<Option<Message>, StoreError> {
        let text = text.to_owned();

        self.write(move |store, broadcaster| async move {
            let message = match store.insert(&text).await {
                Ok(message) => message,
                Err(StoreError::Validation(reason)) => {
                    debug!(%reason, "Dropping invalid post");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            let recipients = broadcaster.publish(ServerEvent::new_message(message.clone()));
            debug!(id = message.id, recipients, "Message posted");

            Ok(Some(message))
        })
        .await
    }

    /// Delete a message and announce the deletion to every subscriber.
    ///
    /// The event goes out whether or not the id existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; nothing is published then.
    pub async fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        self.write(move |store, broadcaster| async move {
            let existed = store.delete(id).await?;
            let recipients = broadcaster.publish(ServerEvent::delete_message(id));
            debug!(id, existed, recipients, "Message deleted");

            Ok(())
        })
        .await
    }

    /// Run a write-then-publish step under the write lock on its own task.
    async fn write<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn Store>, Arc<Broadcaster>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let lock = Arc::clone(&self.write_lock);
        let work = op(Arc::clone(&self.store), Arc::clone(&self.broadcaster));

        let task = tokio::spawn(async move {
            let _guard = lock.lock().await;
            work.await
        });

        task.await.map_err(|e| {
            error!(error = %e, "Write task failed");
            StoreError::Unavailable(format!("write task failed: {e}"))
        })?
    }

    /// The current snapshot of surviving messages, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn history(&self) -> Result<Vec<Message>, StoreError> {
        self.store.list_all().await
    }
}
