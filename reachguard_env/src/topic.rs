//! Latest-value outbound channels.

use crate::error::EnvError;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// A named outbound channel that keeps only the most recent message.
///
/// Publishing never blocks and never fails for lack of subscribers; a slow
/// subscriber simply skips intermediate messages.
///
/// ```text
/// Publisher                  Topic                   Subscriber
///   |-- publish(v1) ---------->| [v1]                    |
///   |-- publish(v2) ---------->| [v2]                    |
///   |                          |---- latest() -> v2 ---->|
/// ```
pub struct Topic<T> {
    name: String,
    sender: watch::Sender<Option<T>>,
    published: AtomicU64,
}

impl<T: Clone + Send + Sync> Topic<T> {
    /// Creates an empty topic.
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            name: name.into(),
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Returns the topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the current message.
    pub fn publish(&self, message: T) {
        self.sender.send_replace(Some(message));
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the most recently published message, if any.
    pub fn latest(&self) -> Option<T> {
        self.sender.borrow().clone()
    }

    /// Number of messages published so far.
    pub fn publish_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Creates a new subscription that starts at the current message.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            name: self.name.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving end of a [`Topic`].
pub struct Subscription<T> {
    name: String,
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Waits for the next message and returns it.
    ///
    /// # Returns
    /// * `Ok(message)` - A message newer than the last one seen
    /// * `Err(EnvError::TopicClosed)` - The topic was dropped
    pub async fn next(&mut self) -> Result<T, EnvError> {
        loop {
            self.receiver
                .changed()
                .await
                .map_err(|_| EnvError::TopicClosed(self.name.clone()))?;
            if let Some(message) = self.receiver.borrow_and_update().clone() {
                return Ok(message);
            }
        }
    }

    /// Returns the latest message without waiting.
    pub fn latest(&self) -> Option<T> {
        self.receiver.borrow().clone()
    }
}
