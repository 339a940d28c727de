//! In-memory work channel for tests/dev.

use std::sync::{Mutex, mpsc};

use tracing::trace;

use crate::channel::{Subscription, WorkChannel};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryChannelError {
    /// Publish failed due to internal lock poisoning.
    #[error("work channel lock poisoned")]
    Poisoned,
}

/// In-memory fan-out channel.
///
/// - No IO / no async
/// - Best-effort fan-out to every live subscriber
/// - Keeps a count of published messages for inspection
#[derive(Debug)]
pub struct InMemoryWorkChannel<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
    published: Mutex<u64>,
}

impl<M> InMemoryWorkChannel<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages published since creation.
    pub fn published_count(&self) -> u64 {
        self.published.lock().map(|n| *n).unwrap_or(0)
    }
}

impl<M> Default for InMemoryWorkChannel<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(0),
        }
    }
}

impl<M> WorkChannel<M> for InMemoryWorkChannel<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryChannelError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryChannelError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());

        let mut published = self
            .published
            .lock()
            .map_err(|_| InMemoryChannelError::Poisoned)?;
        *published += 1;
        trace!(subscribers = subs.len(), "work notification published");

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}
