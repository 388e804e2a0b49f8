use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub type SubscriberId = u64;

/// Replicas currently parked on a watch request, in arrival order.
///
/// Every mutation goes through one lock, so a broadcast sees either the
/// whole membership before a register/unregister or the whole membership
/// after it.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    inner: Mutex<Members>,
}

#[derive(Debug, Default)]
struct Members {
    next_id: SubscriberId,
    pending: BTreeMap<SubscriberId, oneshot::Sender<String>>,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a subscriber. Dropping the returned handle unregisters it.
    pub fn register(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut members = self.inner.lock();
            let id = members.next_id;
            members.next_id += 1;
            members.pending.insert(id, tx);
            id
        };
        Subscription {
            id,
            rx: Some(rx),
            registry: Arc::clone(self),
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        self.inner.lock().pending.remove(&id).is_some()
    }

    /// Hand `message` to everyone registered right now and detach them.
    /// Returns how many subscribers were still listening.
    pub fn broadcast(&self, message: &str) -> usize {
        let pending = std::mem::take(&mut self.inner.lock().pending);
        pending
            .into_values()
            .map(|tx| tx.send(message.to_string()).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One parked watch request.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: Option<oneshot::Receiver<String>>,
    registry: Arc<SubscriberRegistry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the one message this subscription will ever get. `None` if
    /// the registry went away or the message was already taken.
    pub async fn recv(&mut self) -> Option<String> {
        let rx = self.rx.take()?;
        rx.await.ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
