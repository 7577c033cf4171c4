//! Subscription registry shared by every clone of a `StreamClient`.
//!
//! The registry maps subscription ids to cancellation signals. The map lock
//! is only held while inserting, removing, or flipping signals, never across
//! network I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{watch, Notify};

use crate::stream::client::StreamClientError;
use crate::stream::proto::Topics;

/// Snapshot of an active subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Caller-chosen subscription id.
    pub id: u64,
    /// Requested topics.
    pub topics: Topics,
    /// Whether the subscription uses the combined endpoint.
    pub combined: bool,
    /// Whether cancellation has been requested.
    pub cancelled: bool,
}

/// Observer side of a subscription's cancellation flag.
///
/// The flag only ever moves from unset to set.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Returns `true` once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation was requested.
    ///
    /// Also resolves if the registry entry was dropped.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

struct Entry {
    topics: Topics,
    signal: watch::Sender<bool>,
}

impl Entry {
    fn cancel(&self) {
        self.signal.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    idle: Notify,
}

impl SubscriptionRegistry {
    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts `id`, rejecting ids that are already active.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: u64,
        topics: &Topics,
    ) -> Result<Registration, StreamClientError> {
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return Err(StreamClientError::DuplicateSubscription(id));
        }

        let (signal, rx) = watch::channel(false);
        entries.insert(
            id,
            Entry {
                topics: topics.clone(),
                signal,
            },
        );
        Ok(Registration {
            registry: Arc::clone(self),
            id,
            signal: CancelSignal { rx },
        })
    }

    /// Sets the cancellation flag for `id`. Returns `false` for unknown ids.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        match self.entries().get(&id) {
            Some(entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Sets every active flag and returns the affected ids.
    pub(crate) fn cancel_all(&self) -> Vec<u64> {
        let entries = self.entries();
        let mut ids = Vec::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            entry.cancel();
            ids.push(*id);
        }
        ids.sort_unstable();
        ids
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries().contains_key(&id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<_> = self
            .entries()
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: *id,
                topics: entry.topics.clone(),
                combined: entry.topics.is_combined(),
                cancelled: entry.is_cancelled(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Waits until no subscription is registered.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn remove(&self, id: u64) {
        let now_empty = {
            let mut entries = self.entries();
            entries.remove(&id);
            entries.is_empty()
        };
        if now_empty {
            self.idle.notify_waiters();
        }
    }
}

/// Registry entry held by a running subscription.
///
/// Dropping it removes the entry, which frees the id for reuse.
pub(crate) struct Registration {
    registry: Arc<SubscriptionRegistry>,
    id: u64,
    signal: CancelSignal,
}

impl Registration {
    pub(crate) fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
