//! Per-subject subscriber rooms.
//!
//! A [`Subscription`] is one live connection's membership. It belongs to
//! exactly one subject at a time and leaves its room when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::artifact::{ArtifactKey, SubjectId};

/// Message pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveMessage {
    Updated { key: ArtifactKey },
}

type Sender = mpsc::UnboundedSender<LiveMessage>;

#[derive(Default)]
struct Registry {
    rooms: HashMap<SubjectId, HashMap<u64, Sender>>,
}

/// All subscriber rooms, keyed by subject.
#[derive(Clone, Default)]
pub struct Rooms {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, subject: SubjectId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.insert(&subject, id, tx);
        debug!(subject = %subject, subscriber = id, "subscriber joined");
        Subscription {
            id,
            subject,
            rx,
            rooms: self.clone(),
        }
    }

    pub fn member_count(&self, subject: &SubjectId) -> usize {
        self.lock().rooms.get(subject).map_or(0, HashMap::len)
    }

    /// The members of `subject`'s room right now. Later joiners are not
    /// included.
    pub fn snapshot(&self, subject: &SubjectId) -> Recipients {
        let senders = self
            .lock()
            .rooms
            .get(subject)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        Recipients {
            subject: subject.clone(),
            senders,
        }
    }

    fn insert(&self, subject: &SubjectId, id: u64, tx: Sender) {
        self.lock()
            .rooms
            .entry(subject.clone())
            .or_default()
            .insert(id, tx);
    }

    fn leave(&self, subject: &SubjectId, id: u64) -> Option<Sender> {
        let mut registry = self.lock();
        let members = registry.rooms.get_mut(subject)?;
        let tx = members.remove(&id);
        if members.is_empty() {
            registry.rooms.remove(subject);
        }
        tx
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Rooms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rooms")
            .field("rooms", &self.lock().rooms.len())
            .finish()
    }
}

/// Frozen recipient list for one broadcast.
#[derive(Debug)]
pub struct Recipients {
    subject: SubjectId,
    senders: Vec<Sender>,
}

impl Recipients {
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Send `message` to every recipient. Returns how many were still
    /// connected.
    pub fn deliver(self, message: &LiveMessage) -> usize {
        let delivered = self
            .senders
            .iter()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count();
        debug!(
            subject = %self.subject,
            delivered,
            gone = self.senders.len() - delivered,
            "broadcast delivered"
        );
        delivered
    }
}

/// One connection's room membership.
pub struct Subscription {
    id: u64,
    subject: SubjectId,
    rx: mpsc::UnboundedReceiver<LiveMessage>,
    rooms: Rooms,
}

impl Subscription {
    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveMessage> {
        self.rx.try_recv().ok()
    }

    /// Move this connection to another subject's room. Messages already
    /// queued from the old room stay queued.
    pub fn resubscribe(&mut self, subject: SubjectId) {
        if subject == self.subject {
            return;
        }
        if let Some(tx) = self.rooms.leave(&self.subject, self.id) {
            self.rooms.insert(&subject, self.id, tx);
        }
        debug!(from = %self.subject, to = %subject, subscriber = self.id, "subscriber moved");
        self.subject = subject;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rooms.leave(&self.subject, self.id);
        debug!(subject = %self.subject, subscriber = self.id, "subscriber left");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .finish()
    }
}
