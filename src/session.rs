use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::scrape::{ResolvedLink, SearchCandidate};

/// Where a conversation's flow currently is. No session at all means no
/// flow in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingTitleSelection,
    AwaitingLinkSelection,
    AwaitingDeliveryChoice,
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub stage: Stage,
    /// First 10 search hits, kept for reference through later stages.
    pub candidates: Vec<SearchCandidate>,
    pub resolved_links: Vec<ResolvedLink>,
    pub selected_candidate: Option<SearchCandidate>,
    pub selected_link: Option<ResolvedLink>,
    last_activity: Instant,
}

impl ConversationSession {
    pub fn new(candidates: Vec<SearchCandidate>) -> Self {
        Self {
            stage: Stage::AwaitingTitleSelection,
            candidates,
            resolved_links: Vec::new(),
            selected_candidate: None,
            selected_link: None,
            last_activity: Instant::now(),
        }
    }

    /// Refresh the staleness clock; called on every stage transition.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.last_activity.elapsed() >= ttl
    }
}

pub type SessionSlot = Arc<Mutex<Option<ConversationSession>>>;

/// Keyed per-conversation session storage. Every conversation gets a slot
/// whose lock serializes all mutations for that key, so two rapid replies
/// in the same conversation are handled strictly one after the other. The
/// outer map lock is only held long enough to find or insert a slot.
pub struct SessionStore {
    slots: Mutex<HashMap<String, SessionSlot>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The slot for a conversation, created empty on first use.
    pub async fn slot(&self, conversation_id: &str) -> SessionSlot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Snapshot of a conversation's session, honoring expiry.
    pub async fn get(&self, conversation_id: &str) -> Option<ConversationSession> {
        let slot = self.slot(conversation_id).await;
        let guard = slot.lock().await;
        guard.clone().filter(|s| !s.is_expired(self.ttl))
    }

    /// Evict expired sessions and drop slots nobody holds. Returns the
    /// number of sessions evicted. A slot that is currently locked is in
    /// active use and is skipped rather than waited on.
    pub async fn sweep_expired(&self) -> usize {
        let mut evicted = 0;
        let mut slots = self.slots.lock().await;
        let mut dead_keys = Vec::new();
        for (key, slot) in slots.iter() {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.as_ref().is_some_and(|s| s.is_expired(self.ttl)) {
                *guard = None;
                evicted += 1;
            }
            if guard.is_none() && Arc::strong_count(slot) == 1 {
                dead_keys.push(key.clone());
            }
        }
        for key in dead_keys {
            slots.remove(&key);
        }
        if evicted > 0 {
            debug!(evicted, "expired sessions swept");
        }
        evicted
    }

    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str) -> SearchCandidate {
        SearchCandidate {
            title: title.to_string(),
            detail_uri: format!("https://site.example/{title}"),
        }
    }

    #[tokio::test]
    async fn test_slot_is_shared_per_conversation() {
        let store = SessionStore::new(Duration::from_secs(600));
        let a = store.slot("chat-1").await;
        let b = store.slot("chat-1").await;
        assert!(Arc::ptr_eq(&a, &b));
        let other = store.slot("chat-2").await;
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_get_returns_live_session() {
        let store = SessionStore::new(Duration::from_secs(600));
        let slot = store.slot("chat-1").await;
        *slot.lock().await = Some(ConversationSession::new(vec![candidate("inception")]));

        let session = store.get("chat-1").await.expect("session should be live");
        assert_eq!(session.stage, Stage::AwaitingTitleSelection);
        assert_eq!(session.candidates.len(), 1);
        assert!(store.get("chat-2").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_reads_as_absent() {
        let store = SessionStore::new(Duration::ZERO);
        let slot = store.slot("chat-1").await;
        *slot.lock().await = Some(ConversationSession::new(vec![candidate("inception")]));

        assert!(store.get("chat-1").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_and_drops_slots() {
        let store = SessionStore::new(Duration::ZERO);
        {
            let slot = store.slot("chat-1").await;
            *slot.lock().await = Some(ConversationSession::new(vec![candidate("inception")]));
        }
        // Eviction empties the slot, and with nobody holding it the slot
        // itself goes too.
        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_sessions() {
        let store = SessionStore::new(Duration::from_secs(600));
        let slot = store.slot("chat-1").await;
        *slot.lock().await = Some(ConversationSession::new(vec![candidate("inception")]));

        assert_eq!(store.sweep_expired().await, 0);
        assert!(store.get("chat-1").await.is_some());
    }
}
