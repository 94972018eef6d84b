//! Call queue: one active call plus an ordered backlog
//!
//! The queue owns admitted sessions until they hang up or are evicted.
//! Waiting sessions are served strictly in enqueue order. Every operation
//! takes the queue lock once, so composite transitions such as
//! "remove then promote" are atomic with respect to concurrent handlers.

use super::session::{CallSession, Session};
use super::shared::{DomainError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Default bound on the waiting list
pub const DEFAULT_MAX_WAITING: usize = 64;

/// Outcome of moving the head of the waiting list into the current slot
#[derive(Debug)]
pub struct Promotion<S> {
    /// Session now being served
    pub current: Arc<S>,
    /// Session that occupied the current slot before, for cleanup by the caller
    pub previous: Option<Arc<S>>,
}

/// Outcome of a hang-up
#[derive(Debug)]
pub struct HangUp<S> {
    pub removed: Arc<S>,
    /// Set when the removed session was current and a waiting one took its place
    pub promoted: Option<Arc<S>>,
}

/// Serializable view of the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub current: Option<String>,
    pub waiting: Vec<String>,
}

struct QueueInner<S> {
    current: Option<Arc<S>>,
    waiting: VecDeque<Arc<S>>,
}

impl<S: Session> QueueInner<S> {
    fn contains(&self, id: &str) -> bool {
        self.current.as_ref().is_some_and(|s| s.id() == id)
            || self.waiting.iter().any(|s| s.id() == id)
    }

    fn promote(&mut self) -> Option<Promotion<S>> {
        let next = self.waiting.pop_front()?;
        let previous = self.current.replace(next.clone());
        Some(Promotion {
            current: next,
            previous,
        })
    }

    fn remove(&mut self, id: &str) -> Option<(Arc<S>, bool)> {
        if self.current.as_ref().is_some_and(|s| s.id() == id) {
            return self.current.take().map(|s| (s, true));
        }
        let position = self.waiting.iter().position(|s| s.id() == id)?;
        self.waiting.remove(position).map(|s| (s, false))
    }
}

/// In-memory call queue
pub struct CallQueue<S = CallSession> {
    inner: Mutex<QueueInner<S>>,
    max_waiting: usize,
}

impl<S: Session> CallQueue<S> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_WAITING)
    }

    /// Create a queue whose waiting list holds at most `max_waiting` sessions
    pub fn with_capacity(max_waiting: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                current: None,
                waiting: VecDeque::new(),
            }),
            max_waiting,
        }
    }

    pub fn max_waiting(&self) -> usize {
        self.max_waiting
    }

    /// Look a session up by id, checking the current slot first
    pub fn get_session(&self, id: &str) -> Result<Arc<S>> {
        let inner = self.inner.lock();
        if let Some(current) = inner.current.as_ref().filter(|s| s.id() == id) {
            return Ok(current.clone());
        }
        inner
            .waiting
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| DomainError::SessionNotFound(id.to_string()))
    }

    /// Append a session to the waiting list. The current slot is untouched.
    pub fn enqueue(&self, session: Arc<S>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.push_waiting(&mut inner, session)
    }

    fn push_waiting(&self, inner: &mut QueueInner<S>, session: Arc<S>) -> Result<()> {
        if inner.contains(session.id()) {
            return Err(DomainError::DuplicateSession(session.id().to_string()));
        }
        if inner.waiting.len() >= self.max_waiting {
            return Err(DomainError::QueueFull(self.max_waiting));
        }
        debug!(
            "Enqueued session {} at position {}",
            session.id(),
            inner.waiting.len()
        );
        inner.waiting.push_back(session);
        Ok(())
    }

    /// Move the front of the waiting list into the current slot.
    ///
    /// Returns `None` and leaves the current slot alone when nobody is waiting.
    pub fn promote(&self) -> Option<Promotion<S>> {
        let promotion = self.inner.lock().promote();
        if let Some(p) = &promotion {
            info!("Promoted session {} to current", p.current.id());
        }
        promotion
    }

    /// Drop a session from either slot
    pub fn remove(&self, id: &str) -> Result<Arc<S>> {
        let (removed, _) = self
            .inner
            .lock()
            .remove(id)
            .ok_or_else(|| DomainError::SessionNotFound(id.to_string()))?;
        debug!("Removed session {}", id);
        Ok(removed)
    }

    /// Enqueue, then promote right away if nothing is being served
    pub fn admit(&self, session: Arc<S>) -> Result<Option<Promotion<S>>> {
        let mut inner = self.inner.lock();
        self.push_waiting(&mut inner, session)?;
        if inner.current.is_none() {
            let promotion = inner.promote();
            if let Some(p) = &promotion {
                info!("Promoted session {} to current", p.current.id());
            }
            return Ok(promotion);
        }
        Ok(None)
    }

    /// Remove a session and, if it was being served, hand the slot to the next caller
    pub fn hang_up(&self, id: &str) -> Result<HangUp<S>> {
        let mut inner = self.inner.lock();
        let (removed, was_current) = inner
            .remove(id)
            .ok_or_else(|| DomainError::SessionNotFound(id.to_string()))?;

        let promoted = if was_current {
            inner.promote().map(|p| p.current)
        } else {
            None
        };

        if let Some(next) = &promoted {
            info!("Session {} hung up, promoted {}", id, next.id());
        } else {
            debug!("Session {} hung up", id);
        }

        Ok(HangUp { removed, promoted })
    }

    pub fn current(&self) -> Option<Arc<S>> {
        self.inner.lock().current.clone()
    }

    pub fn waiting_len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock();
        QueueSnapshot {
            current: inner.current.as_ref().map(|s| s.id().to_string()),
            waiting: inner.waiting.iter().map(|s| s.id().to_string()).collect(),
        }
    }
}

impl<S: Session> Default for CallQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TestSession {
        id: String,
        caller: String,
    }

    impl Session for TestSession {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn session(id: &str) -> Arc<TestSession> {
        Arc::new(TestSession {
            id: id.to_string(),
            caller: format!("sip:{}@example.com", id),
        })
    }

    #[test]
    fn test_promote_in_insertion_order() {
        let queue = CallQueue::new();
        let ids: Vec<String> = (0..10).map(|i| format!("call-{}", i)).collect();
        for id in &ids {
            queue.enqueue(session(id)).unwrap();
        }

        for id in &ids {
            assert!(queue.get_session(id).is_ok());
        }

        for id in &ids {
            let promotion = queue.promote().unwrap();
            assert_eq!(promotion.current.id(), id);
            assert_eq!(queue.current().unwrap().id(), id);
        }

        assert!(queue.promote().is_none());
        assert_eq!(queue.current().unwrap().id(), "call-9");
    }

    #[test]
    fn test_three_invites_scenario() {
        let queue = CallQueue::new();
        queue.enqueue(session("s1")).unwrap();
        queue.enqueue(session("s2")).unwrap();
        queue.enqueue(session("s3")).unwrap();

        let first = queue.promote().unwrap();
        assert_eq!(first.current.id(), "s1");
        assert!(first.previous.is_none());

        let second = queue.promote().unwrap();
        assert_eq!(second.current.id(), "s2");
        assert_eq!(second.previous.unwrap().id(), "s1");

        assert_eq!(queue.get_session("s3").unwrap().id(), "s3");
        assert!(queue.get_session("s1").is_err());
    }

    #[test]
    fn test_get_session_round_trip() {
        let queue = CallQueue::new();
        let original = session("round-trip");
        queue.enqueue(original.clone()).unwrap();

        let fetched = queue.get_session("round-trip").unwrap();
        assert!(Arc::ptr_eq(&original, &fetched));
        assert_eq!(*original, *fetched);
    }

    #[test]
    fn test_get_session_checks_current_first() {
        let queue = CallQueue::new();
        queue.enqueue(session("a")).unwrap();
        queue.promote();

        assert_eq!(queue.get_session("a").unwrap().id(), "a");
        assert_eq!(
            queue.get_session("missing").unwrap_err(),
            DomainError::SessionNotFound("missing".to_string())
        );
    }

    #[test]
    fn test_remove_missing_leaves_queue_untouched() {
        let queue = CallQueue::new();
        queue.enqueue(session("a")).unwrap();
        queue.enqueue(session("b")).unwrap();
        queue.promote();
        let before = queue.snapshot();

        let err = queue.remove("nope").unwrap_err();
        assert_eq!(err, DomainError::SessionNotFound("nope".to_string()));
        assert_eq!(queue.snapshot(), before);
    }

    #[test]
    fn test_remove_from_waiting_keeps_order() {
        let queue = CallQueue::new();
        for id in ["a", "b", "c", "d"] {
            queue.enqueue(session(id)).unwrap();
        }

        queue.remove("b").unwrap();
        assert_eq!(queue.snapshot().waiting, vec!["a", "c", "d"]);

        // Removing twice fails the second time
        assert!(queue.remove("b").is_err());

        assert_eq!(queue.promote().unwrap().current.id(), "a");
        assert_eq!(queue.promote().unwrap().current.id(), "c");
        assert_eq!(queue.promote().unwrap().current.id(), "d");
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let queue = CallQueue::new();
        queue.enqueue(session("dup")).unwrap();
        assert_eq!(
            queue.enqueue(session("dup")).unwrap_err(),
            DomainError::DuplicateSession("dup".to_string())
        );

        // Still a duplicate once it is current
        queue.promote();
        assert!(queue.enqueue(session("dup")).is_err());
        assert_eq!(queue.waiting_len(), 0);
    }

    #[test]
    fn test_waiting_list_is_bounded() {
        let queue = CallQueue::with_capacity(2);
        queue.enqueue(session("a")).unwrap();
        queue.enqueue(session("b")).unwrap();
        assert_eq!(
            queue.enqueue(session("c")).unwrap_err(),
            DomainError::QueueFull(2)
        );

        // Promotion frees a waiting slot
        queue.promote();
        queue.enqueue(session("c")).unwrap();
    }

    #[test]
    fn test_admit_promotes_when_idle() {
        let queue = CallQueue::new();

        let promotion = queue.admit(session("first")).unwrap().unwrap();
        assert_eq!(promotion.current.id(), "first");

        assert!(queue.admit(session("second")).unwrap().is_none());
        assert_eq!(queue.current().unwrap().id(), "first");
        assert_eq!(queue.snapshot().waiting, vec!["second"]);
    }

    #[test]
    fn test_hang_up_current_promotes_next() {
        let queue = CallQueue::new();
        queue.admit(session("a")).unwrap();
        queue.admit(session("b")).unwrap();
        queue.admit(session("c")).unwrap();

        let hang_up = queue.hang_up("a").unwrap();
        assert_eq!(hang_up.removed.id(), "a");
        assert_eq!(hang_up.promoted.unwrap().id(), "b");

        // A waiting caller leaving does not disturb the current call
        let hang_up = queue.hang_up("c").unwrap();
        assert!(hang_up.promoted.is_none());
        assert_eq!(queue.current().unwrap().id(), "b");

        assert!(queue.hang_up("c").is_err());
    }

    #[test]
    fn test_concurrent_admission_serves_one_call() {
        let queue = Arc::new(CallQueue::with_capacity(128));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.admit(session(&format!("c{}", i))).unwrap())
            })
            .collect();

        let promotions = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();

        assert_eq!(promotions, 1);
        assert!(queue.current().is_some());
        assert_eq!(queue.waiting_len(), 15);
    }
}
