//! Reply Registry (C8): correlates asynchronous administrative requests
//! with their eventual result.
//!
//! Every admin request (`bind`, `unbind`, `resetSessionIds`, `initiate`, ...)
//! returns a [`Reply`] immediately. The Registry assigns a correlation id,
//! the Framer completes or errors it from its own thread, and a timeout
//! fires at `reply_timeout_ms` if nothing happens first. A Reply is
//! completed exactly once; a late completion after TIMED_OUT is dropped
//! (spec §4.4).
//!
//! Grounded on `ForwarderCommand`/`ForwarderProxyReply<T>`
//! (`services/server/src/state.rs`), which correlates a request with a
//! `oneshot::Sender` and distinguishes `Response(T)` from `Timeout`. The
//! Framer here is a synchronous single-threaded reactor rather than an
//! async task, so the oneshot channel is replaced with a polled, shared
//! `ReplyState` cell instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vg_clock::NanoTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

#[derive(Debug, Clone)]
pub enum ReplyState<T> {
    Pending,
    Completed(T),
    Errored(String),
    TimedOut,
}

impl<T> ReplyState<T> {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, ReplyState::Pending)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }
}

struct ReplyInner<T> {
    state: ReplyState<T>,
}

/// A handle to an in-flight (or resolved) administrative request. Cloning
/// shares the same underlying cell; the caller polls it from any thread.
pub struct Reply<T> {
    inner: Arc<Mutex<ReplyInner<T>>>,
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Reply { inner: self.inner.clone() }
    }
}

impl<T: Clone> Reply<T> {
    #[must_use]
    pub fn poll(&self) -> ReplyState<T> {
        self.inner.lock().expect("reply mutex poisoned").state.clone()
    }
}

struct Entry<T> {
    reply: Reply<T>,
    deadline_nanos: NanoTime,
}

/// Owns the correlation-id space and the pending-request table for one
/// payload type. The Framer (C7) holds one registry per distinct reply
/// payload and drives [`ReplyRegistry::poll_timeouts`] every duty cycle.
pub struct ReplyRegistry<T> {
    next_id: u64,
    max_inflight: usize,
    entries: HashMap<CorrelationId, Entry<T>>,
}

impl<T: Clone> ReplyRegistry<T> {
    #[must_use]
    pub fn new(max_inflight: usize) -> Self {
        ReplyRegistry { next_id: 1, max_inflight, entries: HashMap::new() }
    }

    /// Register a new request with a deadline of `now + timeout_nanos`.
    /// Returns `None` if the inbox is full (spec §4.4: "a `null` from
    /// submission indicates the inbox is full; callers must retry").
    pub fn submit(&mut self, now: NanoTime, timeout_nanos: u64) -> Option<(CorrelationId, Reply<T>)> {
        if self.entries.len() >= self.max_inflight {
            return None;
        }
        let id = CorrelationId(self.next_id);
        self.next_id += 1;
        let reply = Reply { inner: Arc::new(Mutex::new(ReplyInner { state: ReplyState::Pending })) };
        self.entries.insert(
            id,
            Entry { reply: reply.clone(), deadline_nanos: now.saturating_add(timeout_nanos) },
        );
        Some((id, reply))
    }

    /// Transition `id`'s Reply to `Completed`. No-op (and logged) if the
    /// Reply already resolved — a late completion for a timed-out request
    /// is dropped, never re-transitioned.
    pub fn complete(&mut self, id: CorrelationId, value: T) -> bool {
        self.resolve(id, ReplyState::Completed(value))
    }

    pub fn error(&mut self, id: CorrelationId, message: impl Into<String>) -> bool {
        self.resolve(id, ReplyState::Errored(message.into()))
    }

    fn resolve(&mut self, id: CorrelationId, state: ReplyState<T>) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            tracing::debug!(correlation_id = id.0, "late resolution for unknown/expired reply dropped");
            return false;
        };
        let mut inner = entry.reply.inner.lock().expect("reply mutex poisoned");
        if inner.state.is_terminal() {
            tracing::debug!(correlation_id = id.0, "reply already resolved, ignoring");
            return false;
        }
        inner.state = state;
        true
    }

    /// Transition every Pending entry whose deadline has passed to
    /// `TimedOut`; returns the ids that timed out this cycle.
    pub fn poll_timeouts(&mut self, now: NanoTime) -> Vec<CorrelationId> {
        let mut expired = Vec::new();
        self.entries.retain(|&id, entry| {
            if now < entry.deadline_nanos {
                return true;
            }
            let mut inner = entry.reply.inner.lock().expect("reply mutex poisoned");
            if inner.state.is_pending() {
                inner.state = ReplyState::TimedOut;
                expired.push(id);
            }
            false
        });
        expired
    }

    #[must_use]
    pub fn inflight(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_and_ignores_late_completion() {
        let mut registry: ReplyRegistry<&'static str> = ReplyRegistry::new(16);
        let (id, reply) = registry.submit(0, 1_000).unwrap();
        assert!(registry.complete(id, "ok"));
        assert!(matches!(reply.poll(), ReplyState::Completed("ok")));
        assert!(!registry.complete(id, "late"));
    }

    #[test]
    fn timeout_fires_after_deadline_and_drops_late_completion() {
        let mut registry: ReplyRegistry<&'static str> = ReplyRegistry::new(16);
        let (id, reply) = registry.submit(0, 1_000).unwrap();
        assert!(registry.poll_timeouts(500).is_empty());
        let expired = registry.poll_timeouts(1_500);
        assert_eq!(expired, vec![id]);
        assert!(matches!(reply.poll(), ReplyState::TimedOut));
        assert!(!registry.complete(id, "too late"));
        assert!(matches!(reply.poll(), ReplyState::TimedOut));
    }

    #[test]
    fn submit_fails_when_inbox_full() {
        let mut registry: ReplyRegistry<()> = ReplyRegistry::new(1);
        let (_id, _reply) = registry.submit(0, 1_000).unwrap();
        assert!(registry.submit(0, 1_000).is_none());
    }

    #[test]
    fn error_transitions_to_errored() {
        let mut registry: ReplyRegistry<()> = ReplyRegistry::new(4);
        let (id, reply) = registry.submit(0, 1_000).unwrap();
        registry.error(id, "UNABLE_TO_CONNECT");
        match reply.poll() {
            ReplyState::Errored(msg) => assert_eq!(msg, "UNABLE_TO_CONNECT"),
            other => panic!("expected Errored, got {other:?}"),
        }
    }
}
