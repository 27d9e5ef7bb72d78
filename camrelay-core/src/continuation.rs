//! One-shot continuations keyed by the condition they wait for
//!
//! A continuation runs at most once: draining a condition removes every
//! continuation registered for it before the caller runs them.

use std::fmt::Debug;
use tracing::debug;

/// Pending continuations, grouped by awaited condition
#[derive(Debug, Clone)]
pub struct PendingContinuations<K, C> {
    entries: Vec<(K, C)>,
}

impl<K, C> Default for PendingContinuations<K, C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K, C> PendingContinuations<K, C>
where
    K: Copy + PartialEq + Debug,
    C: PartialEq + Debug,
{
    /// Create an empty continuation list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a continuation for `key`.
    ///
    /// Returns `false` when the same continuation is already waiting on the
    /// same key; it is not registered twice.
    pub fn register(&mut self, key: K, continuation: C) -> bool {
        if self
            .entries
            .iter()
            .any(|(k, c)| *k == key && *c == continuation)
        {
            debug!("Continuation {:?} already pending on {:?}", continuation, key);
            return false;
        }
        self.entries.push((key, continuation));
        true
    }

    /// Remove and return all continuations waiting on `key`, in registration order
    pub fn drain(&mut self, key: K) -> Vec<C> {
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (k, c) in self.entries.drain(..) {
            if k == key {
                drained.push(c);
            } else {
                kept.push((k, c));
            }
        }
        self.entries = kept;
        drained
    }

    /// Drop all continuations waiting on `key`, returning how many were dropped
    pub fn cancel(&mut self, key: K) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        before - self.entries.len()
    }

    /// Whether anything is waiting on `key`
    pub fn is_pending(&self, key: K) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Drop every pending continuation
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of pending continuations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Awaited {
        Ready,
        Open,
    }

    #[test]
    fn test_drain_fires_once() {
        let mut pending = PendingContinuations::new();
        assert!(pending.register(Awaited::Open, "start"));

        assert_eq!(pending.drain(Awaited::Open), vec!["start"]);
        assert!(pending.drain(Awaited::Open).is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let mut pending = PendingContinuations::new();
        assert!(pending.register(Awaited::Open, "start"));
        assert!(!pending.register(Awaited::Open, "start"));
        assert!(pending.register(Awaited::Ready, "start"));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_drain_only_touches_its_key() {
        let mut pending = PendingContinuations::new();
        pending.register(Awaited::Ready, "connect");
        pending.register(Awaited::Open, "record");
        pending.register(Awaited::Ready, "preview");

        assert_eq!(pending.drain(Awaited::Ready), vec!["connect", "preview"]);
        assert!(pending.is_pending(Awaited::Open));
        assert!(!pending.is_pending(Awaited::Ready));
    }

    #[test]
    fn test_cancel_and_clear() {
        let mut pending = PendingContinuations::new();
        pending.register(Awaited::Open, "record");
        pending.register(Awaited::Ready, "connect");

        assert_eq!(pending.cancel(Awaited::Open), 1);
        assert_eq!(pending.cancel(Awaited::Open), 0);

        pending.clear();
        assert!(pending.is_empty());
    }
}
