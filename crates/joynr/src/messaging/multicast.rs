// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Multicast receiver directory.
//!
//! Many-to-many map of multicast id pattern to local receiver ids,
//! reference counted at the edges: only the first receiver of a pattern
//! makes [`MulticastReceiverDirectory::register`] return true (the caller
//! then performs the transport-level subscribe) and only removing the
//! last one makes [`MulticastReceiverDirectory::unregister`] return true.
//! Lookup by concrete multicast id also collects receivers registered
//! under a matching wildcard pattern.

use crate::protocol::multicast_matches;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct MulticastReceiverDirectory {
    receivers: Mutex<HashMap<String, HashSet<String>>>,
}

impl MulticastReceiverDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a receiver. Returns true when this is the first receiver for
    /// the multicast id (transport-level subscribe edge).
    pub fn register(&self, multicast_id: &str, receiver_id: &str) -> bool {
        let mut receivers = self.receivers.lock();
        let set = receivers.entry(multicast_id.to_string()).or_default();
        let newly_inserted = set.insert(receiver_id.to_string());
        newly_inserted && set.len() == 1
    }

    /// Remove a receiver. Returns true when it was the last receiver for
    /// the multicast id (transport-level unsubscribe edge). Removing an
    /// unknown pair is a no-op returning false.
    pub fn unregister(&self, multicast_id: &str, receiver_id: &str) -> bool {
        let mut receivers = self.receivers.lock();
        let Some(set) = receivers.get_mut(multicast_id) else {
            return false;
        };
        if !set.remove(receiver_id) {
            return false;
        }
        if set.is_empty() {
            receivers.remove(multicast_id);
            true
        } else {
            false
        }
    }

    /// Snapshot of the receivers whose registered pattern matches the
    /// given concrete multicast id.
    #[must_use]
    pub fn receivers(&self, multicast_id: &str) -> Vec<String> {
        let receivers = self.receivers.lock();
        let mut out: HashSet<&String> = HashSet::new();
        for (pattern, set) in receivers.iter() {
            if multicast_matches(pattern, multicast_id) {
                out.extend(set.iter());
            }
        }
        out.into_iter().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, multicast_id: &str, receiver_id: &str) -> bool {
        self.receivers
            .lock()
            .get(multicast_id)
            .is_some_and(|set| set.contains(receiver_id))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receivers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_last_edges() {
        let dir = MulticastReceiverDirectory::new();
        assert!(dir.register("m1", "r1")); // first -> subscribe
        assert!(!dir.register("m1", "r2")); // already subscribed
        assert!(!dir.unregister("m1", "r1")); // one receiver left
        assert!(dir.unregister("m1", "r2")); // last -> unsubscribe
        assert!(dir.is_empty());
    }

    #[test]
    fn test_duplicate_register_does_not_double_count() {
        let dir = MulticastReceiverDirectory::new();
        assert!(dir.register("m1", "r1"));
        assert!(!dir.register("m1", "r1"));
        // Single unregister fully removes the receiver.
        assert!(dir.unregister("m1", "r1"));
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let dir = MulticastReceiverDirectory::new();
        assert!(!dir.unregister("m1", "r1"));
        dir.register("m1", "r1");
        assert!(!dir.unregister("m1", "other"));
        assert!(dir.contains("m1", "r1"));
    }

    #[test]
    fn test_receivers_snapshot() {
        let dir = MulticastReceiverDirectory::new();
        dir.register("m1", "r1");
        dir.register("m1", "r2");
        dir.register("m2", "r3");
        let mut rx = dir.receivers("m1");
        rx.sort();
        assert_eq!(rx, vec!["r1".to_string(), "r2".to_string()]);
        assert!(dir.receivers("absent").is_empty());
    }

    #[test]
    fn test_wildcard_pattern_matches_concrete_id() {
        let dir = MulticastReceiverDirectory::new();
        dir.register("prov/tick/eu/*", "wild");
        dir.register("prov/tick/eu/de", "exact");
        let mut rx = dir.receivers("prov/tick/eu/de");
        rx.sort();
        assert_eq!(rx, vec!["exact".to_string(), "wild".to_string()]);
        assert_eq!(dir.receivers("prov/tick/us"), Vec::<String>::new());
    }
}
