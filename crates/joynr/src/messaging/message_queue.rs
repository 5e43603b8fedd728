// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Parking queue for messages whose destination is not yet resolvable.
//!
//! Messages are keyed by destination participant id and kept in enqueue
//! order; [`MessageQueue::take`] hands them back FIFO so per-destination
//! ordering survives a deferred resolution. Both the global size and the
//! per-destination size are bounded. When the global bound is hit the
//! queued message closest to its expiry is evicted first.

use crate::error::{Error, Result};
use crate::messaging::ImmutableMessage;
use crate::util::time::{now_ms, TimePoint};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

struct QueuedMessage {
    message: Arc<ImmutableMessage>,
    #[allow(dead_code)]
    enqueue_ms: TimePoint,
}

#[derive(Default)]
struct Queues {
    by_destination: HashMap<String, VecDeque<QueuedMessage>>,
    total: usize,
}

/// Bounded multimap of destination participant id -> pending messages.
pub struct MessageQueue {
    queues: Mutex<Queues>,
    max_total: usize,
    max_per_destination: usize,
}

impl MessageQueue {
    #[must_use]
    pub fn new(max_total: usize, max_per_destination: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            max_total: max_total.max(1),
            max_per_destination: max_per_destination.max(1),
        }
    }

    /// Park a message for its (unresolved) recipient.
    ///
    /// An already-expired message is refused outright. When the
    /// per-destination bound is hit the message is refused; when only the
    /// global bound is hit, the queued message with the earliest expiry is
    /// evicted to make room.
    pub fn push(&self, message: Arc<ImmutableMessage>) -> Result<()> {
        if message.is_expired() {
            return Err(Error::MessageExpired(message.id.clone()));
        }
        let mut queues = self.queues.lock();
        let destination = message.recipient.clone();
        let per_dest = queues
            .by_destination
            .get(&destination)
            .map_or(0, VecDeque::len);
        if per_dest >= self.max_per_destination {
            log::warn!(
                "[MSGQUEUE] per-destination limit ({}) reached for {}, dropping message {}",
                self.max_per_destination,
                destination,
                message.id
            );
            return Err(Error::SendFailed(format!(
                "message queue full for destination {}",
                destination
            )));
        }
        if queues.total >= self.max_total {
            Self::evict_earliest_expiry(&mut queues);
        }
        queues
            .by_destination
            .entry(destination)
            .or_default()
            .push_back(QueuedMessage {
                message,
                enqueue_ms: now_ms(),
            });
        queues.total += 1;
        Ok(())
    }

    /// Remove and return all messages parked for `participant_id`, in
    /// enqueue order.
    #[must_use]
    pub fn take(&self, participant_id: &str) -> Vec<Arc<ImmutableMessage>> {
        let mut queues = self.queues.lock();
        match queues.by_destination.remove(participant_id) {
            Some(pending) => {
                queues.total -= pending.len();
                pending.into_iter().map(|q| q.message).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop every queued message whose expiry has passed. Returns count.
    pub fn purge_expired(&self) -> usize {
        let mut queues = self.queues.lock();
        let mut removed = 0;
        queues.by_destination.retain(|destination, pending| {
            let before = pending.len();
            pending.retain(|q| !q.message.is_expired());
            let dropped = before - pending.len();
            if dropped > 0 {
                log::debug!(
                    "[MSGQUEUE] dropped {} expired messages for {}",
                    dropped,
                    destination
                );
            }
            removed += dropped;
            !pending.is_empty()
        });
        queues.total -= removed;
        removed
    }

    /// Whether any message is parked for the given destination.
    #[must_use]
    pub fn has_messages_for(&self, participant_id: &str) -> bool {
        self.queues
            .lock()
            .by_destination
            .contains_key(participant_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.lock().total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_earliest_expiry(queues: &mut Queues) {
        let victim = queues
            .by_destination
            .iter()
            .filter_map(|(dest, pending)| {
                pending
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, q)| q.message.expiry_date_ms)
                    .map(|(idx, q)| (dest.clone(), idx, q.message.expiry_date_ms))
            })
            .min_by_key(|&(_, _, expiry)| expiry);
        if let Some((dest, idx, _)) = victim {
            if let Some(pending) = queues.by_destination.get_mut(&dest) {
                if let Some(evicted) = pending.remove(idx) {
                    log::warn!(
                        "[MSGQUEUE] global limit reached, evicting message {} for {}",
                        evicted.message.id,
                        dest
                    );
                    queues.total -= 1;
                }
                if pending.is_empty() {
                    queues.by_destination.remove(&dest);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageType;

    fn msg(recipient: &str, ttl_ms: u64) -> Arc<ImmutableMessage> {
        ImmutableMessage::new(MessageType::Request, "sender", recipient, ttl_ms, vec![])
    }

    #[test]
    fn test_fifo_per_destination() {
        let queue = MessageQueue::new(100, 100);
        let first = msg("p1", 60_000);
        let second = msg("p1", 60_000);
        let third = msg("p1", 60_000);
        queue.push(first.clone()).unwrap();
        queue.push(second.clone()).unwrap();
        queue.push(third.clone()).unwrap();
        let drained: Vec<String> = queue.take("p1").iter().map(|m| m.id.clone()).collect();
        assert_eq!(drained, vec![first.id.clone(), second.id.clone(), third.id.clone()]);
        assert!(queue.take("p1").is_empty());
    }

    #[test]
    fn test_expired_message_refused() {
        let queue = MessageQueue::new(10, 10);
        let dead = msg("p1", 0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(matches!(queue.push(dead), Err(Error::MessageExpired(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_per_destination_bound() {
        let queue = MessageQueue::new(100, 2);
        queue.push(msg("p1", 60_000)).unwrap();
        queue.push(msg("p1", 60_000)).unwrap();
        assert!(queue.push(msg("p1", 60_000)).is_err());
        // Other destinations unaffected.
        queue.push(msg("p2", 60_000)).unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_global_bound_evicts_earliest_expiry() {
        let queue = MessageQueue::new(2, 10);
        let soon = msg("p1", 5_000);
        queue.push(soon.clone()).unwrap();
        queue.push(msg("p2", 60_000)).unwrap();
        queue.push(msg("p3", 60_000)).unwrap();
        assert_eq!(queue.len(), 2);
        // p1 held the earliest expiry and was evicted.
        assert!(queue.take("p1").is_empty());
        assert_eq!(queue.take("p2").len(), 1);
        assert_eq!(queue.take("p3").len(), 1);
    }

    #[test]
    fn test_purge_expired() {
        let queue = MessageQueue::new(10, 10);
        queue.push(msg("p1", 1)).unwrap();
        queue.push(msg("p1", 60_000)).unwrap();
        queue.push(msg("p2", 60_000)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(queue.purge_expired(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take("p1").len(), 1);
    }
}
