// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Message routing engine.
//!
//! Resolves a message's recipient to a transport address and hands it to
//! the matching stub. Destinations without a route are parked in the
//! [`MessageQueue`]; if a parent router is configured (leaf/library mode)
//! the recipient is resolved through it asynchronously, with concurrent
//! resolves for one participant deduplicated. Delivery attempts run as
//! decay-time-bounded runnables on the [`DelayedScheduler`]: a retryable
//! transport failure reschedules at the configured fixed retry interval
//! until the message's own expiry (retry-until-TTL, no attempt cap).
//!
//! Multicast receiver registration is reference counted; only the first
//! local receiver of a multicast id triggers the transport-level (or
//! parent-delegated) subscribe, only the last one the unsubscribe.

use crate::config::MessagingSettings;
use crate::error::{Error, OnError, OnSuccess, Result};
use crate::messaging::address::Address;
use crate::messaging::message_queue::MessageQueue;
use crate::messaging::multicast::MulticastReceiverDirectory;
use crate::messaging::routing_table::{RoutingEntry, RoutingTable};
use crate::messaging::stub::MessagingStubFactory;
use crate::messaging::{ImmutableMessage, MessageType};
use crate::scheduler::{DelayedScheduler, Runnable, ScheduleHandle};
use crate::util::time::{now_ms, TimePoint};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ============================================================================
// Collaborator interfaces
// ============================================================================

/// Asynchronous proxy to the parent router of a leaf (library) process.
///
/// All operations report their outcome through callbacks; the core
/// tolerates the parent being entirely absent (root router mode).
pub trait RoutingProxy: Send + Sync {
    fn add_next_hop_async(
        &self,
        participant_id: &str,
        is_globally_visible: bool,
        on_success: OnSuccess,
        on_error: OnError,
    );
    fn remove_next_hop_async(&self, participant_id: &str, on_success: OnSuccess, on_error: OnError);
    /// Asks the parent whether it can route to the participant.
    fn resolve_next_hop_async(
        &self,
        participant_id: &str,
        on_resolved: Box<dyn FnOnce(bool) + Send>,
        on_error: OnError,
    );
    fn add_multicast_receiver_async(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    );
    fn remove_multicast_receiver_async(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    );
}

/// Transport hook for topic-level multicast membership (e.g. an MQTT
/// subscribe). Only invoked on first-receiver/last-receiver edges.
pub trait TransportMulticastSubscriber: Send + Sync {
    fn subscribe(&self, multicast_id: &str);
    fn unsubscribe(&self, multicast_id: &str);
}

/// The slice of the router the consumer-side subscription manager needs.
pub trait MulticastRouting: Send + Sync {
    fn add_multicast_receiver(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    );
    fn remove_multicast_receiver(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    );
}

struct ParentRouter {
    proxy: Arc<dyn RoutingProxy>,
    /// Next-hop address used for participants the parent resolved.
    address: Address,
}

// ============================================================================
// MessageRouter
// ============================================================================

/// Central routing engine.
pub struct MessageRouter {
    routing_table: Arc<RoutingTable>,
    message_queue: MessageQueue,
    scheduler: Arc<DelayedScheduler>,
    stub_factory: Arc<MessagingStubFactory>,
    parent: Option<ParentRouter>,
    multicast_subscriber: Option<Arc<dyn TransportMulticastSubscriber>>,
    multicast_receivers: MulticastReceiverDirectory,
    /// Participants with an in-flight parent resolution (dedup guard).
    resolving: Mutex<HashSet<String>>,
    /// Terminal failure callbacks keyed by message id, pruned at expiry.
    failure_callbacks: Mutex<HashMap<String, (TimePoint, OnError)>>,
    retry_interval: Duration,
    cleanup_interval: Duration,
    cleanup_handle: Mutex<ScheduleHandle>,
    shutting_down: AtomicBool,
    self_ref: Weak<MessageRouter>,
}

impl MessageRouter {
    /// Build a router and start its periodic cleanup sweep.
    ///
    /// `parent` is the `(proxy, parent address)` pair of a leaf router;
    /// `None` makes this the root router. `multicast_subscriber` is the
    /// optional transport-level topic membership hook.
    #[must_use]
    pub fn new(
        settings: &MessagingSettings,
        routing_table: Arc<RoutingTable>,
        scheduler: Arc<DelayedScheduler>,
        stub_factory: Arc<MessagingStubFactory>,
        parent: Option<(Arc<dyn RoutingProxy>, Address)>,
        multicast_subscriber: Option<Arc<dyn TransportMulticastSubscriber>>,
    ) -> Arc<Self> {
        let router = Arc::new_cyclic(|self_ref| Self {
            routing_table,
            message_queue: MessageQueue::new(
                settings.max_queued_messages,
                settings.max_queued_messages_per_participant,
            ),
            scheduler,
            stub_factory,
            parent: parent.map(|(proxy, address)| ParentRouter { proxy, address }),
            multicast_subscriber,
            multicast_receivers: MulticastReceiverDirectory::new(),
            resolving: Mutex::new(HashSet::new()),
            failure_callbacks: Mutex::new(HashMap::new()),
            retry_interval: Duration::from_millis(settings.send_msg_retry_interval_ms),
            cleanup_interval: Duration::from_millis(settings.routing_cleanup_interval_ms),
            cleanup_handle: Mutex::new(ScheduleHandle::INVALID),
            shutting_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        router.schedule_cleanup();
        router
    }

    /// Route a message toward its recipient.
    ///
    /// Unknown destinations are parked (and resolved via the parent when
    /// one is configured); the call itself only fails for messages that
    /// are already expired or when the queue refuses the message.
    pub fn route(&self, message: Arc<ImmutableMessage>) -> Result<()> {
        self.route_with_try(message, 0)
    }

    /// Like [`MessageRouter::route`], registering a terminal failure
    /// callback invoked exactly once if the message can never be
    /// delivered (expired, unroutable, non-retryable transport error).
    pub fn route_with_failure_callback(
        &self,
        message: Arc<ImmutableMessage>,
        on_failure: OnError,
    ) -> Result<()> {
        self.failure_callbacks
            .lock()
            .insert(message.id.clone(), (message.expiry_date_ms, on_failure));
        self.route_with_try(message, 0)
    }

    fn route_with_try(&self, message: Arc<ImmutableMessage>, try_count: u32) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if message.is_expired() {
            let id = message.id.clone();
            self.fail_message(&message, Error::MessageExpired(id.clone()));
            return Err(Error::MessageExpired(id));
        }
        if message.msg_type == MessageType::Multicast {
            return self.route_multicast(&message);
        }
        match self.routing_table.lookup(&message.recipient) {
            Some(address) => {
                self.schedule_send(message, address, try_count, Duration::ZERO);
                Ok(())
            }
            None => self.park_and_resolve(message),
        }
    }

    fn park_and_resolve(&self, message: Arc<ImmutableMessage>) -> Result<()> {
        let recipient = message.recipient.clone();
        log::debug!(
            "[ROUTER] no route for {}, queueing message {}",
            recipient,
            message.id
        );
        self.message_queue.push(message)?;
        let Some(parent) = &self.parent else {
            // Root router: delivery happens once discovery adds the hop.
            return Ok(());
        };
        // Deduplicate concurrent resolves per participant.
        if !self.resolving.lock().insert(recipient.clone()) {
            return Ok(());
        }
        let weak = self.self_ref.clone();
        let resolved_id = recipient.clone();
        let failed_id = recipient.clone();
        let weak_err = self.self_ref.clone();
        parent.proxy.resolve_next_hop_async(
            &recipient,
            Box::new(move |found| {
                if let Some(router) = weak.upgrade() {
                    router.on_parent_resolved(&resolved_id, found);
                }
            }),
            Box::new(move |error| {
                if let Some(router) = weak_err.upgrade() {
                    router.on_parent_resolve_failed(&failed_id, &error);
                }
            }),
        );
        Ok(())
    }

    fn on_parent_resolved(&self, participant_id: &str, found: bool) {
        self.resolving.lock().remove(participant_id);
        if !found {
            log::warn!("[ROUTER] parent cannot resolve {}", participant_id);
            self.drop_queued(participant_id);
            return;
        }
        let parent_address = match &self.parent {
            Some(parent) => parent.address.clone(),
            None => return,
        };
        self.routing_table.put(
            participant_id,
            RoutingEntry {
                address: parent_address,
                is_globally_visible: false,
                expiry_date_ms: crate::util::time::NO_EXPIRY,
                is_sticky: false,
            },
        );
        self.flush_queue(participant_id);
    }

    fn on_parent_resolve_failed(&self, participant_id: &str, error: &Error) {
        log::warn!(
            "[ROUTER] parent resolution for {} failed: {}",
            participant_id,
            error
        );
        self.resolving.lock().remove(participant_id);
        self.drop_queued(participant_id);
    }

    /// Deliver every message parked for a now-resolvable participant, in
    /// enqueue order.
    fn flush_queue(&self, participant_id: &str) {
        for message in self.message_queue.take(participant_id) {
            if let Err(e) = self.route_with_try(message, 0) {
                log::debug!("[ROUTER] flush of {} dropped a message: {}", participant_id, e);
            }
        }
    }

    fn drop_queued(&self, participant_id: &str) {
        for message in self.message_queue.take(participant_id) {
            self.fail_message(
                &message,
                Error::NoRouteAvailable(participant_id.to_string()),
            );
        }
    }

    // ========================================================================
    // Delivery + retry
    // ========================================================================

    fn schedule_send(
        &self,
        message: Arc<ImmutableMessage>,
        address: Address,
        try_count: u32,
        delay: Duration,
    ) {
        let runnable = MessageRunnable {
            message,
            address,
            try_count,
            router: self.self_ref.clone(),
        };
        self.scheduler.schedule(Box::new(runnable), delay);
    }

    fn try_transmit(&self, message: Arc<ImmutableMessage>, address: Address, try_count: u32) {
        if message.is_expired() {
            let id = message.id.clone();
            self.fail_message(&message, Error::MessageExpired(id));
            return;
        }
        let stub = match self.stub_factory.create(&address) {
            Ok(stub) => stub,
            Err(e) => {
                // Address errors are never retryable.
                self.fail_message(&message, e);
                return;
            }
        };
        let weak = self.self_ref.clone();
        let retry_message = Arc::clone(&message);
        let retry_address = address.clone();
        stub.transmit(
            message,
            Box::new(move |error| {
                if let Some(router) = weak.upgrade() {
                    router.on_transmit_failure(retry_message, retry_address, try_count, error);
                } else {
                    log::debug!("[ROUTER] transmit failure after router teardown: {}", error);
                }
            }),
        );
    }

    fn on_transmit_failure(
        &self,
        message: Arc<ImmutableMessage>,
        address: Address,
        try_count: u32,
        error: Error,
    ) {
        if error.is_retryable() && !message.best_effort {
            let next_attempt = now_ms().saturating_add(self.retry_interval.as_millis() as u64);
            if next_attempt < message.expiry_date_ms {
                log::debug!(
                    "[ROUTER] retryable failure for message {} (try {}): {}, retrying in {:?}",
                    message.id,
                    try_count,
                    error,
                    self.retry_interval
                );
                self.schedule_send(message, address, try_count + 1, self.retry_interval);
                return;
            }
            let id = message.id.clone();
            self.fail_message(&message, Error::MessageExpired(id));
            return;
        }
        self.fail_message(&message, error);
    }

    /// Report a terminal failure through the message's callback, once.
    fn fail_message(&self, message: &ImmutableMessage, error: Error) {
        let callback = self.failure_callbacks.lock().remove(&message.id);
        match callback {
            Some((_, on_failure)) => on_failure(error),
            None => {
                log::warn!("[ROUTER] dropping message {}: {}", message.id, error);
            }
        }
    }

    // ========================================================================
    // Next-hop management
    // ========================================================================

    /// Insert/update a route and deliver anything parked for it.
    ///
    /// The precedence/sticky rule of the routing table applies; a refused
    /// lower-precedence update still counts as success toward the caller.
    /// Unless the entry is sticky or in-process-only, the hop is also
    /// propagated to the parent router; a parent failure reaches
    /// `on_error` without rolling back the local entry.
    pub fn add_next_hop(
        &self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
        expiry_date_ms: TimePoint,
        is_sticky: bool,
        on_success: Option<OnSuccess>,
        on_error: Option<OnError>,
    ) {
        let propagate = !is_sticky && !matches!(address, Address::InProcess { .. });
        self.routing_table.put(
            participant_id,
            RoutingEntry {
                address,
                is_globally_visible,
                expiry_date_ms,
                is_sticky,
            },
        );
        self.flush_queue(participant_id);
        match &self.parent {
            Some(parent) if propagate => {
                parent.proxy.add_next_hop_async(
                    participant_id,
                    is_globally_visible,
                    on_success.unwrap_or_else(|| Box::new(|| {})),
                    on_error.unwrap_or_else(|| {
                        let id = participant_id.to_string();
                        Box::new(move |e| {
                            log::warn!("[ROUTER] parent add_next_hop for {} failed: {}", id, e);
                        })
                    }),
                );
            }
            _ => {
                if let Some(cb) = on_success {
                    cb();
                }
            }
        }
    }

    /// Delete a route. Idempotent; forwards the removal to the parent.
    pub fn remove_next_hop(
        &self,
        participant_id: &str,
        on_success: Option<OnSuccess>,
        on_error: Option<OnError>,
    ) {
        self.routing_table.remove(participant_id);
        match &self.parent {
            Some(parent) => {
                parent.proxy.remove_next_hop_async(
                    participant_id,
                    on_success.unwrap_or_else(|| Box::new(|| {})),
                    on_error.unwrap_or_else(|| {
                        let id = participant_id.to_string();
                        Box::new(move |e| {
                            log::warn!("[ROUTER] parent remove_next_hop for {} failed: {}", id, e);
                        })
                    }),
                );
            }
            None => {
                if let Some(cb) = on_success {
                    cb();
                }
            }
        }
    }

    /// Whether a route for the participant is currently known. Pure
    /// lookup, no resolution side effects.
    #[must_use]
    pub fn resolve_next_hop(&self, participant_id: &str) -> bool {
        self.routing_table.contains(participant_id)
    }

    #[must_use]
    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    /// Messages currently parked for unresolved destinations.
    #[must_use]
    pub fn queued_message_count(&self) -> usize {
        self.message_queue.len()
    }

    // ========================================================================
    // Multicast
    // ========================================================================

    fn route_multicast(&self, message: &Arc<ImmutableMessage>) -> Result<()> {
        let multicast_id = &message.recipient;
        let receivers = self.multicast_receivers.receivers(multicast_id);
        log::debug!(
            "[ROUTER] fanning out multicast {} to {} local receivers",
            multicast_id,
            receivers.len()
        );
        for receiver in receivers {
            match self.routing_table.lookup(&receiver) {
                Some(address) => {
                    self.schedule_send(Arc::clone(message), address, 0, Duration::ZERO);
                }
                None => {
                    log::debug!(
                        "[ROUTER] multicast receiver {} has no route, skipping",
                        receiver
                    );
                }
            }
        }
        // A publication from a local provider also travels up to the
        // parent so remote receivers get their copy.
        if let Some(parent) = &self.parent {
            if matches!(
                self.routing_table.lookup(&message.sender),
                Some(Address::InProcess { .. })
            ) {
                self.schedule_send(
                    Arc::clone(message),
                    parent.address.clone(),
                    0,
                    Duration::ZERO,
                );
            }
        }
        Ok(())
    }

    fn do_add_multicast_receiver(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    ) {
        let provider_in_process = matches!(
            self.routing_table.lookup(provider_participant_id),
            Some(Address::InProcess { .. })
        );
        let first = self
            .multicast_receivers
            .register(multicast_id, subscriber_participant_id);
        if !first || provider_in_process {
            on_success();
            return;
        }
        if let Some(parent) = &self.parent {
            // Transient parent failures are reported to the caller; no
            // automatic retry at this layer.
            let weak = self.self_ref.clone();
            let mc = multicast_id.to_string();
            let sub = subscriber_participant_id.to_string();
            parent.proxy.add_multicast_receiver_async(
                multicast_id,
                subscriber_participant_id,
                provider_participant_id,
                on_success,
                Box::new(move |error| {
                    if let Some(router) = weak.upgrade() {
                        router.multicast_receivers.unregister(&mc, &sub);
                    }
                    on_error(error);
                }),
            );
            return;
        }
        if let Some(subscriber) = &self.multicast_subscriber {
            subscriber.subscribe(multicast_id);
        }
        on_success();
    }

    fn do_remove_multicast_receiver(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    ) {
        let last = self
            .multicast_receivers
            .unregister(multicast_id, subscriber_participant_id);
        let provider_in_process = matches!(
            self.routing_table.lookup(provider_participant_id),
            Some(Address::InProcess { .. })
        );
        if !last || provider_in_process {
            on_success();
            return;
        }
        if let Some(parent) = &self.parent {
            parent.proxy.remove_multicast_receiver_async(
                multicast_id,
                subscriber_participant_id,
                provider_participant_id,
                on_success,
                on_error,
            );
            return;
        }
        if let Some(subscriber) = &self.multicast_subscriber {
            subscriber.unsubscribe(multicast_id);
        }
        on_success();
    }

    // ========================================================================
    // Cleanup + shutdown
    // ========================================================================

    fn schedule_cleanup(&self) {
        let weak = self.self_ref.clone();
        let handle = self.scheduler.schedule_fn(self.cleanup_interval, move || {
            if let Some(router) = weak.upgrade() {
                router.on_cleanup_timer();
            }
        });
        *self.cleanup_handle.lock() = handle;
    }

    /// Periodic sweep: expired queued messages, expired routing entries,
    /// stale terminal callbacks, orphaned resolution markers.
    fn on_cleanup_timer(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        self.message_queue.purge_expired();
        self.routing_table.purge_expired();
        let stale: Vec<OnError> = {
            let mut callbacks = self.failure_callbacks.lock();
            let now = now_ms();
            let ids: Vec<String> = callbacks
                .iter()
                .filter(|(_, (expiry, _))| *expiry <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| callbacks.remove(&id).map(|(_, cb)| cb))
                .collect()
        };
        for on_failure in stale {
            on_failure(Error::MessageExpired("expired before delivery".into()));
        }
        {
            let mut resolving = self.resolving.lock();
            resolving.retain(|id| self.message_queue.has_messages_for(id));
        }
        self.schedule_cleanup();
    }

    /// Stop the cleanup sweep and refuse new work. The scheduler itself
    /// is owned by the runtime and shut down there.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut handle = self.cleanup_handle.lock();
        self.scheduler.unschedule(&mut handle);
    }
}

impl MulticastRouting for MessageRouter {
    fn add_multicast_receiver(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    ) {
        self.do_add_multicast_receiver(
            multicast_id,
            subscriber_participant_id,
            provider_participant_id,
            on_success,
            on_error,
        );
    }

    fn remove_multicast_receiver(
        &self,
        multicast_id: &str,
        subscriber_participant_id: &str,
        provider_participant_id: &str,
        on_success: OnSuccess,
        on_error: OnError,
    ) {
        self.do_remove_multicast_receiver(
            multicast_id,
            subscriber_participant_id,
            provider_participant_id,
            on_success,
            on_error,
        );
    }
}

/// One delivery attempt, bound to the message's own expiry as decay time.
struct MessageRunnable {
    message: Arc<ImmutableMessage>,
    address: Address,
    try_count: u32,
    router: Weak<MessageRouter>,
}

impl Runnable for MessageRunnable {
    fn run(self: Box<Self>) {
        match self.router.upgrade() {
            Some(router) => router.try_transmit(self.message, self.address, self.try_count),
            None => {
                log::debug!(
                    "[ROUTER] dropping delivery of {} after router teardown",
                    self.message.id
                );
            }
        }
    }

    fn expiry_ms(&self) -> TimePoint {
        self.message.expiry_date_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::address::AddressKind;
    use crate::messaging::stub::MessagingStub;
    use std::sync::mpsc;
    use std::time::Duration;

    struct RecordingStub {
        tx: mpsc::Sender<String>,
    }

    impl MessagingStub for RecordingStub {
        fn transmit(&self, message: Arc<ImmutableMessage>, _on_failure: OnError) {
            let _ = self.tx.send(message.id.clone());
        }
    }

    fn router_fixture() -> (Arc<MessageRouter>, Arc<DelayedScheduler>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let factory = Arc::new(MessagingStubFactory::new());
        factory.register(
            AddressKind::WebSocketClient,
            Box::new(move |_addr: &Address| {
                Ok(Arc::new(RecordingStub { tx: tx.clone() }) as Arc<dyn MessagingStub>)
            }),
        );
        let scheduler = DelayedScheduler::new(2);
        let settings = MessagingSettings {
            routing_cleanup_interval_ms: 50,
            ..MessagingSettings::default()
        };
        let router = MessageRouter::new(
            &settings,
            Arc::new(RoutingTable::new(None)),
            Arc::clone(&scheduler),
            factory,
            None,
            None,
        );
        (router, scheduler, rx)
    }

    fn ws(id: &str) -> Address {
        Address::WebSocketClient { id: id.into() }
    }

    #[test]
    fn test_route_to_known_destination() {
        let (router, scheduler, rx) = router_fixture();
        router.add_next_hop("p1", ws("c1"), true, crate::util::time::NO_EXPIRY, false, None, None);
        let msg = ImmutableMessage::new(MessageType::Request, "me", "p1", 60_000, vec![]);
        router.route(Arc::clone(&msg)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), msg.id);
        router.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_unknown_destination_queues_until_add_next_hop() {
        let (router, scheduler, rx) = router_fixture();
        let first = ImmutableMessage::new(MessageType::Request, "me", "p1", 60_000, vec![]);
        let second = ImmutableMessage::new(MessageType::Request, "me", "p1", 60_000, vec![]);
        router.route(Arc::clone(&first)).unwrap();
        router.route(Arc::clone(&second)).unwrap();
        assert_eq!(router.queued_message_count(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        router.add_next_hop("p1", ws("c1"), true, crate::util::time::NO_EXPIRY, false, None, None);
        // Flushed in enqueue order.
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), first.id);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), second.id);
        router.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_expired_message_fails_terminally() {
        let (router, scheduler, _rx) = router_fixture();
        let msg = ImmutableMessage::new(MessageType::Request, "me", "p1", 0, vec![]);
        std::thread::sleep(Duration::from_millis(2));
        let (err_tx, err_rx) = mpsc::channel();
        let result = router.route_with_failure_callback(
            Arc::clone(&msg),
            Box::new(move |e| {
                let _ = err_tx.send(e);
            }),
        );
        assert!(result.is_err());
        match err_rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Error::MessageExpired(_) => {}
            other => panic!("expected MessageExpired, got {}", other),
        }
        router.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_resolve_next_hop_has_no_side_effects() {
        let (router, scheduler, _rx) = router_fixture();
        assert!(!router.resolve_next_hop("p1"));
        router.add_next_hop("p1", ws("c1"), true, crate::util::time::NO_EXPIRY, false, None, None);
        assert!(router.resolve_next_hop("p1"));
        router.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_remove_next_hop_idempotent() {
        let (router, scheduler, _rx) = router_fixture();
        router.add_next_hop("p1", ws("c1"), true, crate::util::time::NO_EXPIRY, false, None, None);
        router.remove_next_hop("p1", None, None);
        router.remove_next_hop("p1", None, None);
        assert!(!router.resolve_next_hop("p1"));
        router.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_transport_subscribe_once_per_multicast_edge() {
        struct RecordingSubscriber {
            subscribes: Mutex<Vec<String>>,
            unsubscribes: Mutex<Vec<String>>,
        }
        impl TransportMulticastSubscriber for RecordingSubscriber {
            fn subscribe(&self, multicast_id: &str) {
                self.subscribes.lock().push(multicast_id.to_string());
            }
            fn unsubscribe(&self, multicast_id: &str) {
                self.unsubscribes.lock().push(multicast_id.to_string());
            }
        }
        let transport = Arc::new(RecordingSubscriber {
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
        });
        let scheduler = DelayedScheduler::new(2);
        let router = MessageRouter::new(
            &MessagingSettings::default(),
            Arc::new(RoutingTable::new(None)),
            Arc::clone(&scheduler),
            Arc::new(MessagingStubFactory::new()),
            None,
            Some(Arc::clone(&transport) as Arc<dyn TransportMulticastSubscriber>),
        );
        let ok: fn() -> OnSuccess = || Box::new(|| {});
        let err: fn() -> OnError = || Box::new(|e| panic!("unexpected error: {}", e));
        // Two receivers plus a duplicate registration of the first one:
        // the transport subscribes exactly once.
        router.add_multicast_receiver("prov/tick", "sub1", "prov", ok(), err());
        router.add_multicast_receiver("prov/tick", "sub2", "prov", ok(), err());
        router.add_multicast_receiver("prov/tick", "sub1", "prov", ok(), err());
        assert_eq!(*transport.subscribes.lock(), vec!["prov/tick".to_string()]);
        // Unsubscribe only when the last receiver leaves.
        router.remove_multicast_receiver("prov/tick", "sub1", "prov", ok(), err());
        assert!(transport.unsubscribes.lock().is_empty());
        router.remove_multicast_receiver("prov/tick", "sub2", "prov", ok(), err());
        assert_eq!(*transport.unsubscribes.lock(), vec!["prov/tick".to_string()]);
        router.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_retry_until_expiry_with_transient_failures() {
        let factory = Arc::new(MessagingStubFactory::new());
        struct FlakyStub {
            attempts: Arc<std::sync::atomic::AtomicUsize>,
            delivered: mpsc::Sender<u32>,
        }
        impl MessagingStub for FlakyStub {
            fn transmit(&self, _message: Arc<ImmutableMessage>, on_failure: OnError) {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    on_failure(Error::TransportUnavailable("flaky".into()));
                } else {
                    let _ = self.delivered.send(n as u32);
                }
            }
        }
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        let attempts_clone = Arc::clone(&attempts);
        factory.register(
            AddressKind::WebSocketClient,
            Box::new(move |_addr: &Address| {
                Ok(Arc::new(FlakyStub {
                    attempts: Arc::clone(&attempts_clone),
                    delivered: done_tx.clone(),
                }) as Arc<dyn MessagingStub>)
            }),
        );
        let scheduler = DelayedScheduler::new(2);
        let settings = MessagingSettings {
            send_msg_retry_interval_ms: 20,
            ..MessagingSettings::default()
        };
        let router = MessageRouter::new(
            &settings,
            Arc::new(RoutingTable::new(None)),
            Arc::clone(&scheduler),
            factory,
            None,
            None,
        );
        router.add_next_hop("p1", ws("c1"), true, crate::util::time::NO_EXPIRY, false, None, None);
        let msg = ImmutableMessage::new(MessageType::Request, "me", "p1", 10_000, vec![]);
        router.route(msg).unwrap();
        // Two failures then success on the third attempt.
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        router.shutdown();
        scheduler.shutdown();
    }
}
