// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Provider-side publication manager.
//!
//! Owns the lifecycle of every subscription targeting a locally hosted
//! provider and the scheduling of its attribute and broadcast
//! publications. Per subscription the manager guarantees:
//!
//! - a `SubscriptionReply` is sent immediately at add time, carrying a
//!   `SubscriptionException` when the requested expiry already passed
//!   (in which case no state is created at all);
//! - an initial value publication for attribute subscriptions;
//! - at most one scheduled publish runnable at any time (rapid on-change
//!   bursts coalesce, the latest value wins);
//! - a minimum pause of the QoS min interval between two publications;
//! - an end runnable at `expiry + ttl uplift` that tears the state down.
//!
//! Requests for providers that are not registered yet are parked in an
//! orphan queue (also reloaded from the persistence files at startup) and
//! replayed through [`PublicationManager::restore`].

pub mod filter;
pub mod persistence;

use crate::error::Error;
use crate::protocol::{
    BroadcastSubscriptionRequest, MulticastPublication, MulticastSubscriptionRequest,
    SubscriptionPublication, SubscriptionReply, SubscriptionRequest, MULTICAST_WILDCARD,
};
use crate::provider::{
    AttributeListener, BroadcastListener, RequestCaller, RequestInterpreterRegistry,
};
use crate::qos::SubscriptionQosKind;
use crate::scheduler::{DelayedScheduler, ScheduleHandle};
use crate::util::time::{is_expired, now_ms, remaining, uplifted, TimePoint, NO_EXPIRY};
use filter::{BroadcastFilter, BroadcastFilterChain};
use parking_lot::Mutex;
use persistence::{PersistedSubscriptionRequest, SubscriptionRequestStorage};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outbound message surface the manager publishes through. Held weakly
/// per publication: if the owner tears the sender down first, pending
/// publications are logged and dropped.
pub trait PublicationSender: Send + Sync {
    fn send_subscription_reply(
        &self,
        from_participant_id: &str,
        to_participant_id: &str,
        ttl_ms: u64,
        reply: SubscriptionReply,
    );
    fn send_subscription_publication(
        &self,
        from_participant_id: &str,
        to_participant_id: &str,
        ttl_ms: u64,
        publication: SubscriptionPublication,
    );
    fn send_multicast_publication(
        &self,
        from_participant_id: &str,
        multicast_id: &str,
        ttl_ms: u64,
        publication: MulticastPublication,
    );
}

// ============================================================================
// Internal state
// ============================================================================

struct PublicationState {
    time_of_last_publication_ms: TimePoint,
    end_handle: ScheduleHandle,
    /// Latest unpublished on-change value(s); overwritten by each change.
    pending_values: Option<Vec<Value>>,
}

/// Runtime state of one active subscription on the provider side.
struct Publication {
    proxy_participant_id: String,
    provider_participant_id: String,
    sender: Weak<dyn PublicationSender>,
    request_caller: Arc<dyn RequestCaller>,
    attribute_listener: Option<(String, Arc<dyn AttributeListener>)>,
    broadcast_listener: Option<(String, Arc<dyn BroadcastListener>)>,
    state: Mutex<PublicationState>,
}

enum OrphanRequest {
    Attribute(PersistedSubscriptionRequest<SubscriptionRequest>),
    Broadcast(PersistedSubscriptionRequest<BroadcastSubscriptionRequest>),
}

struct AttributeChangeForwarder {
    subscription_id: String,
    manager: Weak<PublicationManager>,
}

impl AttributeListener for AttributeChangeForwarder {
    fn attribute_value_changed(&self, value: Value) {
        if let Some(manager) = self.manager.upgrade() {
            manager.attribute_value_changed(&self.subscription_id, value);
        }
    }
}

struct BroadcastForwarder {
    subscription_id: String,
    manager: Weak<PublicationManager>,
}

impl BroadcastListener for BroadcastForwarder {
    fn broadcast_occurred(&self, values: Vec<Value>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.selective_broadcast_occurred(&self.subscription_id, values);
        }
    }
}

// ============================================================================
// PublicationManager
// ============================================================================

pub struct PublicationManager {
    scheduler: Arc<DelayedScheduler>,
    interpreters: Arc<RequestInterpreterRegistry>,
    filters: BroadcastFilterChain,
    publications: Mutex<HashMap<String, Arc<Publication>>>,
    attribute_requests: Mutex<HashMap<String, PersistedSubscriptionRequest<SubscriptionRequest>>>,
    broadcast_requests:
        Mutex<HashMap<String, PersistedSubscriptionRequest<BroadcastSubscriptionRequest>>>,
    /// Requests for providers not registered yet, keyed by provider id.
    orphans: Mutex<HashMap<String, Vec<OrphanRequest>>>,
    /// Subscription ids with an outstanding publish/poll runnable.
    currently_scheduled: Mutex<HashSet<String>>,
    attribute_storage: Option<SubscriptionRequestStorage>,
    broadcast_storage: Option<SubscriptionRequestStorage>,
    ttl_uplift_ms: u64,
    shutting_down: AtomicBool,
    shut_down: AtomicBool,
    self_ref: Weak<PublicationManager>,
}

impl PublicationManager {
    /// Build a manager; persisted pending requests are loaded into the
    /// orphan queue immediately (expired entries are discarded).
    #[must_use]
    pub fn new(
        scheduler: Arc<DelayedScheduler>,
        interpreters: Arc<RequestInterpreterRegistry>,
        ttl_uplift_ms: u64,
        attribute_requests_file: Option<std::path::PathBuf>,
        broadcast_requests_file: Option<std::path::PathBuf>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|self_ref| Self {
            scheduler,
            interpreters,
            filters: BroadcastFilterChain::new(),
            publications: Mutex::new(HashMap::new()),
            attribute_requests: Mutex::new(HashMap::new()),
            broadcast_requests: Mutex::new(HashMap::new()),
            orphans: Mutex::new(HashMap::new()),
            currently_scheduled: Mutex::new(HashSet::new()),
            attribute_storage: attribute_requests_file.map(SubscriptionRequestStorage::new),
            broadcast_storage: broadcast_requests_file.map(SubscriptionRequestStorage::new),
            ttl_uplift_ms,
            shutting_down: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        manager.load_persisted_requests();
        manager
    }

    // ========================================================================
    // add / restore
    // ========================================================================

    /// Register an attribute subscription for a locally hosted provider.
    ///
    /// An existing subscription with the same id is torn down first
    /// (implicit update). Sends the `SubscriptionReply` and, on success,
    /// schedules the initial value publication and the end runnable.
    pub fn add(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request_caller: Arc<dyn RequestCaller>,
        request: SubscriptionRequest,
        sender: &Arc<dyn PublicationSender>,
    ) {
        let subscription_id = request.subscription_id.clone();
        self.remove_publication(&subscription_id);

        if is_expired(request.qos.expiry_date_ms) {
            log::warn!(
                "[PUBLICATION] rejecting subscription {}: expiry already in the past",
                subscription_id
            );
            sender.send_subscription_reply(
                provider_participant_id,
                proxy_participant_id,
                self.uplifted_ttl(request.qos.publication_ttl_ms),
                SubscriptionReply::failure(
                    subscription_id,
                    "subscription request expired before it was processed".into(),
                ),
            );
            return;
        }

        let listener: Arc<dyn AttributeListener> = Arc::new(AttributeChangeForwarder {
            subscription_id: subscription_id.clone(),
            manager: self.self_ref.clone(),
        });
        request_caller.register_attribute_listener(&request.subscribed_to_name, Arc::clone(&listener));

        let publication = Arc::new(Publication {
            proxy_participant_id: proxy_participant_id.to_string(),
            provider_participant_id: provider_participant_id.to_string(),
            sender: Arc::downgrade(sender),
            request_caller,
            attribute_listener: Some((request.subscribed_to_name.clone(), listener)),
            broadcast_listener: None,
            state: Mutex::new(PublicationState {
                time_of_last_publication_ms: 0,
                end_handle: ScheduleHandle::INVALID,
                pending_values: None,
            }),
        });
        self.publications
            .lock()
            .insert(subscription_id.clone(), Arc::clone(&publication));

        let expiry = request.qos.expiry_date_ms;
        let publication_ttl = request.qos.publication_ttl_ms;
        let keep_alive_ms = match request.qos.kind {
            SubscriptionQosKind::OnChange {
                max_interval_ms, ..
            } => max_interval_ms,
            SubscriptionQosKind::Periodic { .. } => 0,
        };
        self.attribute_requests.lock().insert(
            subscription_id.clone(),
            PersistedSubscriptionRequest {
                proxy_participant_id: proxy_participant_id.to_string(),
                provider_participant_id: provider_participant_id.to_string(),
                request,
            },
        );
        self.save_attribute_requests(false);

        sender.send_subscription_reply(
            provider_participant_id,
            proxy_participant_id,
            self.uplifted_ttl(publication_ttl),
            SubscriptionReply::success(subscription_id.clone()),
        );

        self.schedule_end_runnable(&publication, &subscription_id, expiry);
        // Initial value, delivered at least once.
        self.schedule_poll(&subscription_id, Duration::ZERO, expiry);
        if keep_alive_ms > 0 {
            self.schedule_keep_alive(&subscription_id, Duration::from_millis(keep_alive_ms));
        }
    }

    /// Orphan overload: the target provider is not registered yet. The
    /// request is parked and replayed by [`PublicationManager::restore`].
    pub fn add_queued(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: SubscriptionRequest,
    ) {
        log::debug!(
            "[PUBLICATION] queueing subscription {} for unregistered provider {}",
            request.subscription_id,
            provider_participant_id
        );
        self.orphans
            .lock()
            .entry(provider_participant_id.to_string())
            .or_default()
            .push(OrphanRequest::Attribute(PersistedSubscriptionRequest {
                proxy_participant_id: proxy_participant_id.to_string(),
                provider_participant_id: provider_participant_id.to_string(),
                request,
            }));
        self.save_attribute_requests(false);
    }

    /// Register a broadcast subscription (selective broadcasts run the
    /// provider's filter chain before each publication).
    pub fn add_broadcast(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request_caller: Arc<dyn RequestCaller>,
        request: BroadcastSubscriptionRequest,
        sender: &Arc<dyn PublicationSender>,
    ) {
        let subscription_id = request.subscription_id.clone();
        self.remove_publication(&subscription_id);

        if is_expired(request.qos.expiry_date_ms) {
            log::warn!(
                "[PUBLICATION] rejecting broadcast subscription {}: expiry already in the past",
                subscription_id
            );
            sender.send_subscription_reply(
                provider_participant_id,
                proxy_participant_id,
                self.uplifted_ttl(request.qos.publication_ttl_ms),
                SubscriptionReply::failure(
                    subscription_id,
                    "subscription request expired before it was processed".into(),
                ),
            );
            return;
        }

        let listener: Arc<dyn BroadcastListener> = Arc::new(BroadcastForwarder {
            subscription_id: subscription_id.clone(),
            manager: self.self_ref.clone(),
        });
        request_caller.register_broadcast_listener(&request.subscribed_to_name, Arc::clone(&listener));

        let publication = Arc::new(Publication {
            proxy_participant_id: proxy_participant_id.to_string(),
            provider_participant_id: provider_participant_id.to_string(),
            sender: Arc::downgrade(sender),
            request_caller,
            attribute_listener: None,
            broadcast_listener: Some((request.subscribed_to_name.clone(), listener)),
            state: Mutex::new(PublicationState {
                time_of_last_publication_ms: 0,
                end_handle: ScheduleHandle::INVALID,
                pending_values: None,
            }),
        });
        self.publications
            .lock()
            .insert(subscription_id.clone(), Arc::clone(&publication));

        let expiry = request.qos.expiry_date_ms;
        let publication_ttl = request.qos.publication_ttl_ms;
        self.broadcast_requests.lock().insert(
            subscription_id.clone(),
            PersistedSubscriptionRequest {
                proxy_participant_id: proxy_participant_id.to_string(),
                provider_participant_id: provider_participant_id.to_string(),
                request,
            },
        );
        self.save_broadcast_requests(false);

        sender.send_subscription_reply(
            provider_participant_id,
            proxy_participant_id,
            self.uplifted_ttl(publication_ttl),
            SubscriptionReply::success(subscription_id.clone()),
        );
        self.schedule_end_runnable(&publication, &subscription_id, expiry);
    }

    /// Orphan overload for broadcast subscriptions.
    pub fn add_broadcast_queued(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: BroadcastSubscriptionRequest,
    ) {
        self.orphans
            .lock()
            .entry(provider_participant_id.to_string())
            .or_default()
            .push(OrphanRequest::Broadcast(PersistedSubscriptionRequest {
                proxy_participant_id: proxy_participant_id.to_string(),
                provider_participant_id: provider_participant_id.to_string(),
                request,
            }));
        self.save_broadcast_requests(false);
    }

    /// Multicast subscriptions carry no per-subscriber publication state
    /// on the provider side; acknowledge and return.
    pub fn add_multicast(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: MulticastSubscriptionRequest,
        sender: &Arc<dyn PublicationSender>,
    ) {
        sender.send_subscription_reply(
            provider_participant_id,
            proxy_participant_id,
            self.uplifted_ttl(request.qos.publication_ttl_ms),
            SubscriptionReply::success(request.subscription_id),
        );
    }

    /// Replay parked requests once their provider registers.
    pub fn restore(
        &self,
        provider_participant_id: &str,
        request_caller: Arc<dyn RequestCaller>,
        sender: &Arc<dyn PublicationSender>,
    ) {
        let parked = self
            .orphans
            .lock()
            .remove(provider_participant_id)
            .unwrap_or_default();
        if parked.is_empty() {
            return;
        }
        log::info!(
            "[PUBLICATION] restoring {} queued subscription requests for {}",
            parked.len(),
            provider_participant_id
        );
        for orphan in parked {
            match orphan {
                OrphanRequest::Attribute(entry) => {
                    if is_expired(entry.request.qos.expiry_date_ms) {
                        continue;
                    }
                    self.add(
                        &entry.proxy_participant_id,
                        provider_participant_id,
                        Arc::clone(&request_caller),
                        entry.request,
                        sender,
                    );
                }
                OrphanRequest::Broadcast(entry) => {
                    if is_expired(entry.request.qos.expiry_date_ms) {
                        continue;
                    }
                    self.add_broadcast(
                        &entry.proxy_participant_id,
                        provider_participant_id,
                        Arc::clone(&request_caller),
                        entry.request,
                        sender,
                    );
                }
            }
        }
    }

    // ========================================================================
    // change hooks
    // ========================================================================

    /// On-change hook for attribute subscriptions. Rapid changes within
    /// the QoS min interval coalesce into one delayed publication that
    /// carries the latest value.
    pub fn attribute_value_changed(&self, subscription_id: &str, value: Value) {
        self.value_changed(subscription_id, vec![value]);
    }

    /// Unfiltered broadcast hook.
    pub fn broadcast_occurred(&self, subscription_id: &str, values: Vec<Value>) {
        self.value_changed(subscription_id, values);
    }

    /// Selective broadcast hook: the filter chain (logical AND) runs with
    /// the subscriber's filter parameters; rejection suppresses only this
    /// one publication.
    pub fn selective_broadcast_occurred(&self, subscription_id: &str, values: Vec<Value>) {
        let entry = self.broadcast_requests.lock().get(subscription_id).cloned();
        if let Some(entry) = entry {
            if !self.filters.passes(
                &entry.provider_participant_id,
                &entry.request.subscribed_to_name,
                &values,
                &entry.request.filter_parameters,
            ) {
                log::debug!(
                    "[PUBLICATION] broadcast for {} suppressed by filter chain",
                    subscription_id
                );
                return;
            }
        }
        self.value_changed(subscription_id, values);
    }

    fn value_changed(&self, subscription_id: &str, values: Vec<Value>) {
        let Some(publication) = self.publication(subscription_id) else {
            log::debug!(
                "[PUBLICATION] change for unknown subscription {}, ignoring",
                subscription_id
            );
            return;
        };
        let min_interval_ms = self.min_interval_ms(subscription_id);
        let wait = {
            let mut state = publication.state.lock();
            state.pending_values = Some(values);
            time_until_next_publication(state.time_of_last_publication_ms, min_interval_ms)
        };
        if wait == 0 {
            self.publish_pending(subscription_id);
            return;
        }
        // Only the first change within the interval schedules; later ones
        // just refreshed pending_values above (last write wins).
        if self.currently_scheduled.lock().insert(subscription_id.to_string()) {
            let weak = self.self_ref.clone();
            let id = subscription_id.to_string();
            let expiry = self.expiry_ms(subscription_id);
            self.scheduler.schedule_fn_with_expiry(
                Duration::from_millis(wait),
                uplifted(expiry, self.ttl_uplift_ms),
                move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.currently_scheduled.lock().remove(&id);
                        manager.publish_pending(&id);
                    }
                },
            );
        }
    }

    /// Send the coalesced pending value(s), if any remain.
    fn publish_pending(&self, subscription_id: &str) {
        let Some(publication) = self.publication(subscription_id) else {
            return;
        };
        let values = {
            let mut state = publication.state.lock();
            match state.pending_values.take() {
                Some(values) => {
                    state.time_of_last_publication_ms = now_ms();
                    values
                }
                None => return,
            }
        };
        self.send_publication(
            &publication,
            SubscriptionPublication::value(subscription_id.to_string(), values),
        );
    }

    /// Multicast publication path: no per-subscription scheduling, the
    /// event goes straight out. Partition segments must not be the
    /// multicast wildcard token.
    pub fn multicast_occurred(
        &self,
        provider_participant_id: &str,
        broadcast_name: &str,
        partitions: &[String],
        values: Vec<Value>,
        sender: &Arc<dyn PublicationSender>,
    ) -> crate::error::Result<()> {
        for partition in partitions {
            if partition == MULTICAST_WILDCARD || partition.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "invalid partition segment '{}' in multicast publication",
                    partition
                )));
            }
        }
        let multicast_id =
            crate::protocol::multicast_id(provider_participant_id, broadcast_name, partitions);
        sender.send_multicast_publication(
            provider_participant_id,
            &multicast_id,
            self.uplifted_ttl(crate::qos::DEFAULT_PUBLICATION_TTL_MS),
            MulticastPublication {
                multicast_id: multicast_id.clone(),
                response: values,
            },
        );
        Ok(())
    }

    // ========================================================================
    // periodic polling
    // ========================================================================

    /// Periodic publication driver. Re-arms itself at the QoS period as
    /// long as the subscription is alive; on-change subscriptions pass
    /// through exactly once to deliver the initial value.
    pub fn poll_subscription(&self, subscription_id: &str) {
        let Some(publication) = self.publication(subscription_id) else {
            return;
        };
        let Some(entry) = self.attribute_requests.lock().get(subscription_id).cloned() else {
            return;
        };
        let qos = &entry.request.qos;

        if let SubscriptionQosKind::Periodic { period_ms } = qos.kind {
            // Re-arm instead of polling when the last publication is
            // fresher than one period (an on-change send may have won).
            let last = publication.state.lock().time_of_last_publication_ms;
            let elapsed = now_ms().saturating_sub(last);
            if last != 0 && elapsed < period_ms {
                self.schedule_poll(
                    subscription_id,
                    Duration::from_millis(period_ms - elapsed),
                    qos.expiry_date_ms,
                );
                return;
            }
        }

        let interface_name = publication.request_caller.interface_name().to_string();
        let Some(interpreter) = self.interpreters.get(&interface_name) else {
            log::error!(
                "[PUBLICATION] no request interpreter for interface '{}', aborting poll of {}",
                interface_name,
                subscription_id
            );
            return;
        };
        let weak_ok = self.self_ref.clone();
        let weak_err = self.self_ref.clone();
        let id_ok = subscription_id.to_string();
        let id_err = subscription_id.to_string();
        interpreter.execute_get(
            Arc::clone(&publication.request_caller),
            &entry.request.subscribed_to_name,
            Box::new(move |value| {
                if let Some(manager) = weak_ok.upgrade() {
                    manager.on_poll_success(&id_ok, value);
                }
            }),
            Box::new(move |error| {
                if let Some(manager) = weak_err.upgrade() {
                    manager.on_poll_failure(&id_err, &error);
                }
            }),
        );
    }

    fn on_poll_success(&self, subscription_id: &str, value: Value) {
        let Some(publication) = self.publication(subscription_id) else {
            return;
        };
        {
            let mut state = publication.state.lock();
            state.time_of_last_publication_ms = now_ms();
            // The polled value supersedes any pending on-change value.
            state.pending_values = None;
        }
        self.send_publication(
            &publication,
            SubscriptionPublication::value(subscription_id.to_string(), vec![value]),
        );
        self.reschedule_poll_if_periodic(subscription_id);
    }

    fn on_poll_failure(&self, subscription_id: &str, error: &Error) {
        let Some(publication) = self.publication(subscription_id) else {
            return;
        };
        log::warn!(
            "[PUBLICATION] attribute poll for {} failed: {}",
            subscription_id,
            error
        );
        {
            let mut state = publication.state.lock();
            state.time_of_last_publication_ms = now_ms();
        }
        self.send_publication(
            &publication,
            SubscriptionPublication::failure(subscription_id.to_string(), error.to_string()),
        );
        self.reschedule_poll_if_periodic(subscription_id);
    }

    fn reschedule_poll_if_periodic(&self, subscription_id: &str) {
        let Some(entry) = self.attribute_requests.lock().get(subscription_id).cloned() else {
            return;
        };
        let qos = &entry.request.qos;
        if let SubscriptionQosKind::Periodic { period_ms } = qos.kind {
            if !is_expired(qos.expiry_date_ms) {
                self.schedule_poll(
                    subscription_id,
                    Duration::from_millis(period_ms),
                    qos.expiry_date_ms,
                );
            }
        }
    }

    /// Keep-alive timer for on-change subscriptions with a non-zero max
    /// interval: when the last publication is older than the max
    /// interval, the current value is polled and published; otherwise
    /// the timer re-arms at the residual wait (self-correcting).
    fn on_keep_alive_timer(&self, subscription_id: &str) {
        let Some(publication) = self.publication(subscription_id) else {
            return;
        };
        let Some(max_interval_ms) = self.keep_alive_interval_ms(subscription_id) else {
            return;
        };
        let last = publication.state.lock().time_of_last_publication_ms;
        let elapsed = now_ms().saturating_sub(last);
        if last != 0 && elapsed < max_interval_ms {
            self.schedule_keep_alive(
                subscription_id,
                Duration::from_millis(max_interval_ms - elapsed),
            );
            return;
        }
        log::debug!(
            "[PUBLICATION] keep-alive for {} after {} ms without a publication",
            subscription_id,
            elapsed
        );
        self.poll_subscription(subscription_id);
        self.schedule_keep_alive(subscription_id, Duration::from_millis(max_interval_ms));
    }

    fn keep_alive_interval_ms(&self, subscription_id: &str) -> Option<u64> {
        let requests = self.attribute_requests.lock();
        let entry = requests.get(subscription_id)?;
        match entry.request.qos.kind {
            SubscriptionQosKind::OnChange {
                max_interval_ms, ..
            } if max_interval_ms > 0 => Some(max_interval_ms),
            _ => None,
        }
    }

    fn schedule_keep_alive(&self, subscription_id: &str, delay: Duration) {
        let weak = self.self_ref.clone();
        let id = subscription_id.to_string();
        let expiry = self.expiry_ms(subscription_id);
        self.scheduler.schedule_fn_with_expiry(
            delay,
            uplifted(expiry, self.ttl_uplift_ms),
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.on_keep_alive_timer(&id);
                }
            },
        );
    }

    fn schedule_poll(&self, subscription_id: &str, delay: Duration, expiry: TimePoint) {
        if !self.currently_scheduled.lock().insert(subscription_id.to_string()) {
            return;
        }
        let weak = self.self_ref.clone();
        let id = subscription_id.to_string();
        self.scheduler.schedule_fn_with_expiry(
            delay,
            uplifted(expiry, self.ttl_uplift_ms),
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.currently_scheduled.lock().remove(&id);
                    manager.poll_subscription(&id);
                }
            },
        );
    }

    // ========================================================================
    // removal / shutdown
    // ========================================================================

    /// Handle an incoming `SubscriptionStop`.
    pub fn stop_publication(&self, subscription_id: &str) {
        log::debug!("[PUBLICATION] stop received for {}", subscription_id);
        self.remove_publication(subscription_id);
    }

    /// Tear down every subscription of an unregistering provider,
    /// including its broadcast filters and parked orphans.
    pub fn remove_all_subscriptions(&self, provider_participant_id: &str) {
        let ids: Vec<String> = {
            let publications = self.publications.lock();
            publications
                .iter()
                .filter(|(_, p)| p.provider_participant_id == provider_participant_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.remove_publication(&id);
        }
        self.filters.remove_provider(provider_participant_id);
        self.orphans.lock().remove(provider_participant_id);
    }

    /// Remove one subscription: unregister provider listeners, cancel the
    /// end runnable, drop request bookkeeping. Idempotent.
    pub fn remove_publication(&self, subscription_id: &str) {
        let Some(publication) = self.publications.lock().remove(subscription_id) else {
            return;
        };
        if let Some((attribute_name, listener)) = &publication.attribute_listener {
            publication
                .request_caller
                .unregister_attribute_listener(attribute_name, listener);
        }
        if let Some((broadcast_name, listener)) = &publication.broadcast_listener {
            publication
                .request_caller
                .unregister_broadcast_listener(broadcast_name, listener);
        }
        {
            let mut state = publication.state.lock();
            let mut handle = state.end_handle;
            self.scheduler.unschedule(&mut handle);
            state.end_handle = ScheduleHandle::INVALID;
        }
        self.currently_scheduled.lock().remove(subscription_id);
        let had_attribute = self.attribute_requests.lock().remove(subscription_id).is_some();
        let had_broadcast = self.broadcast_requests.lock().remove(subscription_id).is_some();
        if had_attribute {
            self.save_attribute_requests(false);
        }
        if had_broadcast {
            self.save_broadcast_requests(false);
        }
    }

    pub fn add_broadcast_filter(
        &self,
        provider_participant_id: &str,
        filter: Arc<dyn BroadcastFilter>,
    ) {
        self.filters.add(provider_participant_id, filter);
    }

    /// One-shot drain: persist both request maps one final time and
    /// remove every publication. Calling twice is a programming error.
    pub fn shutdown(&self) {
        assert!(
            !self.shut_down.swap(true, Ordering::SeqCst),
            "PublicationManager::shutdown called twice"
        );
        self.shutting_down.store(true, Ordering::Release);
        self.save_attribute_requests(true);
        self.save_broadcast_requests(true);
        let ids: Vec<String> = self.publications.lock().keys().cloned().collect();
        for id in ids {
            self.remove_publication(&id);
        }
    }

    // ========================================================================
    // accessors (tests / dispatcher)
    // ========================================================================

    #[must_use]
    pub fn has_publication(&self, subscription_id: &str) -> bool {
        self.publications.lock().contains_key(subscription_id)
    }

    #[must_use]
    pub fn queued_request_count(&self, provider_participant_id: &str) -> usize {
        self.orphans
            .lock()
            .get(provider_participant_id)
            .map_or(0, Vec::len)
    }

    // ========================================================================
    // internals
    // ========================================================================

    fn publication(&self, subscription_id: &str) -> Option<Arc<Publication>> {
        self.publications.lock().get(subscription_id).cloned()
    }

    fn min_interval_ms(&self, subscription_id: &str) -> u64 {
        if let Some(entry) = self.attribute_requests.lock().get(subscription_id) {
            return entry.request.qos.min_interval_ms();
        }
        if let Some(entry) = self.broadcast_requests.lock().get(subscription_id) {
            return entry.request.qos.min_interval_ms();
        }
        0
    }

    fn expiry_ms(&self, subscription_id: &str) -> TimePoint {
        if let Some(entry) = self.attribute_requests.lock().get(subscription_id) {
            return entry.request.qos.expiry_date_ms;
        }
        if let Some(entry) = self.broadcast_requests.lock().get(subscription_id) {
            return entry.request.qos.expiry_date_ms;
        }
        NO_EXPIRY
    }

    fn uplifted_ttl(&self, ttl_ms: u64) -> u64 {
        ttl_ms.saturating_add(self.ttl_uplift_ms)
    }

    fn send_publication(&self, publication: &Publication, body: SubscriptionPublication) {
        let ttl = self.uplifted_ttl(self.publication_ttl_for(&body.subscription_id));
        match publication.sender.upgrade() {
            Some(sender) => {
                sender.send_subscription_publication(
                    &publication.provider_participant_id,
                    &publication.proxy_participant_id,
                    ttl,
                    body,
                );
            }
            None => {
                log::debug!(
                    "[PUBLICATION] sender gone, dropping publication for {}",
                    body.subscription_id
                );
            }
        }
    }

    fn publication_ttl_for(&self, subscription_id: &str) -> u64 {
        if let Some(entry) = self.attribute_requests.lock().get(subscription_id) {
            return entry.request.qos.publication_ttl_ms;
        }
        if let Some(entry) = self.broadcast_requests.lock().get(subscription_id) {
            return entry.request.qos.publication_ttl_ms;
        }
        crate::qos::DEFAULT_PUBLICATION_TTL_MS
    }

    fn schedule_end_runnable(
        &self,
        publication: &Arc<Publication>,
        subscription_id: &str,
        expiry: TimePoint,
    ) {
        if expiry == NO_EXPIRY {
            return;
        }
        let weak = self.self_ref.clone();
        let id = subscription_id.to_string();
        let delay = remaining(uplifted(expiry, self.ttl_uplift_ms));
        let handle = self.scheduler.schedule_fn(delay, move || {
            if let Some(manager) = weak.upgrade() {
                log::debug!("[PUBLICATION] subscription {} expired", id);
                manager.remove_publication(&id);
            }
        });
        publication.state.lock().end_handle = handle;
    }

    // ========================================================================
    // persistence
    // ========================================================================

    fn load_persisted_requests(&self) {
        if let Some(storage) = &self.attribute_storage {
            let loaded: Vec<PersistedSubscriptionRequest<SubscriptionRequest>> = storage.load();
            let mut orphans = self.orphans.lock();
            for entry in loaded {
                if is_expired(entry.request.qos.expiry_date_ms) {
                    continue;
                }
                orphans
                    .entry(entry.provider_participant_id.clone())
                    .or_default()
                    .push(OrphanRequest::Attribute(entry));
            }
        }
        if let Some(storage) = &self.broadcast_storage {
            let loaded: Vec<PersistedSubscriptionRequest<BroadcastSubscriptionRequest>> =
                storage.load();
            let mut orphans = self.orphans.lock();
            for entry in loaded {
                if is_expired(entry.request.qos.expiry_date_ms) {
                    continue;
                }
                orphans
                    .entry(entry.provider_participant_id.clone())
                    .or_default()
                    .push(OrphanRequest::Broadcast(entry));
            }
        }
    }

    /// Write-through save of active + parked attribute requests. Skipped
    /// mid-shutdown unless `force`d for the final save.
    fn save_attribute_requests(&self, force: bool) {
        let Some(storage) = &self.attribute_storage else {
            return;
        };
        if self.shutting_down.load(Ordering::Acquire) && !force {
            return;
        }
        let mut entries: Vec<PersistedSubscriptionRequest<SubscriptionRequest>> =
            self.attribute_requests.lock().values().cloned().collect();
        for orphan_list in self.orphans.lock().values() {
            for orphan in orphan_list {
                if let OrphanRequest::Attribute(entry) = orphan {
                    entries.push(entry.clone());
                }
            }
        }
        storage.save(&entries);
    }

    fn save_broadcast_requests(&self, force: bool) {
        let Some(storage) = &self.broadcast_storage else {
            return;
        };
        if self.shutting_down.load(Ordering::Acquire) && !force {
            return;
        }
        let mut entries: Vec<PersistedSubscriptionRequest<BroadcastSubscriptionRequest>> =
            self.broadcast_requests.lock().values().cloned().collect();
        for orphan_list in self.orphans.lock().values() {
            for orphan in orphan_list {
                if let OrphanRequest::Broadcast(entry) = orphan {
                    entries.push(entry.clone());
                }
            }
        }
        storage.save(&entries);
    }
}

/// Remaining wait before the next publication respects the min interval.
fn time_until_next_publication(last_publication_ms: TimePoint, min_interval_ms: u64) -> u64 {
    if last_publication_ms == 0 {
        return 0;
    }
    let elapsed = now_ms().saturating_sub(last_publication_ms);
    min_interval_ms.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::SubscriptionQos;
    use parking_lot::Mutex as PlMutex;
    use std::sync::mpsc;

    // ------------------------------------------------------------------
    // test doubles
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockCaller {
        attribute_listeners: PlMutex<Vec<String>>,
    }

    impl RequestCaller for MockCaller {
        fn interface_name(&self) -> &str {
            "tests/Mock"
        }

        fn register_attribute_listener(
            &self,
            attribute_name: &str,
            _listener: Arc<dyn AttributeListener>,
        ) {
            self.attribute_listeners.lock().push(attribute_name.into());
        }

        fn unregister_attribute_listener(
            &self,
            attribute_name: &str,
            _listener: &Arc<dyn AttributeListener>,
        ) {
            self.attribute_listeners
                .lock()
                .retain(|name| name != attribute_name);
        }

        fn register_broadcast_listener(
            &self,
            _broadcast_name: &str,
            _listener: Arc<dyn BroadcastListener>,
        ) {
        }

        fn unregister_broadcast_listener(
            &self,
            _broadcast_name: &str,
            _listener: &Arc<dyn BroadcastListener>,
        ) {
        }
    }

    enum Sent {
        Reply(SubscriptionReply),
        Publication(SubscriptionPublication),
        Multicast(MulticastPublication),
    }

    struct MockSender {
        tx: mpsc::Sender<Sent>,
    }

    impl PublicationSender for MockSender {
        fn send_subscription_reply(
            &self,
            _from: &str,
            _to: &str,
            _ttl_ms: u64,
            reply: SubscriptionReply,
        ) {
            let _ = self.tx.send(Sent::Reply(reply));
        }

        fn send_subscription_publication(
            &self,
            _from: &str,
            _to: &str,
            _ttl_ms: u64,
            publication: SubscriptionPublication,
        ) {
            let _ = self.tx.send(Sent::Publication(publication));
        }

        fn send_multicast_publication(
            &self,
            _from: &str,
            _multicast_id: &str,
            _ttl_ms: u64,
            publication: MulticastPublication,
        ) {
            let _ = self.tx.send(Sent::Multicast(publication));
        }
    }

    struct GetterInterpreter {
        value: Value,
    }

    impl crate::provider::RequestInterpreter for GetterInterpreter {
        fn execute_get(
            &self,
            _caller: Arc<dyn RequestCaller>,
            _attribute_name: &str,
            on_success: Box<dyn FnOnce(Value) + Send>,
            _on_error: crate::error::OnError,
        ) {
            on_success(self.value.clone());
        }
    }

    struct Fixture {
        manager: Arc<PublicationManager>,
        scheduler: Arc<DelayedScheduler>,
        sender: Arc<dyn PublicationSender>,
        rx: mpsc::Receiver<Sent>,
    }

    impl Fixture {
        fn new() -> Self {
            let scheduler = DelayedScheduler::new(2);
            let interpreters = Arc::new(RequestInterpreterRegistry::new());
            interpreters.register(
                "tests/Mock",
                Arc::new(GetterInterpreter {
                    value: Value::from(1),
                }),
            );
            let manager = PublicationManager::new(
                Arc::clone(&scheduler),
                interpreters,
                0,
                None,
                None,
            );
            let (tx, rx) = mpsc::channel();
            let sender: Arc<dyn PublicationSender> = Arc::new(MockSender { tx });
            Self {
                manager,
                scheduler,
                sender,
                rx,
            }
        }

        fn recv(&self) -> Sent {
            self.rx
                .recv_timeout(Duration::from_secs(3))
                .expect("expected an outgoing message")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.scheduler.shutdown();
        }
    }

    fn attribute_request(id: &str, qos: SubscriptionQos) -> SubscriptionRequest {
        SubscriptionRequest {
            subscription_id: id.into(),
            subscribed_to_name: "level".into(),
            qos,
        }
    }

    // ------------------------------------------------------------------
    // tests
    // ------------------------------------------------------------------

    #[test]
    fn test_add_sends_reply_then_initial_value() {
        let fx = Fixture::new();
        let caller = Arc::new(MockCaller::default());
        fx.manager.add(
            "proxy",
            "provider",
            caller.clone(),
            attribute_request("s1", SubscriptionQos::on_change(60_000, 100)),
            &fx.sender,
        );
        match fx.recv() {
            Sent::Reply(reply) => {
                assert_eq!(reply.subscription_id, "s1");
                assert!(reply.error.is_none());
            }
            _ => panic!("expected reply first"),
        }
        match fx.recv() {
            Sent::Publication(p) => {
                assert_eq!(p.subscription_id, "s1");
                assert_eq!(p.response, Some(vec![Value::from(1)]));
            }
            _ => panic!("expected initial publication"),
        }
        assert_eq!(caller.attribute_listeners.lock().len(), 1);
    }

    #[test]
    fn test_expired_request_rejected_without_state() {
        let fx = Fixture::new();
        let caller = Arc::new(MockCaller::default());
        let mut qos = SubscriptionQos::on_change(0, 100);
        qos.expiry_date_ms = now_ms().saturating_sub(10);
        fx.manager.add(
            "proxy",
            "provider",
            caller.clone(),
            attribute_request("dead", qos),
            &fx.sender,
        );
        match fx.recv() {
            Sent::Reply(reply) => {
                assert!(reply.error.is_some());
            }
            _ => panic!("expected error reply"),
        }
        assert!(!fx.manager.has_publication("dead"));
        // No attribute listener registered with the provider.
        assert!(caller.attribute_listeners.lock().is_empty());
    }

    #[test]
    fn test_rapid_changes_coalesce_to_latest_value() {
        let fx = Fixture::new();
        let caller = Arc::new(MockCaller::default());
        fx.manager.add(
            "proxy",
            "provider",
            caller,
            attribute_request("s1", SubscriptionQos::on_change(5_000, 100)),
            &fx.sender,
        );
        let Sent::Reply(_) = fx.recv() else {
            panic!("expected reply");
        };
        let Sent::Publication(_initial) = fx.recv() else {
            panic!("expected initial publication");
        };
        // Five changes well within min_interval_ms = 100.
        for v in 1..=5 {
            fx.manager
                .attribute_value_changed("s1", Value::from(v * 10));
        }
        match fx.recv() {
            Sent::Publication(p) => {
                assert_eq!(p.response, Some(vec![Value::from(50)]));
            }
            _ => panic!("expected coalesced publication"),
        }
        // Exactly one coalesced publication, no stragglers.
        assert!(fx.rx.recv_timeout(Duration::from_millis(250)).is_err());
    }

    #[test]
    fn test_periodic_subscription_polls_repeatedly() {
        let fx = Fixture::new();
        let caller = Arc::new(MockCaller::default());
        fx.manager.add(
            "proxy",
            "provider",
            caller,
            attribute_request("per", SubscriptionQos::periodic(60_000, 50)),
            &fx.sender,
        );
        let Sent::Reply(_) = fx.recv() else {
            panic!("expected reply");
        };
        let mut publications = 0;
        while publications < 3 {
            if let Sent::Publication(_) = fx.recv() {
                publications += 1;
            }
        }
    }

    #[test]
    fn test_keep_alive_publishes_while_value_is_silent() {
        let fx = Fixture::new();
        let caller = Arc::new(MockCaller::default());
        fx.manager.add(
            "proxy",
            "provider",
            caller,
            attribute_request("ka", SubscriptionQos::on_change_with_keep_alive(60_000, 10, 80)),
            &fx.sender,
        );
        let Sent::Reply(_) = fx.recv() else {
            panic!("expected reply");
        };
        let Sent::Publication(_initial) = fx.recv() else {
            panic!("expected initial publication");
        };
        // No value change happens; the keep-alive still publishes the
        // current value every max_interval_ms.
        let mut keep_alives = 0;
        while keep_alives < 2 {
            if let Sent::Publication(p) = fx.recv() {
                assert_eq!(p.response, Some(vec![Value::from(1)]));
                keep_alives += 1;
            }
        }
    }

    #[test]
    fn test_stop_publication_unregisters_listener() {
        let fx = Fixture::new();
        let caller = Arc::new(MockCaller::default());
        fx.manager.add(
            "proxy",
            "provider",
            caller.clone(),
            attribute_request("s1", SubscriptionQos::on_change(60_000, 100)),
            &fx.sender,
        );
        let Sent::Reply(_) = fx.recv() else {
            panic!("expected reply");
        };
        fx.manager.stop_publication("s1");
        assert!(!fx.manager.has_publication("s1"));
        assert!(caller.attribute_listeners.lock().is_empty());
        // Second stop is a no-op.
        fx.manager.stop_publication("s1");
    }

    #[test]
    fn test_orphan_queued_and_restored() {
        let fx = Fixture::new();
        fx.manager.add_queued(
            "proxy",
            "late-provider",
            attribute_request("s1", SubscriptionQos::on_change(60_000, 100)),
        );
        assert_eq!(fx.manager.queued_request_count("late-provider"), 1);
        assert!(!fx.manager.has_publication("s1"));
        let caller = Arc::new(MockCaller::default());
        fx.manager.restore("late-provider", caller, &fx.sender);
        assert_eq!(fx.manager.queued_request_count("late-provider"), 0);
        assert!(fx.manager.has_publication("s1"));
        let Sent::Reply(reply) = fx.recv() else {
            panic!("expected reply");
        };
        assert!(reply.error.is_none());
    }

    #[test]
    fn test_multicast_wildcard_partition_rejected() {
        let fx = Fixture::new();
        let result = fx.manager.multicast_occurred(
            "provider",
            "tick",
            &["eu".into(), "*".into()],
            vec![Value::from(1)],
            &fx.sender,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        // Valid partitions go straight out.
        fx.manager
            .multicast_occurred("provider", "tick", &["eu".into()], vec![Value::from(1)], &fx.sender)
            .unwrap();
        match fx.recv() {
            Sent::Multicast(p) => assert_eq!(p.multicast_id, "provider/tick/eu"),
            _ => panic!("expected multicast publication"),
        }
    }

    #[test]
    fn test_remove_all_subscriptions_for_provider() {
        let fx = Fixture::new();
        let caller = Arc::new(MockCaller::default());
        fx.manager.add(
            "proxy",
            "prov-a",
            caller.clone(),
            attribute_request("a1", SubscriptionQos::on_change(60_000, 100)),
            &fx.sender,
        );
        fx.manager.add(
            "proxy",
            "prov-b",
            caller,
            attribute_request("b1", SubscriptionQos::on_change(60_000, 100)),
            &fx.sender,
        );
        fx.manager.remove_all_subscriptions("prov-a");
        assert!(!fx.manager.has_publication("a1"));
        assert!(fx.manager.has_publication("b1"));
    }

    #[test]
    #[should_panic(expected = "shutdown called twice")]
    fn test_double_shutdown_asserts() {
        let fx = Fixture::new();
        fx.manager.shutdown();
        fx.manager.shutdown();
    }

    #[test]
    fn test_persisted_requests_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attr-subs.json");
        let scheduler = DelayedScheduler::new(1);
        {
            let manager = PublicationManager::new(
                Arc::clone(&scheduler),
                Arc::new(RequestInterpreterRegistry::new()),
                0,
                Some(path.clone()),
                None,
            );
            manager.add_queued(
                "proxy",
                "provider",
                attribute_request("s1", SubscriptionQos::on_change(600_000, 100)),
            );
        }
        let reloaded = PublicationManager::new(
            Arc::clone(&scheduler),
            Arc::new(RequestInterpreterRegistry::new()),
            0,
            Some(path),
            None,
        );
        assert_eq!(reloaded.queued_request_count("provider"), 1);
        scheduler.shutdown();
    }
}
