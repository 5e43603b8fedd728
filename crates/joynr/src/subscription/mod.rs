// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Consumer-side subscription manager.
//!
//! Tracks every subscription a local proxy holds on a remote provider:
//! it builds and sends the subscription requests, dispatches incoming
//! publications and replies to the registered
//! [`SubscriptionListener`]s, runs the missed-publication watchdog, and
//! tears state down at expiry or on unregister.
//!
//! Multicast subscriptions additionally go through the message router's
//! receiver bookkeeping (see
//! [`MulticastRouting`](crate::messaging::router::MulticastRouting));
//! the transport-level subscribe request only leaves once the router has
//! acknowledged the receiver registration.

use crate::error::{Error, Result};
use crate::messaging::router::MulticastRouting;
use crate::protocol::{
    multicast_matches, BroadcastSubscriptionRequest, MulticastPublication,
    MulticastSubscriptionRequest, SubscriptionPublication, SubscriptionReply, SubscriptionRequest,
    SubscriptionStop, MULTICAST_WILDCARD,
};
use crate::qos::SubscriptionQos;
use crate::scheduler::{DelayedScheduler, ScheduleHandle};
use crate::util::create_uuid;
use crate::util::time::{is_expired, now_ms, remaining, TimePoint, NO_EXPIRY};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Application-facing event sink for one subscription. All callbacks run
/// on scheduler or dispatcher threads; implementations must not block.
pub trait SubscriptionListener: Send + Sync {
    /// Provider accepted the subscription.
    fn on_subscribed(&self, subscription_id: &str);

    /// A publication arrived.
    fn on_receive(&self, values: &[Value]);

    /// Delivery of an error: provider rejection, provider-side exception
    /// or a missed-publication alert. The subscription stays alive unless
    /// the error came from a rejected subscription request.
    fn on_error(&self, error: &Error);
}

/// Outbound control-plane surface used to reach the provider side.
pub trait SubscriptionMessageSender: Send + Sync {
    fn send_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: &SubscriptionRequest,
    ) -> Result<()>;
    fn send_broadcast_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: &BroadcastSubscriptionRequest,
    ) -> Result<()>;
    fn send_multicast_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: &MulticastSubscriptionRequest,
    ) -> Result<()>;
    fn send_subscription_stop(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        stop: &SubscriptionStop,
    ) -> Result<()>;
}

// ============================================================================
// Internal state
// ============================================================================

struct SubscriptionState {
    time_of_last_publication_ms: TimePoint,
    missed_handle: ScheduleHandle,
    end_handle: ScheduleHandle,
}

struct Subscription {
    proxy_participant_id: String,
    provider_participant_id: String,
    qos: SubscriptionQos,
    listener: Arc<dyn SubscriptionListener>,
    /// Set for multicast subscriptions; the receiver pattern may end in
    /// the wildcard token.
    multicast_id: Option<String>,
    state: Mutex<SubscriptionState>,
}

// ============================================================================
// SubscriptionManager
// ============================================================================

pub struct SubscriptionManager {
    scheduler: Arc<DelayedScheduler>,
    sender: Arc<dyn SubscriptionMessageSender>,
    router: Arc<dyn MulticastRouting>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    self_ref: Weak<SubscriptionManager>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(
        scheduler: Arc<DelayedScheduler>,
        sender: Arc<dyn SubscriptionMessageSender>,
        router: Arc<dyn MulticastRouting>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            scheduler,
            sender,
            router,
            subscriptions: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    // ========================================================================
    // register
    // ========================================================================

    /// Subscribe to a provider attribute. Passing an existing
    /// `subscription_id` updates that subscription in place (its old
    /// runnables are cancelled); `None` allocates a fresh id.
    ///
    /// Returns the subscription id; on a send failure the local state is
    /// rolled back before the error is returned.
    pub fn register_attribute_subscription(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        attribute_name: &str,
        qos: SubscriptionQos,
        listener: Arc<dyn SubscriptionListener>,
        subscription_id: Option<String>,
    ) -> Result<String> {
        let id = self.install_subscription(
            proxy_participant_id,
            provider_participant_id,
            qos.clone(),
            listener,
            None,
            subscription_id,
        )?;
        let request = SubscriptionRequest {
            subscription_id: id.clone(),
            subscribed_to_name: attribute_name.to_string(),
            qos,
        };
        if let Err(e) =
            self.sender
                .send_subscription_request(proxy_participant_id, provider_participant_id, &request)
        {
            self.discard_subscription(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Subscribe to a (selective) provider broadcast.
    pub fn register_broadcast_subscription(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        broadcast_name: &str,
        filter_parameters: HashMap<String, String>,
        qos: SubscriptionQos,
        listener: Arc<dyn SubscriptionListener>,
        subscription_id: Option<String>,
    ) -> Result<String> {
        let id = self.install_subscription(
            proxy_participant_id,
            provider_participant_id,
            qos.clone(),
            listener,
            None,
            subscription_id,
        )?;
        let request = BroadcastSubscriptionRequest {
            subscription_id: id.clone(),
            subscribed_to_name: broadcast_name.to_string(),
            qos,
            filter_parameters,
        };
        if let Err(e) = self.sender.send_broadcast_subscription_request(
            proxy_participant_id,
            provider_participant_id,
            &request,
        ) {
            self.discard_subscription(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Subscribe to a multicast broadcast. The receiver pattern may use
    /// the wildcard token, but only as its final partition segment.
    ///
    /// The receiver is first registered with the router; the subscription
    /// request leaves only after the router reported success, and a router
    /// failure removes the local state again and reaches the listener
    /// through `on_error`.
    pub fn register_multicast_subscription(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        broadcast_name: &str,
        partitions: &[String],
        qos: SubscriptionQos,
        listener: Arc<dyn SubscriptionListener>,
        subscription_id: Option<String>,
    ) -> Result<String> {
        validate_receiver_partitions(partitions)?;
        let multicast_id =
            crate::protocol::multicast_id(provider_participant_id, broadcast_name, partitions);
        let id = self.install_subscription(
            proxy_participant_id,
            provider_participant_id,
            qos.clone(),
            listener,
            Some(multicast_id.clone()),
            subscription_id,
        )?;

        let request = MulticastSubscriptionRequest {
            subscription_id: id.clone(),
            subscribed_to_name: broadcast_name.to_string(),
            multicast_id: multicast_id.clone(),
            qos,
        };
        let weak_ok = self.self_ref.clone();
        let weak_err = self.self_ref.clone();
        let id_ok = id.clone();
        let id_err = id.clone();
        let proxy = proxy_participant_id.to_string();
        let provider = provider_participant_id.to_string();
        self.router.add_multicast_receiver(
            &multicast_id,
            proxy_participant_id,
            provider_participant_id,
            Box::new(move || {
                if let Some(manager) = weak_ok.upgrade() {
                    manager.on_multicast_receiver_added(&id_ok, &proxy, &provider, &request);
                }
            }),
            Box::new(move |error| {
                if let Some(manager) = weak_err.upgrade() {
                    manager.on_multicast_receiver_failed(&id_err, error);
                }
            }),
        );
        Ok(id)
    }

    fn on_multicast_receiver_added(
        &self,
        subscription_id: &str,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: &MulticastSubscriptionRequest,
    ) {
        let Some(subscription) = self.subscription(subscription_id) else {
            // Unregistered while the router round-trip was in flight.
            return;
        };
        if let Err(e) = self.sender.send_multicast_subscription_request(
            proxy_participant_id,
            provider_participant_id,
            request,
        ) {
            log::error!(
                "[SUBSCRIPTION] failed to send multicast subscription request {}: {}",
                subscription_id,
                e
            );
            self.discard_subscription(subscription_id);
            subscription.listener.on_error(&e);
        }
    }

    fn on_multicast_receiver_failed(&self, subscription_id: &str, error: Error) {
        log::error!(
            "[SUBSCRIPTION] multicast receiver registration for {} failed: {}",
            subscription_id,
            error
        );
        if let Some(subscription) = self.subscription(subscription_id) {
            self.discard_subscription(subscription_id);
            subscription.listener.on_error(&error);
        }
    }

    /// Insert (or replace) the local state and arm the end/watchdog
    /// runnables. Rejects an already-expired QoS outright.
    fn install_subscription(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        qos: SubscriptionQos,
        listener: Arc<dyn SubscriptionListener>,
        multicast_id: Option<String>,
        subscription_id: Option<String>,
    ) -> Result<String> {
        if is_expired(qos.expiry_date_ms) {
            return Err(Error::InvalidArgument(
                "subscription expiry date lies in the past".into(),
            ));
        }
        let id = subscription_id.unwrap_or_else(create_uuid);
        // An update cancels the previous incarnation's runnables.
        self.discard_subscription(&id);

        let expiry = qos.expiry_date_ms;
        let alert_after = qos.alert_after_interval_ms;
        let is_multicast = multicast_id.is_some();
        let subscription = Arc::new(Subscription {
            proxy_participant_id: proxy_participant_id.to_string(),
            provider_participant_id: provider_participant_id.to_string(),
            qos,
            listener,
            multicast_id,
            state: Mutex::new(SubscriptionState {
                time_of_last_publication_ms: now_ms(),
                missed_handle: ScheduleHandle::INVALID,
                end_handle: ScheduleHandle::INVALID,
            }),
        });
        self.subscriptions
            .lock()
            .insert(id.clone(), Arc::clone(&subscription));

        if expiry != NO_EXPIRY {
            let weak = self.self_ref.clone();
            let end_id = id.clone();
            let handle = self.scheduler.schedule_fn(remaining(expiry), move || {
                if let Some(manager) = weak.upgrade() {
                    log::debug!("[SUBSCRIPTION] {} reached its expiry date", end_id);
                    manager.discard_subscription(&end_id);
                }
            });
            subscription.state.lock().end_handle = handle;
        }
        // Multicasts carry no per-subscriber delivery expectation, so no
        // watchdog for them.
        if alert_after > 0 && !is_multicast {
            let handle = self.schedule_missed_check(&id, Duration::from_millis(alert_after));
            subscription.state.lock().missed_handle = handle;
        }
        Ok(id)
    }

    // ========================================================================
    // missed-publication watchdog
    // ========================================================================

    fn schedule_missed_check(&self, subscription_id: &str, delay: Duration) -> ScheduleHandle {
        let weak = self.self_ref.clone();
        let id = subscription_id.to_string();
        self.scheduler.schedule_fn(delay, move || {
            if let Some(manager) = weak.upgrade() {
                manager.check_missed_publication(&id);
            }
        })
    }

    /// Watchdog body: self-correcting against races with late
    /// publications. An alert fires only when nothing arrived for a full
    /// alert interval; either way the watchdog re-arms itself until the
    /// subscription ends.
    fn check_missed_publication(&self, subscription_id: &str) {
        let Some(subscription) = self.subscription(subscription_id) else {
            return;
        };
        if is_expired(subscription.qos.expiry_date_ms) {
            self.discard_subscription(subscription_id);
            return;
        }
        let alert_after = subscription.qos.alert_after_interval_ms;
        let (alert, next_delay) = {
            let state = subscription.state.lock();
            let elapsed = now_ms().saturating_sub(state.time_of_last_publication_ms);
            if elapsed >= alert_after {
                (true, alert_after)
            } else {
                (false, alert_after - elapsed)
            }
        };
        if alert {
            log::debug!(
                "[SUBSCRIPTION] publication missed for {} (alert interval {} ms)",
                subscription_id,
                alert_after
            );
            subscription
                .listener
                .on_error(&Error::PublicationMissed(subscription_id.to_string()));
        }
        let handle = self.schedule_missed_check(subscription_id, Duration::from_millis(next_delay));
        subscription.state.lock().missed_handle = handle;
    }

    // ========================================================================
    // inbound dispatch
    // ========================================================================

    /// Deliver an incoming unicast publication to its listener and feed
    /// the watchdog. Unknown ids are logged and dropped.
    pub fn handle_publication(&self, publication: SubscriptionPublication) {
        let Some(subscription) = self.subscription(&publication.subscription_id) else {
            log::debug!(
                "[SUBSCRIPTION] publication for unknown subscription {}, dropping",
                publication.subscription_id
            );
            return;
        };
        self.touch_subscription_state(&publication.subscription_id, now_ms());
        if let Some(exception) = publication.error {
            subscription
                .listener
                .on_error(&Error::ProviderRuntime(exception.message));
            return;
        }
        let values = publication.response.unwrap_or_default();
        subscription.listener.on_receive(&values);
    }

    /// Deliver an incoming multicast publication to every local
    /// subscription whose receiver pattern matches the multicast id.
    pub fn handle_multicast_publication(&self, publication: &MulticastPublication) {
        let matching: Vec<Arc<Subscription>> = {
            let subscriptions = self.subscriptions.lock();
            subscriptions
                .values()
                .filter(|s| {
                    s.multicast_id
                        .as_deref()
                        .is_some_and(|pattern| multicast_matches(pattern, &publication.multicast_id))
                })
                .cloned()
                .collect()
        };
        if matching.is_empty() {
            log::debug!(
                "[SUBSCRIPTION] no local receiver for multicast {}",
                publication.multicast_id
            );
            return;
        }
        for subscription in matching {
            subscription.listener.on_receive(&publication.response);
        }
    }

    /// Deliver the provider's answer to a subscription request. A
    /// rejection removes the local state.
    pub fn handle_subscription_reply(&self, reply: SubscriptionReply) {
        let Some(subscription) = self.subscription(&reply.subscription_id) else {
            log::debug!(
                "[SUBSCRIPTION] reply for unknown subscription {}, dropping",
                reply.subscription_id
            );
            return;
        };
        match reply.error {
            Some(exception) => {
                self.discard_subscription(&reply.subscription_id);
                subscription
                    .listener
                    .on_error(&Error::ProviderRuntime(exception.message));
            }
            None => subscription.listener.on_subscribed(&reply.subscription_id),
        }
    }

    /// Record a publication arrival time for the watchdog.
    pub fn touch_subscription_state(&self, subscription_id: &str, arrival_ms: TimePoint) {
        if let Some(subscription) = self.subscription(subscription_id) {
            subscription.state.lock().time_of_last_publication_ms = arrival_ms;
        }
    }

    // ========================================================================
    // unregister / shutdown
    // ========================================================================

    /// End a subscription: cancel its runnables, detach multicast routing
    /// and send a `SubscriptionStop` to the provider. Idempotent.
    pub fn unregister_subscription(&self, subscription_id: &str) {
        let Some(subscription) = self.take_subscription(subscription_id) else {
            log::debug!(
                "[SUBSCRIPTION] unregister for unknown subscription {}, ignoring",
                subscription_id
            );
            return;
        };
        if let Some(multicast_id) = &subscription.multicast_id {
            let id = subscription_id.to_string();
            self.router.remove_multicast_receiver(
                multicast_id,
                &subscription.proxy_participant_id,
                &subscription.provider_participant_id,
                Box::new(|| {}),
                Box::new(move |error| {
                    log::warn!(
                        "[SUBSCRIPTION] multicast receiver removal for {} failed: {}",
                        id,
                        error
                    );
                }),
            );
        }
        let stop = SubscriptionStop {
            subscription_id: subscription_id.to_string(),
        };
        if let Err(e) = self.sender.send_subscription_stop(
            &subscription.proxy_participant_id,
            &subscription.provider_participant_id,
            &stop,
        ) {
            log::warn!(
                "[SUBSCRIPTION] failed to send stop for {}: {}",
                subscription_id,
                e
            );
        }
    }

    /// Drop all local subscription state without contacting providers.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        for id in ids {
            self.discard_subscription(&id);
        }
    }

    #[must_use]
    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        self.subscriptions.lock().contains_key(subscription_id)
    }

    // ========================================================================
    // internals
    // ========================================================================

    fn subscription(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(subscription_id).cloned()
    }

    /// Remove local state and cancel runnables, without any outbound
    /// traffic.
    fn discard_subscription(&self, subscription_id: &str) {
        if let Some(subscription) = self.take_subscription(subscription_id) {
            drop(subscription);
        }
    }

    fn take_subscription(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        let subscription = self.subscriptions.lock().remove(subscription_id)?;
        {
            let mut state = subscription.state.lock();
            let mut missed = state.missed_handle;
            let mut end = state.end_handle;
            self.scheduler.unschedule(&mut missed);
            self.scheduler.unschedule(&mut end);
            state.missed_handle = ScheduleHandle::INVALID;
            state.end_handle = ScheduleHandle::INVALID;
        }
        Some(subscription)
    }
}

/// Wildcard allowed only as the final partition segment; segments must be
/// non-empty.
fn validate_receiver_partitions(partitions: &[String]) -> Result<()> {
    for (index, partition) in partitions.iter().enumerate() {
        if partition.is_empty() {
            return Err(Error::InvalidArgument(
                "empty partition segment in multicast pattern".into(),
            ));
        }
        if partition == MULTICAST_WILDCARD && index + 1 != partitions.len() {
            return Err(Error::InvalidArgument(
                "multicast wildcard is only allowed as the last partition segment".into(),
            ));
        }
    }
    Ok(())
}
