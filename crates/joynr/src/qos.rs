// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Subscription quality-of-service policies.
//!
//! A [`SubscriptionQos`] combines the lifetime of a subscription (absolute
//! expiry date, publication message TTL, missed-publication alert interval)
//! with a delivery [`SubscriptionQosKind`]: on-change with a minimum (and
//! optional keep-alive maximum) interval, or purely periodic.
//!
//! All durations are milliseconds; expiry dates are absolute unix ms with
//! [`NO_EXPIRY`](crate::util::time::NO_EXPIRY) meaning "never".

use crate::util::time::{expiry_from_ttl, TimePoint, NO_EXPIRY};
use serde::{Deserialize, Serialize};

/// Default TTL of a single publication message.
pub const DEFAULT_PUBLICATION_TTL_MS: u64 = 10_000;

/// Delivery policy of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SubscriptionQosKind {
    /// Publish when the value changes, at most once per `min_interval_ms`.
    /// A non-zero `max_interval_ms` additionally forces a keep-alive
    /// publication when nothing changed for that long.
    #[serde(rename_all = "camelCase")]
    OnChange {
        min_interval_ms: u64,
        max_interval_ms: u64,
    },
    /// Publish the polled attribute value every `period_ms`.
    #[serde(rename_all = "camelCase")]
    Periodic { period_ms: u64 },
}

/// Quality-of-service contract attached to one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionQos {
    /// Absolute expiry of the whole subscription.
    pub expiry_date_ms: TimePoint,
    /// TTL stamped on each outgoing publication message.
    pub publication_ttl_ms: u64,
    /// Consumer-side watchdog interval; 0 disables missed-publication
    /// alerting.
    pub alert_after_interval_ms: u64,
    pub kind: SubscriptionQosKind,
}

impl SubscriptionQos {
    /// On-change subscription valid for `validity_ms` from now.
    #[must_use]
    pub fn on_change(validity_ms: u64, min_interval_ms: u64) -> Self {
        Self {
            expiry_date_ms: expiry_from_ttl(validity_ms),
            publication_ttl_ms: DEFAULT_PUBLICATION_TTL_MS,
            alert_after_interval_ms: 0,
            kind: SubscriptionQosKind::OnChange {
                min_interval_ms,
                max_interval_ms: 0,
            },
        }
    }

    /// Periodic subscription valid for `validity_ms` from now.
    #[must_use]
    pub fn periodic(validity_ms: u64, period_ms: u64) -> Self {
        Self {
            expiry_date_ms: expiry_from_ttl(validity_ms),
            publication_ttl_ms: DEFAULT_PUBLICATION_TTL_MS,
            alert_after_interval_ms: 0,
            kind: SubscriptionQosKind::Periodic { period_ms },
        }
    }

    /// On-change subscription that additionally publishes the current
    /// value when nothing changed for `max_interval_ms` (keep-alive).
    #[must_use]
    pub fn on_change_with_keep_alive(
        validity_ms: u64,
        min_interval_ms: u64,
        max_interval_ms: u64,
    ) -> Self {
        let mut qos = Self::on_change(validity_ms, min_interval_ms);
        qos.kind = SubscriptionQosKind::OnChange {
            min_interval_ms,
            max_interval_ms,
        };
        qos
    }

    /// Subscription that never expires (on-change).
    #[must_use]
    pub fn on_change_forever(min_interval_ms: u64) -> Self {
        let mut qos = Self::on_change(0, min_interval_ms);
        qos.expiry_date_ms = NO_EXPIRY;
        qos
    }

    #[must_use]
    pub fn with_alert_after_interval(mut self, alert_after_interval_ms: u64) -> Self {
        self.alert_after_interval_ms = alert_after_interval_ms;
        self
    }

    #[must_use]
    pub fn with_publication_ttl(mut self, publication_ttl_ms: u64) -> Self {
        self.publication_ttl_ms = publication_ttl_ms;
        self
    }

    /// Minimum pause between two publications for this subscription.
    /// Periodic subscriptions never publish faster than their period.
    #[must_use]
    pub fn min_interval_ms(&self) -> u64 {
        match self.kind {
            SubscriptionQosKind::OnChange {
                min_interval_ms, ..
            } => min_interval_ms,
            SubscriptionQosKind::Periodic { period_ms } => period_ms,
        }
    }

    /// Interval after which the consumer expects the next publication, for
    /// the missed-publication watchdog. 0 when no expectation exists.
    #[must_use]
    pub fn expected_interval_ms(&self) -> u64 {
        match self.kind {
            SubscriptionQosKind::OnChange {
                max_interval_ms, ..
            } => max_interval_ms,
            SubscriptionQosKind::Periodic { period_ms } => period_ms,
        }
    }
}
