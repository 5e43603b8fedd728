// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Messaging core settings.
//!
//! Plain data with serde support so a runtime can overlay values from a
//! settings file. Every field has a standalone default; `Default` yields a
//! configuration suitable for tests and single-process runtimes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings consumed by the router and the two subscription-side managers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingSettings {
    /// Delay between delivery attempts for retryable transport failures.
    /// Retries continue until the message's own expiry (no attempt cap).
    #[serde(default = "default_send_retry_interval_ms")]
    pub send_msg_retry_interval_ms: u64,

    /// Upper bound on messages queued for unresolved destinations, across
    /// all destinations.
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,

    /// Upper bound on queued messages for one destination participant.
    #[serde(default = "default_max_queued_per_participant")]
    pub max_queued_messages_per_participant: usize,

    /// Interval of the periodic sweep that drops expired queued messages
    /// and prunes stale resolution state.
    #[serde(default = "default_cleanup_interval_ms")]
    pub routing_cleanup_interval_ms: u64,

    /// Additive safety margin applied to subscription expiry dates and
    /// publication TTLs to absorb clock skew between peers.
    #[serde(default)]
    pub ttl_uplift_ms: u64,

    /// Worker threads of the delayed scheduler.
    #[serde(default = "default_scheduler_threads")]
    pub scheduler_threads: usize,

    /// Routing table persistence file. `None` disables persistence.
    #[serde(default)]
    pub routing_table_file: Option<PathBuf>,

    /// Persistence file for pending attribute subscription requests.
    #[serde(default)]
    pub attribute_subscriptions_file: Option<PathBuf>,

    /// Persistence file for pending broadcast subscription requests.
    #[serde(default)]
    pub broadcast_subscriptions_file: Option<PathBuf>,
}

fn default_send_retry_interval_ms() -> u64 {
    5_000
}

fn default_max_queued_messages() -> usize {
    10_000
}

fn default_max_queued_per_participant() -> usize {
    1_000
}

fn default_cleanup_interval_ms() -> u64 {
    1_000
}

fn default_scheduler_threads() -> usize {
    4
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            send_msg_retry_interval_ms: default_send_retry_interval_ms(),
            max_queued_messages: default_max_queued_messages(),
            max_queued_messages_per_participant: default_max_queued_per_participant(),
            routing_cleanup_interval_ms: default_cleanup_interval_ms(),
            ttl_uplift_ms: 0,
            scheduler_threads: default_scheduler_threads(),
            routing_table_file: None,
            attribute_subscriptions_file: None,
            broadcast_subscriptions_file: None,
        }
    }
}
