// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Subscription control-plane payloads.
//!
//! These are the bodies carried inside messages of the corresponding
//! [`MessageType`](crate::messaging::MessageType): subscription requests,
//! replies, stops and publications. The wire encoding is plain JSON via
//! serde; the byte format beyond that is a transport concern.

use crate::qos::SubscriptionQos;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Separator of the `providerId/broadcast/partition...` multicast id form.
pub const MULTICAST_ID_SEPARATOR: &str = "/";

/// Wildcard token reserved for multicast receiver patterns. Never valid as
/// a partition segment on the publishing side.
pub const MULTICAST_WILDCARD: &str = "*";

/// Build a multicast id from provider, broadcast name and partitions.
#[must_use]
pub fn multicast_id(provider_participant_id: &str, broadcast_name: &str, partitions: &[String]) -> String {
    let mut id = format!(
        "{}{}{}",
        provider_participant_id, MULTICAST_ID_SEPARATOR, broadcast_name
    );
    for partition in partitions {
        id.push_str(MULTICAST_ID_SEPARATOR);
        id.push_str(partition);
    }
    id
}

/// Match a receiver pattern against a concrete multicast id. A trailing
/// wildcard segment matches one or more remaining segments; everywhere
/// else segments must be equal.
#[must_use]
pub fn multicast_matches(pattern: &str, multicast_id: &str) -> bool {
    if pattern == multicast_id {
        return true;
    }
    let pattern_segments: Vec<&str> = pattern.split(MULTICAST_ID_SEPARATOR).collect();
    let id_segments: Vec<&str> = multicast_id.split(MULTICAST_ID_SEPARATOR).collect();
    let Some((&last, head)) = pattern_segments.split_last() else {
        return false;
    };
    if last != MULTICAST_WILDCARD {
        return false;
    }
    if id_segments.len() < pattern_segments.len() {
        return false;
    }
    head.iter().zip(&id_segments).all(|(p, i)| p == i)
}

/// Protocol-level subscription error, delivered to the remote peer inside
/// a [`SubscriptionReply`] or [`SubscriptionPublication`] rather than
/// raised locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionException {
    pub subscription_id: String,
    pub message: String,
}

/// Request to subscribe to one provider attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub subscription_id: String,
    /// Attribute name on the provider interface.
    pub subscribed_to_name: String,
    pub qos: SubscriptionQos,
}

/// Request to subscribe to a (selective) provider broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSubscriptionRequest {
    pub subscription_id: String,
    pub subscribed_to_name: String,
    pub qos: SubscriptionQos,
    /// Filter parameters evaluated by the provider-side filter chain.
    #[serde(default)]
    pub filter_parameters: HashMap<String, String>,
}

/// Request to join a multicast topic/partition combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastSubscriptionRequest {
    pub subscription_id: String,
    pub subscribed_to_name: String,
    pub multicast_id: String,
    pub qos: SubscriptionQos,
}

/// Provider answer to any subscription request. `error` is set when the
/// subscription was rejected (e.g. expiry already in the past).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionReply {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubscriptionException>,
}

impl SubscriptionReply {
    #[must_use]
    pub fn success(subscription_id: String) -> Self {
        Self {
            subscription_id,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(subscription_id: String, message: String) -> Self {
        let error = SubscriptionException {
            subscription_id: subscription_id.clone(),
            message,
        };
        Self {
            subscription_id,
            error: Some(error),
        }
    }
}

/// Consumer request to end a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStop {
    pub subscription_id: String,
}

/// One publication for a unicast subscription. Either `response` (value or
/// broadcast argument list) or `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPublication {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubscriptionException>,
}

impl SubscriptionPublication {
    #[must_use]
    pub fn value(subscription_id: String, values: Vec<Value>) -> Self {
        Self {
            subscription_id,
            response: Some(values),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(subscription_id: String, message: String) -> Self {
        let error = SubscriptionException {
            subscription_id: subscription_id.clone(),
            message,
        };
        Self {
            subscription_id,
            response: None,
            error: Some(error),
        }
    }
}

/// One publication fanned out on a multicast id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastPublication {
    pub multicast_id: String,
    pub response: Vec<Value>,
}
