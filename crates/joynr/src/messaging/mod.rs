// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Message model and routing components.
//!
//! Submodule map:
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`address`] | Transport address variants and precedence |
//! | [`routing_table`] | participant id -> next hop, persisted |
//! | [`message_queue`] | bounded parking for unresolved destinations |
//! | [`stub`] | transport stub trait + value-keyed stub factory |
//! | [`multicast`] | ref-counted multicast receiver directory |
//! | [`router`] | the routing engine tying the above together |
//!
//! This module itself defines the message the whole core routes:
//! [`ImmutableMessage`], a sealed envelope with routing metadata and an
//! opaque serialized payload.

pub mod address;
pub mod message_queue;
pub mod multicast;
pub mod router;
pub mod routing_table;
pub mod stub;

pub use address::{Address, AddressKind};

use crate::error::{Error, Result};
use crate::util::time::{expiry_from_ttl, is_expired, TimePoint};
use crate::util::create_uuid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of application payload a message carries. Routing never inspects
/// the payload; the type drives dispatcher-side handling and multicast
/// fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Request,
    Reply,
    OneWay,
    SubscriptionRequest,
    BroadcastSubscriptionRequest,
    MulticastSubscriptionRequest,
    SubscriptionReply,
    SubscriptionStop,
    Publication,
    Multicast,
}

/// One routable message.
///
/// Immutable after construction; the router and queues share it by `Arc`.
/// `recipient` is a participant id, except for [`MessageType::Multicast`]
/// where it is the multicast id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmutableMessage {
    pub id: String,
    pub msg_type: MessageType,
    pub sender: String,
    pub recipient: String,
    pub creation_ms: TimePoint,
    /// Absolute expiry; the message is never delivered past this point.
    pub expiry_date_ms: TimePoint,
    /// Best-effort messages skip the retry path entirely.
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// Serialized application payload (JSON bytes).
    #[serde(with = "serde_bytes_b64")]
    pub payload: Vec<u8>,
}

impl ImmutableMessage {
    /// Build a message with a fresh unique id and a TTL relative to now.
    #[must_use]
    pub fn new(
        msg_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        ttl_ms: u64,
        payload: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: create_uuid(),
            msg_type,
            sender: sender.into(),
            recipient: recipient.into(),
            creation_ms: crate::util::time::now_ms(),
            expiry_date_ms: expiry_from_ttl(ttl_ms),
            best_effort: false,
            custom_headers: HashMap::new(),
            payload,
        })
    }

    /// Build a message carrying a serde-serializable payload.
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        ttl_ms: u64,
        payload: &T,
    ) -> Result<Arc<Self>> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(Self::new(msg_type, sender, recipient, ttl_ms, bytes))
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        is_expired(self.expiry_date_ms)
    }

    /// Decode the payload. Malformed payloads yield
    /// [`Error::Serialization`], never a panic.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::Serialization(format!("message {}: {}", self.id, e)))
    }
}

/// Payload bytes serialize as base64 so persisted messages stay valid JSON.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
