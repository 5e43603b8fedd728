// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Transport addresses.
//!
//! A closed variant over every transport kind the core can route to.
//! Equality is value-based (two addresses with equal fields are the same
//! next hop), which is what the stub cache keys on.
//!
//! Address kinds are ordered by *precedence*: a routing entry learned via
//! a more direct transport is never overwritten by a less direct one
//! (in-process beats a websocket connection, which beats a brokered
//! transport).

use serde::{Deserialize, Serialize};

/// Resolved transport address of one next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Address {
    /// Provider hosted in this process; `skeleton_id` names the dispatch
    /// target.
    #[serde(rename_all = "camelCase")]
    InProcess { skeleton_id: String },
    /// Server end of a websocket connection.
    #[serde(rename_all = "camelCase")]
    WebSocketServer {
        host: String,
        port: u16,
        path: String,
    },
    /// Client end of a websocket connection, identified by connection id.
    #[serde(rename_all = "camelCase")]
    WebSocketClient { id: String },
    /// MQTT broker topic.
    #[serde(rename_all = "camelCase")]
    Mqtt { broker_uri: String, topic: String },
    /// HTTP long-poll channel.
    #[serde(rename_all = "camelCase")]
    HttpChannel {
        endpoint_url: String,
        channel_id: String,
    },
    /// Browser-hosted endpoint (legacy).
    #[serde(rename_all = "camelCase")]
    Browser { window_id: String },
    /// CommonAPI D-Bus endpoint (legacy).
    #[serde(rename_all = "camelCase")]
    CommonApiDbus {
        domain: String,
        service_name: String,
        participant_id: String,
    },
}

/// Discriminant of [`Address`], used as stub-factory registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    InProcess,
    WebSocketServer,
    WebSocketClient,
    Mqtt,
    HttpChannel,
    Browser,
    CommonApiDbus,
}

impl Address {
    #[must_use]
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::InProcess { .. } => AddressKind::InProcess,
            Address::WebSocketServer { .. } => AddressKind::WebSocketServer,
            Address::WebSocketClient { .. } => AddressKind::WebSocketClient,
            Address::Mqtt { .. } => AddressKind::Mqtt,
            Address::HttpChannel { .. } => AddressKind::HttpChannel,
            Address::Browser { .. } => AddressKind::Browser,
            Address::CommonApiDbus { .. } => AddressKind::CommonApiDbus,
        }
    }

    /// Routing-entry update precedence; higher wins, equal may overwrite.
    #[must_use]
    pub fn precedence(&self) -> u8 {
        match self.kind() {
            AddressKind::InProcess => 4,
            AddressKind::WebSocketServer => 3,
            AddressKind::WebSocketClient => 2,
            AddressKind::Mqtt
            | AddressKind::HttpChannel
            | AddressKind::Browser
            | AddressKind::CommonApiDbus => 1,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::InProcess { skeleton_id } => write!(f, "inprocess:{}", skeleton_id),
            Address::WebSocketServer { host, port, path } => {
                write!(f, "ws-server:{}:{}{}", host, port, path)
            }
            Address::WebSocketClient { id } => write!(f, "ws-client:{}", id),
            Address::Mqtt { broker_uri, topic } => write!(f, "mqtt:{}/{}", broker_uri, topic),
            Address::HttpChannel {
                endpoint_url,
                channel_id,
            } => write!(f, "http:{}/{}", endpoint_url, channel_id),
            Address::Browser { window_id } => write!(f, "browser:{}", window_id),
            Address::CommonApiDbus {
                domain,
                service_name,
                participant_id,
            } => write!(f, "dbus:{}:{}:{}", domain, service_name, participant_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt() -> Address {
        Address::Mqtt {
            broker_uri: "tcp://broker:1883".into(),
            topic: "joynr/p1".into(),
        }
    }

    #[test]
    fn test_precedence_ordering() {
        let in_process = Address::InProcess {
            skeleton_id: "s".into(),
        };
        let ws_server = Address::WebSocketServer {
            host: "h".into(),
            port: 4242,
            path: "/".into(),
        };
        let ws_client = Address::WebSocketClient { id: "c".into() };
        assert!(in_process.precedence() > ws_server.precedence());
        assert!(ws_server.precedence() > ws_client.precedence());
        assert!(ws_client.precedence() > mqtt().precedence());
        let http = Address::HttpChannel {
            endpoint_url: "http://bp".into(),
            channel_id: "ch".into(),
        };
        assert_eq!(mqtt().precedence(), http.precedence());
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(mqtt(), mqtt());
        let other = Address::Mqtt {
            broker_uri: "tcp://broker:1883".into(),
            topic: "joynr/p2".into(),
        };
        assert_ne!(mqtt(), other);
    }

    #[test]
    fn test_serde_tagged_round_trip() {
        let json = serde_json::to_string(&mqtt()).unwrap();
        assert!(json.contains(r#""type":"mqtt""#));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mqtt());
    }
}
