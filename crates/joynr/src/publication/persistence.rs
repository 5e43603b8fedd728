// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Persistence of pending subscription requests.
//!
//! The publication manager writes its current attribute and broadcast
//! subscription-request maps through on every add/remove, and reloads
//! them at startup into the orphan queue. One storage instance guards one
//! JSON file; writes are serialized by a dedicated lock so concurrent
//! saves cannot interleave. A missing file loads as empty, and a single
//! malformed array element is skipped without aborting the rest.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One persisted subscription request with its addressing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSubscriptionRequest<R> {
    pub proxy_participant_id: String,
    pub provider_participant_id: String,
    pub request: R,
}

/// JSON-array file storage for one request map.
pub struct SubscriptionRequestStorage {
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl SubscriptionRequestStorage {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file_lock: Mutex::new(()),
        }
    }

    /// Overwrite the file with the given entries. Failures are logged and
    /// swallowed; persistence is a best-effort cache, not ground truth.
    pub fn save<R: Serialize>(&self, entries: &[PersistedSubscriptionRequest<R>]) {
        let _guard = self.file_lock.lock();
        match serde_json::to_vec_pretty(entries) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    log::error!(
                        "[PUBLICATION] failed to write {}: {}",
                        self.path.display(),
                        e
                    );
                }
            }
            Err(e) => {
                log::error!("[PUBLICATION] failed to serialize subscription requests: {}", e);
            }
        }
    }

    /// Read all parseable entries. Missing file -> empty.
    #[must_use]
    pub fn load<R: DeserializeOwned>(&self) -> Vec<PersistedSubscriptionRequest<R>> {
        let _guard = self.file_lock.lock();
        if !self.path.exists() {
            return Vec::new();
        }
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("[PUBLICATION] failed to read {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(e) => {
                log::error!(
                    "[PUBLICATION] malformed subscription request file {}: {}",
                    self.path.display(),
                    e
                );
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value(value) {
                Ok(entry) => out.push(entry),
                Err(e) => {
                    log::error!("[PUBLICATION] skipping malformed persisted request: {}", e);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubscriptionRequest;
    use crate::qos::SubscriptionQos;

    fn request(id: &str) -> PersistedSubscriptionRequest<SubscriptionRequest> {
        PersistedSubscriptionRequest {
            proxy_participant_id: "proxy".into(),
            provider_participant_id: "provider".into(),
            request: SubscriptionRequest {
                subscription_id: id.into(),
                subscribed_to_name: "level".into(),
                qos: SubscriptionQos::on_change(60_000, 100),
            },
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SubscriptionRequestStorage::new(dir.path().join("subs.json"));
        storage.save(&[request("s1"), request("s2")]);
        let loaded: Vec<PersistedSubscriptionRequest<SubscriptionRequest>> = storage.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].request.subscription_id, "s1");
        assert_eq!(loaded[0].proxy_participant_id, "proxy");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SubscriptionRequestStorage::new(dir.path().join("absent.json"));
        let loaded: Vec<PersistedSubscriptionRequest<SubscriptionRequest>> = storage.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_malformed_entry_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.json");
        let mut good = serde_json::to_value(request("good")).unwrap();
        // Keep one valid entry next to one broken entry.
        let raw = serde_json::to_string(&vec![
            good.take(),
            serde_json::json!({"unexpected": true}),
        ])
        .unwrap();
        std::fs::write(&path, raw).unwrap();
        let storage = SubscriptionRequestStorage::new(path);
        let loaded: Vec<PersistedSubscriptionRequest<SubscriptionRequest>> = storage.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].request.subscription_id, "good");
    }
}
