// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Next-hop routing table.
//!
//! Maps participant id to a [`RoutingEntry`]. Updates follow the address
//! precedence rule: an entry is only replaced when the new address kind is
//! at least as direct as the stored one, and sticky entries are never
//! replaced at all. A refused update is a quiet no-op (logged at debug so
//! stale-route investigations have a trace).
//!
//! The table is a cache, not ground truth: it is persisted to a JSON file
//! as a startup hint and reloaded verbatim, skipping entries that are
//! expired or fail to parse.

use crate::error::Result;
use crate::messaging::address::Address;
use crate::util::time::{is_expired, TimePoint, NO_EXPIRY};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One routing table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingEntry {
    pub address: Address,
    /// Whether this participant may be announced to global transports.
    pub is_globally_visible: bool,
    /// Absolute expiry, `NO_EXPIRY` for permanent entries.
    #[serde(default = "no_expiry")]
    pub expiry_date_ms: TimePoint,
    /// Sticky entries (provisioned routes) are never overwritten or swept.
    #[serde(default)]
    pub is_sticky: bool,
}

fn no_expiry() -> TimePoint {
    NO_EXPIRY
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedEntry {
    participant_id: String,
    #[serde(flatten)]
    entry: RoutingEntry,
}

/// Concurrent routing table with optional write-through persistence.
pub struct RoutingTable {
    entries: RwLock<HashMap<String, RoutingEntry>>,
    persist_file: Option<PathBuf>,
    /// Serializes file writes so concurrent updates cannot interleave JSON.
    file_lock: Mutex<()>,
}

impl RoutingTable {
    #[must_use]
    pub fn new(persist_file: Option<PathBuf>) -> Self {
        let table = Self {
            entries: RwLock::new(HashMap::new()),
            persist_file,
            file_lock: Mutex::new(()),
        };
        table.load();
        table
    }

    /// Insert or update an entry, subject to the precedence/sticky rule.
    ///
    /// Returns true when the table now holds `entry` for `participant_id`.
    /// A refused lower-precedence update returns false without error.
    pub fn put(&self, participant_id: &str, entry: RoutingEntry) -> bool {
        let accepted = {
            let mut entries = self.entries.write();
            match entries.get(participant_id) {
                Some(existing) if existing.is_sticky => {
                    log::debug!(
                        "[ROUTING] refusing update of sticky entry for {} ({} -> {})",
                        participant_id,
                        existing.address,
                        entry.address
                    );
                    false
                }
                Some(existing)
                    if entry.address.precedence() < existing.address.precedence() =>
                {
                    log::debug!(
                        "[ROUTING] refusing lower-precedence update for {} ({} -> {})",
                        participant_id,
                        existing.address,
                        entry.address
                    );
                    false
                }
                _ => {
                    entries.insert(participant_id.to_string(), entry);
                    true
                }
            }
        };
        if accepted {
            self.persist();
        }
        accepted
    }

    /// Resolve a participant to its next-hop address. Expired entries are
    /// treated as absent (the sweep removes them later).
    #[must_use]
    pub fn lookup(&self, participant_id: &str) -> Option<Address> {
        let entries = self.entries.read();
        entries.get(participant_id).and_then(|e| {
            if is_expired(e.expiry_date_ms) {
                None
            } else {
                Some(e.address.clone())
            }
        })
    }

    /// Full entry lookup (visibility flag included).
    #[must_use]
    pub fn get(&self, participant_id: &str) -> Option<RoutingEntry> {
        let entries = self.entries.read();
        entries.get(participant_id).filter(|e| !is_expired(e.expiry_date_ms)).cloned()
    }

    #[must_use]
    pub fn contains(&self, participant_id: &str) -> bool {
        self.lookup(participant_id).is_some()
    }

    /// Remove an entry. Idempotent; removing an absent id returns false.
    pub fn remove(&self, participant_id: &str) -> bool {
        let removed = self.entries.write().remove(participant_id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// Drop expired, non-sticky entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, e| e.is_sticky || !is_expired(e.expiry_date_ms));
            before - entries.len()
        };
        if removed > 0 {
            log::debug!("[ROUTING] purged {} expired entries", removed);
            self.persist();
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn load(&self) {
        let Some(path) = self.persist_file.as_deref() else {
            return;
        };
        match Self::load_from(path) {
            Ok(loaded) => {
                let count = loaded.len();
                if count > 0 {
                    self.entries.write().extend(loaded);
                    log::info!("[ROUTING] loaded {} persisted entries", count);
                }
            }
            Err(e) => {
                log::error!("[ROUTING] failed to load routing table file: {}", e);
            }
        }
    }

    /// Read persisted entries. A missing file is an empty table; a single
    /// malformed array element is skipped, the rest still load.
    fn load_from(path: &Path) -> Result<HashMap<String, RoutingEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let values: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
        let mut out = HashMap::new();
        for value in values {
            match serde_json::from_value::<PersistedEntry>(value) {
                Ok(persisted) => {
                    if is_expired(persisted.entry.expiry_date_ms) {
                        continue;
                    }
                    out.insert(persisted.participant_id, persisted.entry);
                }
                Err(e) => {
                    log::error!("[ROUTING] skipping malformed persisted entry: {}", e);
                }
            }
        }
        Ok(out)
    }

    fn persist(&self) {
        let Some(path) = self.persist_file.as_deref() else {
            return;
        };
        let snapshot: Vec<PersistedEntry> = {
            let entries = self.entries.read();
            entries
                .iter()
                .map(|(id, entry)| PersistedEntry {
                    participant_id: id.clone(),
                    entry: entry.clone(),
                })
                .collect()
        };
        let _guard = self.file_lock.lock();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    log::error!("[ROUTING] failed to write routing table file: {}", e);
                }
            }
            Err(e) => {
                log::error!("[ROUTING] failed to serialize routing table: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::time::now_ms;

    fn entry(address: Address) -> RoutingEntry {
        RoutingEntry {
            address,
            is_globally_visible: true,
            expiry_date_ms: NO_EXPIRY,
            is_sticky: false,
        }
    }

    fn mqtt() -> Address {
        Address::Mqtt {
            broker_uri: "tcp://b".into(),
            topic: "t".into(),
        }
    }

    fn ws_client() -> Address {
        Address::WebSocketClient { id: "c1".into() }
    }

    #[test]
    fn test_put_and_lookup() {
        let table = RoutingTable::new(None);
        assert!(table.put("p1", entry(mqtt())));
        assert_eq!(table.lookup("p1"), Some(mqtt()));
        assert!(table.lookup("p2").is_none());
    }

    #[test]
    fn test_higher_precedence_overwrites() {
        let table = RoutingTable::new(None);
        assert!(table.put("p1", entry(mqtt())));
        assert!(table.put("p1", entry(ws_client())));
        assert_eq!(table.lookup("p1"), Some(ws_client()));
    }

    #[test]
    fn test_lower_precedence_is_quietly_refused() {
        let table = RoutingTable::new(None);
        assert!(table.put("p1", entry(ws_client())));
        assert!(!table.put("p1", entry(mqtt())));
        // Original address retained.
        assert_eq!(table.lookup("p1"), Some(ws_client()));
    }

    #[test]
    fn test_equal_precedence_overwrites() {
        let table = RoutingTable::new(None);
        assert!(table.put("p1", entry(mqtt())));
        let other = Address::Mqtt {
            broker_uri: "tcp://other".into(),
            topic: "t2".into(),
        };
        assert!(table.put("p1", entry(other.clone())));
        assert_eq!(table.lookup("p1"), Some(other));
    }

    #[test]
    fn test_sticky_never_overwritten() {
        let table = RoutingTable::new(None);
        let mut sticky = entry(mqtt());
        sticky.is_sticky = true;
        assert!(table.put("p1", sticky));
        // Even an in-process address cannot replace a sticky entry.
        let in_process = Address::InProcess {
            skeleton_id: "s".into(),
        };
        assert!(!table.put("p1", entry(in_process)));
        assert_eq!(table.lookup("p1"), Some(mqtt()));
    }

    #[test]
    fn test_expired_entry_invisible_and_swept() {
        let table = RoutingTable::new(None);
        let mut e = entry(mqtt());
        e.expiry_date_ms = now_ms().saturating_sub(1);
        assert!(table.put("p1", e));
        assert!(table.lookup("p1").is_none());
        assert_eq!(table.purge_expired(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = RoutingTable::new(None);
        table.put("p1", entry(mqtt()));
        assert!(table.remove("p1"));
        assert!(!table.remove("p1"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing-table.json");
        {
            let table = RoutingTable::new(Some(path.clone()));
            table.put("p1", entry(mqtt()));
            table.put("p2", entry(ws_client()));
        }
        let reloaded = RoutingTable::new(Some(path));
        assert_eq!(reloaded.lookup("p1"), Some(mqtt()));
        assert_eq!(reloaded.lookup("p2"), Some(ws_client()));
    }

    #[test]
    fn test_load_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing-table.json");
        std::fs::write(
            &path,
            r#"[
                {"participantId":"good","address":{"type":"webSocketClient","id":"c"},"isGloballyVisible":true},
                {"bogus":"entry"}
            ]"#,
        )
        .unwrap();
        let table = RoutingTable::new(Some(path));
        assert!(table.contains("good"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_missing_file_is_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::new(Some(dir.path().join("absent.json")));
        assert!(table.is_empty());
    }
}
