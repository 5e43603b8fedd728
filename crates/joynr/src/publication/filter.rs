// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Broadcast filter chain.
//!
//! Selective broadcasts run every registered filter before publishing;
//! the chain is a logical AND. A filter rejecting one event suppresses
//! only that publication, subsequent events are evaluated afresh.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Provider-supplied predicate over broadcast event values.
pub trait BroadcastFilter: Send + Sync {
    /// Broadcast name this filter applies to.
    fn broadcast_name(&self) -> &str;

    /// True keeps the event; false suppresses this one publication.
    fn filter(&self, values: &[Value], filter_parameters: &HashMap<String, String>) -> bool;
}

/// Filters keyed by `(provider participant id, broadcast name)`.
#[derive(Default)]
pub struct BroadcastFilterChain {
    filters: Mutex<HashMap<(String, String), Vec<Arc<dyn BroadcastFilter>>>>,
}

impl BroadcastFilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, provider_participant_id: &str, filter: Arc<dyn BroadcastFilter>) {
        let key = (
            provider_participant_id.to_string(),
            filter.broadcast_name().to_string(),
        );
        self.filters.lock().entry(key).or_default().push(filter);
    }

    pub fn remove_provider(&self, provider_participant_id: &str) {
        self.filters
            .lock()
            .retain(|(provider, _), _| provider != provider_participant_id);
    }

    /// Evaluate the chain (logical AND). No registered filter means pass.
    #[must_use]
    pub fn passes(
        &self,
        provider_participant_id: &str,
        broadcast_name: &str,
        values: &[Value],
        filter_parameters: &HashMap<String, String>,
    ) -> bool {
        let key = (
            provider_participant_id.to_string(),
            broadcast_name.to_string(),
        );
        let chain: Vec<Arc<dyn BroadcastFilter>> = self
            .filters
            .lock()
            .get(&key)
            .map(|filters| filters.to_vec())
            .unwrap_or_default();
        chain
            .iter()
            .all(|filter| filter.filter(values, filter_parameters))
    }
}
