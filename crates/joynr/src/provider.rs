// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Provider-side collaborator surface.
//!
//! The publication manager never talks to generated provider code
//! directly. It registers change listeners through a [`RequestCaller`] and
//! reads attribute values through a [`RequestInterpreter`] looked up by
//! interface name in an explicit [`RequestInterpreterRegistry`] (no
//! process-wide singletons). A missing interpreter aborts the single
//! affected poll with an error log; it never brings the manager down.

use crate::error::OnError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback registered for attribute-change notifications. The provider
/// invokes it from its own context whenever the watched value changes.
pub trait AttributeListener: Send + Sync {
    fn attribute_value_changed(&self, value: Value);
}

/// Callback registered for broadcast occurrences.
pub trait BroadcastListener: Send + Sync {
    fn broadcast_occurred(&self, values: Vec<Value>);
}

/// Access point to one registered provider instance.
///
/// Registration methods must be idempotent per (name, listener) pair;
/// unregistering an unknown listener is a no-op.
pub trait RequestCaller: Send + Sync {
    /// Interface name used to look up the matching request interpreter.
    fn interface_name(&self) -> &str;

    fn register_attribute_listener(&self, attribute_name: &str, listener: Arc<dyn AttributeListener>);
    fn unregister_attribute_listener(&self, attribute_name: &str, listener: &Arc<dyn AttributeListener>);
    fn register_broadcast_listener(&self, broadcast_name: &str, listener: Arc<dyn BroadcastListener>);
    fn unregister_broadcast_listener(&self, broadcast_name: &str, listener: &Arc<dyn BroadcastListener>);
}

/// Generic, asynchronously answered attribute getter for one interface.
pub trait RequestInterpreter: Send + Sync {
    /// Read `attribute_name` from the provider behind `caller`. The
    /// result (or error) arrives through the callbacks; implementations
    /// must not block the calling thread on application logic.
    fn execute_get(
        &self,
        caller: Arc<dyn RequestCaller>,
        attribute_name: &str,
        on_success: Box<dyn FnOnce(Value) + Send>,
        on_error: OnError,
    );
}

/// Interface name -> interpreter, passed explicitly into the publication
/// manager instead of living in a static registry.
#[derive(Default)]
pub struct RequestInterpreterRegistry {
    interpreters: RwLock<HashMap<String, Arc<dyn RequestInterpreter>>>,
}

impl RequestInterpreterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, interface_name: &str, interpreter: Arc<dyn RequestInterpreter>) {
        self.interpreters
            .write()
            .insert(interface_name.to_string(), interpreter);
    }

    #[must_use]
    pub fn get(&self, interface_name: &str) -> Option<Arc<dyn RequestInterpreter>> {
        self.interpreters.read().get(interface_name).cloned()
    }

    pub fn unregister(&self, interface_name: &str) {
        self.interpreters.write().remove(interface_name);
    }
}
