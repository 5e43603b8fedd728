// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Transport stubs and the stub factory.
//!
//! A [`MessagingStub`] performs exactly one delivery attempt for one
//! resolved address. Concrete transports live outside the core; they plug
//! a [`StubCreator`] per address kind into the factory. Created stubs are
//! cached keyed by address value, so equal addresses share one stub.

use crate::error::{Error, OnError, Result};
use crate::messaging::address::{Address, AddressKind};
use crate::messaging::ImmutableMessage;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// One-attempt message sender for a resolved address.
///
/// Expected transport errors are reported through `on_failure`, never by
/// panicking across the boundary. A transmit that does not call the
/// callback succeeded.
pub trait MessagingStub: Send + Sync {
    fn transmit(&self, message: Arc<ImmutableMessage>, on_failure: OnError);
}

/// Per-address-kind stub constructor supplied by a transport integration.
pub trait StubCreator: Send + Sync {
    fn create(&self, address: &Address) -> Result<Arc<dyn MessagingStub>>;
}

impl<F> StubCreator for F
where
    F: Fn(&Address) -> Result<Arc<dyn MessagingStub>> + Send + Sync,
{
    fn create(&self, address: &Address) -> Result<Arc<dyn MessagingStub>> {
        self(address)
    }
}

/// Creates (or reuses) transport stubs for resolved addresses.
pub struct MessagingStubFactory {
    creators: RwLock<HashMap<AddressKind, Box<dyn StubCreator>>>,
    cache: DashMap<Address, Arc<dyn MessagingStub>>,
}

impl Default for MessagingStubFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingStubFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            creators: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
        }
    }

    /// Register the creator responsible for one address kind. A second
    /// registration for the same kind replaces the first.
    pub fn register(&self, kind: AddressKind, creator: Box<dyn StubCreator>) {
        self.creators.write().insert(kind, creator);
    }

    /// Get the stub for an address, creating and caching it on first use.
    ///
    /// Returns [`Error::InvalidAddress`] when no creator is registered for
    /// the address kind; creation failures pass through unchanged and are
    /// not cached.
    pub fn create(&self, address: &Address) -> Result<Arc<dyn MessagingStub>> {
        if let Some(stub) = self.cache.get(address) {
            return Ok(Arc::clone(&stub));
        }
        let creators = self.creators.read();
        let creator = creators.get(&address.kind()).ok_or_else(|| {
            Error::InvalidAddress(format!("no stub creator registered for {}", address))
        })?;
        let stub = creator.create(address)?;
        self.cache.insert(address.clone(), Arc::clone(&stub));
        Ok(stub)
    }

    /// Drop a cached stub (e.g. when a connection closed).
    pub fn remove(&self, address: &Address) {
        self.cache.remove(address);
    }

    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.cache.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullStub;

    impl MessagingStub for NullStub {
        fn transmit(&self, _message: Arc<ImmutableMessage>, _on_failure: OnError) {}
    }

    fn ws(id: &str) -> Address {
        Address::WebSocketClient { id: id.into() }
    }

    #[test]
    fn test_unregistered_kind_is_invalid_address() {
        let factory = MessagingStubFactory::new();
        match factory.create(&ws("c1")) {
            Err(Error::InvalidAddress(_)) => {}
            other => panic!("expected InvalidAddress, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_equal_addresses_share_one_stub() {
        let factory = MessagingStubFactory::new();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        factory.register(
            AddressKind::WebSocketClient,
            Box::new(move |_addr: &Address| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(NullStub) as Arc<dyn MessagingStub>)
            }),
        );
        let a = factory.create(&ws("c1")).unwrap();
        let b = factory.create(&ws("c1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        // A different value gets its own stub.
        let _c = factory.create(&ws("c2")).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_forces_recreation() {
        let factory = MessagingStubFactory::new();
        factory.register(
            AddressKind::WebSocketClient,
            Box::new(|_addr: &Address| Ok(Arc::new(NullStub) as Arc<dyn MessagingStub>)),
        );
        let first = factory.create(&ws("c1")).unwrap();
        assert!(factory.contains(&ws("c1")));
        factory.remove(&ws("c1"));
        assert!(!factory.contains(&ws("c1")));
        let second = factory.create(&ws("c1")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
