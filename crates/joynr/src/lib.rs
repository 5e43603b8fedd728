// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! # joynr - distributed-object messaging core
//!
//! A pure Rust implementation of the joynr messaging layer: participant
//! routing with hierarchical parent delegation, bounded parking of
//! messages for not-yet-resolved destinations, retry-until-expiry
//! delivery, and attribute/broadcast/multicast publish-subscribe with
//! QoS-driven scheduling on both the provider and the consumer side.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use joynr::messaging::router::MessageRouter;
//! use joynr::messaging::routing_table::RoutingTable;
//! use joynr::messaging::stub::MessagingStubFactory;
//! use joynr::messaging::{ImmutableMessage, MessageType};
//! use joynr::config::MessagingSettings;
//! use joynr::scheduler::DelayedScheduler;
//! use std::sync::Arc;
//!
//! # fn main() -> joynr::Result<()> {
//! let settings = MessagingSettings::default();
//! let scheduler = DelayedScheduler::new(settings.scheduler_threads);
//! let router = MessageRouter::new(
//!     &settings,
//!     Arc::new(RoutingTable::new(None)),
//!     Arc::clone(&scheduler),
//!     Arc::new(MessagingStubFactory::new()),
//!     None, // no parent router
//!     None, // no transport-level multicast hook
//! );
//!
//! let message = ImmutableMessage::new(
//!     MessageType::Request,
//!     "proxy-participant",
//!     "provider-participant",
//!     60_000,
//!     b"{}".to_vec(),
//! );
//! router.route(message)?;
//! # router.shutdown();
//! # scheduler.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |    proxies / providers  ->  listeners, request callers             |
//! +--------------------------------------------------------------------+
//! |                      Subscription Layer                            |
//! |  SubscriptionManager (consumer)  |  PublicationManager (provider)  |
//! |  watchdog, end runnables         |  coalescing, polling, filters   |
//! +--------------------------------------------------------------------+
//! |                        Routing Layer                               |
//! |  MessageRouter | RoutingTable | MessageQueue | multicast directory |
//! +--------------------------------------------------------------------+
//! |                       Transport Layer                              |
//! |  MessagingStub per Address (in-process, WebSocket, MQTT, HTTP)     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`messaging::router::MessageRouter`] | Routes messages to the next hop, queues and retries |
//! | [`messaging::routing_table::RoutingTable`] | participant id -> transport address, persisted |
//! | [`scheduler::DelayedScheduler`] | Thread-pool backed delayed execution with decay |
//! | [`publication::PublicationManager`] | Provider-side subscription lifecycle and publishing |
//! | [`subscription::SubscriptionManager`] | Consumer-side subscriptions, watchdog, dispatch |
//! | [`qos::SubscriptionQos`] | Per-subscription delivery contract |
//!
//! Errors surface as [`error::Error`] through explicit `Result`s on the
//! synchronous surface and through `OnError` callbacks wherever an
//! operation completes asynchronously; no error crosses an asynchronous
//! boundary as a panic.

pub mod config;
pub mod error;
pub mod messaging;
pub mod protocol;
pub mod provider;
pub mod publication;
pub mod qos;
pub mod scheduler;
pub mod subscription;
pub mod util;

pub use config::MessagingSettings;
pub use error::{Error, OnError, OnSuccess, Result};
pub use messaging::{Address, ImmutableMessage, MessageType};
pub use qos::{SubscriptionQos, SubscriptionQosKind};
