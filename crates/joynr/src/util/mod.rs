// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Small shared utilities (time points, id generation).

pub mod time;

pub use time::{now_ms, TimePoint, NO_EXPIRY};

/// Generate a globally unique id string (message ids, subscription ids).
pub fn create_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
