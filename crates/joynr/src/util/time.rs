// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Absolute time points in unix milliseconds.
//!
//! Expiry dates, TTLs and publication timestamps are all absolute
//! millisecond values. `NO_EXPIRY` is the "never expires" sentinel; every
//! arithmetic helper saturates at that value so a TTL uplift close to the
//! maximum representable time point can never wrap around.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Absolute unix-epoch milliseconds.
pub type TimePoint = u64;

/// Sentinel for entries that never expire.
pub const NO_EXPIRY: TimePoint = u64::MAX;

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_ms() -> TimePoint {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Absolute expiry for a relative TTL, saturating at `NO_EXPIRY`.
#[must_use]
pub fn expiry_from_ttl(ttl_ms: u64) -> TimePoint {
    now_ms().saturating_add(ttl_ms)
}

/// Apply an additive uplift to an absolute expiry, saturating at
/// `NO_EXPIRY`. An entry that never expires stays that way.
#[must_use]
pub fn uplifted(expiry_ms: TimePoint, uplift_ms: u64) -> TimePoint {
    if expiry_ms == NO_EXPIRY {
        NO_EXPIRY
    } else {
        expiry_ms.saturating_add(uplift_ms)
    }
}

/// Whether an absolute expiry has passed.
#[must_use]
pub fn is_expired(expiry_ms: TimePoint) -> bool {
    expiry_ms != NO_EXPIRY && expiry_ms <= now_ms()
}

/// Remaining time until an absolute expiry, `Duration::ZERO` if passed.
#[must_use]
pub fn remaining(expiry_ms: TimePoint) -> Duration {
    if expiry_ms == NO_EXPIRY {
        return Duration::from_millis(u64::MAX / 2);
    }
    Duration::from_millis(expiry_ms.saturating_sub(now_ms()))
}
