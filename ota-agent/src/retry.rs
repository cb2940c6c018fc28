// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded retries with exponential backoff.

use consts::{MAX_PUBLISH_RETRIES, PUBLISH_RETRY_DELAY_MS, PUBLISH_RETRY_MAX_DELAY_MS};
use serde::Deserialize;

/// How often an operation is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u8,
    /// Delay before the first retry
    pub base_delay_ms: u32,
    /// Upper bound on any delay
    pub max_delay_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_PUBLISH_RETRIES,
            base_delay_ms: PUBLISH_RETRY_DELAY_MS,
            max_delay_ms: PUBLISH_RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u8, base_delay_ms: u32, max_delay_ms: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Policy that tries once and never waits.
    pub const fn once() -> Self {
        Self::new(1, 0, 0)
    }

    /// Delay before retry number `retry`, counting from zero.
    pub fn backoff_ms(&self, retry: u8) -> u32 {
        let factor = 1u32.checked_shl(retry.into()).unwrap_or(u32::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Fresh attempt counter for one operation.
    pub fn attempts(&self) -> Attempts {
        Attempts {
            made: 0,
            max: self.max_attempts.max(1),
        }
    }
}

/// Attempt counter of one operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Attempts {
    made: u8,
    max: u8,
}

impl Attempts {
    /// Counter allowing `max` attempts.
    pub const fn new(max: u8) -> Self {
        Self { made: 0, max }
    }

    /// Record an attempt. Returns `false` once the budget is spent, in which
    /// case nothing is recorded.
    pub fn try_next(&mut self) -> bool {
        if self.made >= self.max {
            return false;
        }
        self.made += 1;
        true
    }

    pub fn made(&self) -> u8 {
        self.made
    }

    pub fn exhausted(&self) -> bool {
        self.made >= self.max
    }

    pub fn reset(&mut self) {
        self.made = 0;
    }
}
