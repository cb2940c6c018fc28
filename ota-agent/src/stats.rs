// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::agent::OtaState;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use serde::Serialize;

/// Counters shared between the transport callback and the agent task.
#[derive(Debug, Default)]
pub struct Statistics {
    packets_received: AtomicU32,
    packets_queued: AtomicU32,
    packets_processed: AtomicU32,
    packets_dropped: AtomicU32,
    blocks_received: AtomicU32,
    duplicate_blocks: AtomicU32,
    retries_issued: AtomicU32,
    jobs_completed: AtomicU32,
    jobs_failed: AtomicU32,
    state: AtomicU8,
}

/// Copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtaStatistics {
    /// Messages handed over by the transport
    pub packets_received: u32,
    /// Messages put on the agent queue
    pub packets_queued: u32,
    /// Messages taken off the queue by the agent
    pub packets_processed: u32,
    /// Messages lost to a full queue, an unknown topic or their size
    pub packets_dropped: u32,
    pub blocks_received: u32,
    pub duplicate_blocks: u32,
    pub retries_issued: u32,
    pub jobs_completed: u32,
    pub jobs_failed: u32,
    pub state: OtaState,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $inc(&self, n: u32) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl Statistics {
    pub const fn new() -> Self {
        Self {
            packets_received: AtomicU32::new(0),
            packets_queued: AtomicU32::new(0),
            packets_processed: AtomicU32::new(0),
            packets_dropped: AtomicU32::new(0),
            blocks_received: AtomicU32::new(0),
            duplicate_blocks: AtomicU32::new(0),
            retries_issued: AtomicU32::new(0),
            jobs_completed: AtomicU32::new(0),
            jobs_failed: AtomicU32::new(0),
            state: AtomicU8::new(OtaState::Idle as u8),
        }
    }

    counter! {
        add_received => packets_received,
        add_queued => packets_queued,
        add_processed => packets_processed,
        add_dropped => packets_dropped,
        add_blocks => blocks_received,
        add_duplicates => duplicate_blocks,
        add_retries => retries_issued,
        add_completed => jobs_completed,
        add_failed => jobs_failed,
    }

    pub(crate) fn set_state(&self, state: OtaState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> OtaState {
        OtaState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> OtaStatistics {
        let load = |c: &AtomicU32| c.load(Ordering::Relaxed);
        OtaStatistics {
            packets_received: load(&self.packets_received),
            packets_queued: load(&self.packets_queued),
            packets_processed: load(&self.packets_processed),
            packets_dropped: load(&self.packets_dropped),
            blocks_received: load(&self.blocks_received),
            duplicate_blocks: load(&self.duplicate_blocks),
            retries_issued: load(&self.retries_issued),
            jobs_completed: load(&self.jobs_completed),
            jobs_failed: load(&self.jobs_failed),
            state: self.state(),
        }
    }
}
