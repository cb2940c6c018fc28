// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistent storage the new image is written to, and the boot-time state
//! that decides which image runs.

use crate::error::SinkError;

/// One firmware bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Partition(pub u8);

/// State of the image as seen by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PlatformImageState {
    /// Running image is committed
    Valid,
    /// A verified image is staged for the next boot
    PendingActivation,
    /// Running image was just activated and awaits its self test verdict
    PendingCommit,
    /// Running image is the result of a rollback
    Invalid,
}

/// Flash partition abstraction the agent writes firmware through.
///
/// `write_at` and `read_at` offsets are relative to the start of the pending
/// partition. `activate_and_reset` normally never returns; the agent does not
/// rely on it returning.
pub trait ImageSink {
    /// Partition the next image is written to.
    fn pending_partition(&self) -> Partition;

    fn erase(&mut self, partition: Partition) -> Result<(), SinkError>;

    fn write_at(&mut self, offset: u32, bytes: &[u8]) -> Result<(), SinkError>;

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), SinkError>;

    /// Stage `partition` holding `image_size` bytes for the next boot. The
    /// image gets `self_test_window_ms` to pass its self test once booted.
    fn set_pending_activation(
        &mut self,
        partition: Partition,
        image_size: u32,
        self_test_window_ms: u32,
    ) -> Result<(), SinkError>;

    /// Switch to the staged image and restart.
    fn activate_and_reset(&mut self) -> Result<(), SinkError>;

    /// Claim the self test window of the running image. The window is
    /// handed out once per activation: after a restart during the self test
    /// it is zero.
    fn begin_self_test(&mut self) -> Result<u32, SinkError>;

    /// Commit the running image after a passed self test.
    fn mark_self_test_passed(&mut self) -> Result<(), SinkError>;

    /// Switch back to the last known good image. Takes effect after a reset.
    fn rollback_to_previous(&mut self) -> Result<(), SinkError>;

    fn image_state(&mut self) -> Result<PlatformImageState, SinkError>;

    /// Restart the device.
    fn reset(&mut self);
}
