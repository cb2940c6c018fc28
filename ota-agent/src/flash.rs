// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Two bank image sink on NOR flash.
//!
//! The flash holds two equally sized banks and one metadata page. The
//! metadata record says which bank runs, which one is staged and which one
//! was last known good. The bootloader reads the same record.

use crate::{
    error::SinkError,
    sink::{ImageSink, Partition, PlatformImageState},
};
use crc::{Crc, CRC_32_ISCSI};
use embedded_storage::nor_flash::NorFlash;
use serde::{Deserialize, Serialize};

/// Marks a metadata record, "OTA1".
const METADATA_MAGIC: u32 = 0x4f54_4131;

/// Room for a serialized record and its framing.
const METADATA_RECORD_SIZE: usize = 64;

/// Largest flash write granularity handled when padding partial writes.
const MAX_WRITE_SIZE: usize = 32;

/// Restarts the device.
pub trait SystemReset {
    fn reset(&mut self);
}

/// Placement of the banks and the metadata page, as flash offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    pub banks: [u32; 2],
    pub bank_size: u32,
    pub metadata: u32,
}

/// Persistent boot state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootMetadata {
    /// Bank booted by the bootloader
    pub active: Partition,
    /// Bank staged for the next boot
    pub pending: Option<Partition>,
    /// Bank to go back to when the active one fails its self test
    pub last_known_good: Partition,
    pub state: PlatformImageState,
    /// Size of the image in the staged or active bank
    pub image_size: u32,
    /// Self test window left to the image under test, zero once claimed
    pub self_test_window_ms: u32,
}

impl Default for BootMetadata {
    fn default() -> Self {
        Self {
            active: Partition(0),
            pending: None,
            last_known_good: Partition(0),
            state: PlatformImageState::Valid,
            image_size: 0,
            self_test_window_ms: 0,
        }
    }
}

impl BootMetadata {
    /// Record layout: magic, length, postcard body, CRC-32 of the body.
    fn encode(&self, buf: &mut [u8; METADATA_RECORD_SIZE]) -> Result<usize, SinkError> {
        buf.fill(0xFF);
        let (header, rest) = buf.split_at_mut(6);
        let body_len = postcard::to_slice(self, &mut rest[..METADATA_RECORD_SIZE - 10])
            .map_err(|_| SinkError::Metadata)?
            .len();
        header[..4].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&(body_len as u16).to_le_bytes());
        let crc = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&rest[..body_len]);
        rest[body_len..body_len + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(6 + body_len + 4)
    }

    fn decode(buf: &[u8; METADATA_RECORD_SIZE]) -> Option<Self> {
        let magic = u32::from_le_bytes(buf[..4].try_into().ok()?);
        if magic != METADATA_MAGIC {
            return None;
        }
        let body_len = u16::from_le_bytes(buf[4..6].try_into().ok()?) as usize;
        let body = buf.get(6..6 + body_len)?;
        let crc = u32::from_le_bytes(buf.get(6 + body_len..10 + body_len)?.try_into().ok()?);
        if Crc::<u32>::new(&CRC_32_ISCSI).checksum(body) != crc {
            return None;
        }
        postcard::from_bytes(body).ok()
    }
}

/// [`ImageSink`] over a NOR flash holding two banks and a metadata page.
pub struct FlashSink<F, R> {
    flash: F,
    reset: R,
    layout: FlashLayout,
    meta: BootMetadata,
}

impl<F: NorFlash, R: SystemReset> FlashSink<F, R> {
    /// Open the sink, reading the metadata record. A blank or corrupt record
    /// reads as bank 0 running and valid.
    pub fn new(mut flash: F, reset: R, layout: FlashLayout) -> Result<Self, SinkError> {
        let erase = F::ERASE_SIZE as u32;
        let aligned = |v: u32| v % erase == 0;
        if layout.bank_size == 0
            || !aligned(layout.bank_size)
            || !layout.banks.iter().all(|b| aligned(*b))
            || !aligned(layout.metadata)
            || F::WRITE_SIZE > MAX_WRITE_SIZE
        {
            return Err(SinkError::Unaligned);
        }
        let end = |start: u32, len: u32| start.checked_add(len).ok_or(SinkError::OutOfBounds);
        let regions = [
            (layout.banks[0], end(layout.banks[0], layout.bank_size)?),
            (layout.banks[1], end(layout.banks[1], layout.bank_size)?),
            (layout.metadata, end(layout.metadata, erase)?),
        ];
        for (i, (start, stop)) in regions.iter().enumerate() {
            if *stop as usize > flash.capacity() {
                return Err(SinkError::OutOfBounds);
            }
            let overlaps = regions[i + 1..]
                .iter()
                .any(|(s, e)| start < e && s < stop);
            if overlaps {
                return Err(SinkError::OutOfBounds);
            }
        }

        let mut buf = [0; METADATA_RECORD_SIZE];
        flash
            .read(layout.metadata, &mut buf)
            .map_err(|_| SinkError::Read)?;
        let meta = match BootMetadata::decode(&buf) {
            Some(meta) => meta,
            None => {
                warn!("no valid boot metadata, assuming bank 0");
                BootMetadata::default()
            }
        };
        Ok(Self {
            flash,
            reset,
            layout,
            meta,
        })
    }

    pub fn metadata(&self) -> &BootMetadata {
        &self.meta
    }

    /// Give back the flash and the reset hook.
    pub fn release(self) -> (F, R) {
        (self.flash, self.reset)
    }

    fn bank_offset(&self, partition: Partition) -> Result<u32, SinkError> {
        self.layout
            .banks
            .get(partition.0 as usize)
            .copied()
            .ok_or(SinkError::OutOfBounds)
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<(), SinkError> {
        match offset.checked_add(len as u32) {
            Some(end) if end <= self.layout.bank_size => Ok(()),
            _ => Err(SinkError::OutOfBounds),
        }
    }

    fn store(&mut self, meta: BootMetadata) -> Result<(), SinkError> {
        let mut buf = [0; METADATA_RECORD_SIZE];
        let len = meta.encode(&mut buf)?;
        let len = len.next_multiple_of(F::WRITE_SIZE);
        let start = self.layout.metadata;
        self.flash
            .erase(start, start + F::ERASE_SIZE as u32)
            .map_err(|_| SinkError::Metadata)?;
        self.flash
            .write(start, &buf[..len])
            .map_err(|_| SinkError::Metadata)?;
        self.meta = meta;
        debug!("boot metadata stored: {:?}", self.meta);
        Ok(())
    }
}

impl<F: NorFlash, R: SystemReset> ImageSink for FlashSink<F, R> {
    fn pending_partition(&self) -> Partition {
        Partition(1 - self.meta.active.0.min(1))
    }

    fn erase(&mut self, partition: Partition) -> Result<(), SinkError> {
        if partition == self.meta.active {
            return Err(SinkError::BadImageState);
        }
        let start = self.bank_offset(partition)?;
        self.flash
            .erase(start, start + self.layout.bank_size)
            .map_err(|_| SinkError::Erase)?;
        // A new image replaces whatever was staged or rolled back before.
        if self.meta.pending == Some(partition) || self.meta.state == PlatformImageState::Invalid {
            self.store(BootMetadata {
                pending: None,
                state: PlatformImageState::Valid,
                ..self.meta
            })?;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u32, bytes: &[u8]) -> Result<(), SinkError> {
        self.check_bounds(offset, bytes.len())?;
        if offset as usize % F::WRITE_SIZE != 0 {
            return Err(SinkError::Unaligned);
        }
        let base = self.bank_offset(self.pending_partition())? + offset;
        let tail = bytes.len() % F::WRITE_SIZE;
        let (aligned, rest) = bytes.split_at(bytes.len() - tail);
        if !aligned.is_empty() {
            self.flash
                .write(base, aligned)
                .map_err(|_| SinkError::Write)?;
        }
        if !rest.is_empty() {
            let mut pad = [0xFF; MAX_WRITE_SIZE];
            pad[..rest.len()].copy_from_slice(rest);
            self.flash
                .write(base + aligned.len() as u32, &pad[..F::WRITE_SIZE])
                .map_err(|_| SinkError::Write)?;
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), SinkError> {
        self.check_bounds(offset, buf.len())?;
        let base = self.bank_offset(self.pending_partition())? + offset;
        self.flash.read(base, buf).map_err(|_| SinkError::Read)
    }

    fn set_pending_activation(
        &mut self,
        partition: Partition,
        image_size: u32,
        self_test_window_ms: u32,
    ) -> Result<(), SinkError> {
        if partition == self.meta.active || image_size > self.layout.bank_size {
            return Err(SinkError::BadImageState);
        }
        self.bank_offset(partition)?;
        self.store(BootMetadata {
            pending: Some(partition),
            state: PlatformImageState::PendingActivation,
            image_size,
            self_test_window_ms,
            ..self.meta
        })
    }

    fn activate_and_reset(&mut self) -> Result<(), SinkError> {
        let Some(pending) = self.meta.pending else {
            return Err(SinkError::NoPendingImage);
        };
        self.store(BootMetadata {
            active: pending,
            pending: None,
            last_known_good: self.meta.active,
            state: PlatformImageState::PendingCommit,
            ..self.meta
        })
        .map_err(|_| SinkError::Activation)?;
        info!("switching to bank {}", pending.0);
        self.reset.reset();
        Ok(())
    }

    fn begin_self_test(&mut self) -> Result<u32, SinkError> {
        if self.meta.state != PlatformImageState::PendingCommit {
            return Err(SinkError::BadImageState);
        }
        let window_ms = self.meta.self_test_window_ms;
        if window_ms != 0 {
            self.store(BootMetadata {
                self_test_window_ms: 0,
                ..self.meta
            })?;
        }
        Ok(window_ms)
    }

    fn mark_self_test_passed(&mut self) -> Result<(), SinkError> {
        if self.meta.state != PlatformImageState::PendingCommit {
            return Err(SinkError::BadImageState);
        }
        self.store(BootMetadata {
            state: PlatformImageState::Valid,
            last_known_good: self.meta.active,
            ..self.meta
        })
    }

    fn rollback_to_previous(&mut self) -> Result<(), SinkError> {
        let meta = match self.meta.state {
            PlatformImageState::PendingCommit => BootMetadata {
                active: self.meta.last_known_good,
                pending: None,
                state: PlatformImageState::Invalid,
                ..self.meta
            },
            PlatformImageState::PendingActivation => BootMetadata {
                pending: None,
                state: PlatformImageState::Valid,
                ..self.meta
            },
            _ => return Err(SinkError::BadImageState),
        };
        self.store(meta)
    }

    fn image_state(&mut self) -> Result<PlatformImageState, SinkError> {
        Ok(self.meta.state)
    }

    fn reset(&mut self) {
        self.reset.reset();
    }
}
