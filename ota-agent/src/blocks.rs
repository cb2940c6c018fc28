// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reassembly of the image from blocks arriving in any order, any number of
//! times.

use crate::{
    bitmap::{BlockBitmap, Window},
    error::BlockError,
    sink::ImageSink,
};
use consts::{FILE_BLOCK_SIZE, MAX_BLOCKS};
use sha2::{Digest, Sha256};

/// A block of the image as delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareBlock<'a> {
    pub index: u32,
    pub payload: &'a [u8],
}

/// What happened to a delivered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockOutcome {
    /// Stored for the first time
    Accepted,
    /// Already stored, nothing done
    Duplicate,
}

/// Per transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferCounters {
    pub blocks_received: u32,
    pub duplicate_blocks: u32,
    pub retries_issued: u32,
}

/// Tracks which blocks of one file are stored and drives their retries.
///
/// The digest covers the longest stored prefix of the image. A block arriving
/// in order is hashed straight from the message; blocks that arrived ahead of
/// a gap are read back from the sink once the gap is filled.
pub struct BlockTransfer {
    file_id: u32,
    file_size: u32,
    block_size: u32,
    bitmap: BlockBitmap,
    /// Blocks asked for at least once
    requested: BlockBitmap,
    /// Last window asked for
    outstanding: Option<Window>,
    retries: heapless::Vec<u8, MAX_BLOCKS>,
    max_retries: u8,
    digest: Sha256,
    digested: u32,
    bytes_written: u32,
    counters: TransferCounters,
}

impl BlockTransfer {
    pub fn new(
        file_id: u32,
        file_size: u32,
        block_size: u32,
        max_retries: u8,
    ) -> Result<Self, BlockError> {
        if file_size == 0 || block_size == 0 || block_size as usize > FILE_BLOCK_SIZE {
            return Err(BlockError::TooManyBlocks);
        }
        let bitmap = BlockBitmap::new(file_size.div_ceil(block_size))?;
        let mut retries = heapless::Vec::new();
        retries
            .resize(bitmap.len() as usize, 0)
            .map_err(|_| BlockError::TooManyBlocks)?;
        Ok(Self {
            file_id,
            file_size,
            block_size,
            requested: bitmap.clone(),
            bitmap,
            outstanding: None,
            retries,
            max_retries,
            digest: Sha256::new(),
            digested: 0,
            bytes_written: 0,
            counters: TransferCounters::default(),
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of blocks the file is made of.
    pub fn total_blocks(&self) -> u32 {
        self.bitmap.len()
    }

    pub fn received_blocks(&self) -> u32 {
        self.bitmap.count()
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn counters(&self) -> TransferCounters {
        self.counters
    }

    pub fn bitmap(&self) -> &BlockBitmap {
        &self.bitmap
    }

    /// Every block stored and the byte total matches the file size.
    pub fn is_complete(&self) -> bool {
        self.bitmap.is_complete() && self.bytes_written == self.file_size
    }

    fn expected_len(&self, index: u32) -> u32 {
        if index + 1 == self.bitmap.len() {
            self.file_size - index * self.block_size
        } else {
            self.block_size
        }
    }

    /// Store a delivered block.
    ///
    /// Redelivery of a stored block is a successful no-op. When the sink fails
    /// the block stays missing and the failure counts as one retry.
    pub fn on_block_received(
        &mut self,
        block: FirmwareBlock,
        sink: &mut impl ImageSink,
    ) -> Result<BlockOutcome, BlockError> {
        let index = block.index;
        if index >= self.bitmap.len() {
            return Err(BlockError::OutOfRange { index });
        }
        if self.bitmap.is_set(index) {
            self.counters.duplicate_blocks += 1;
            return Ok(BlockOutcome::Duplicate);
        }
        let len = block.payload.len() as u32;
        if len != self.expected_len(index) {
            return Err(BlockError::SizeMismatch { index, len });
        }
        if let Err(error) = sink.write_at(index * self.block_size, block.payload) {
            self.note_retry(index)?;
            return Err(BlockError::SinkWrite { index, error });
        }
        self.bitmap.set(index)?;
        self.bytes_written += len;
        self.counters.blocks_received += 1;
        if index == self.digested {
            self.digest.update(block.payload);
            self.digested += 1;
            self.advance_digest(sink)?;
        }
        Ok(BlockOutcome::Accepted)
    }

    /// Fold blocks stored ahead of the digest into it, reading them back.
    fn advance_digest(&mut self, sink: &mut impl ImageSink) -> Result<(), BlockError> {
        let mut buf = [0u8; FILE_BLOCK_SIZE];
        while self.digested < self.bitmap.len() && self.bitmap.is_set(self.digested) {
            let index = self.digested;
            let chunk = &mut buf[..self.expected_len(index) as usize];
            sink.read_at(index * self.block_size, chunk)
                .map_err(|error| BlockError::SinkRead { index, error })?;
            self.digest.update(&*chunk);
            self.digested += 1;
        }
        Ok(())
    }

    /// Indices of the blocks not stored yet.
    pub fn missing_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.bitmap.missing()
    }

    /// Next window of at most `window` missing blocks to ask for.
    ///
    /// A block asked for before costs one retry, a block never asked for
    /// costs nothing. Fails when a block of the window is out of retries.
    pub fn next_request(&mut self, window: u32) -> Result<Option<Window>, BlockError> {
        let Some(next) = self.bitmap.window(window) else {
            self.outstanding = None;
            return Ok(None);
        };
        for index in next.requested() {
            if !self.requested.set(index)? {
                self.note_retry(index)?;
            }
        }
        self.outstanding = Some(next.clone());
        Ok(Some(next))
    }

    /// Every block of the last request is stored.
    pub fn window_received(&self) -> bool {
        self.outstanding
            .as_ref()
            .is_some_and(|window| window.requested().all(|i| self.bitmap.is_set(i)))
    }

    /// Count one retry of block `index`.
    pub fn note_retry(&mut self, index: u32) -> Result<(), BlockError> {
        let retries = self
            .retries
            .get_mut(index as usize)
            .ok_or(BlockError::OutOfRange { index })?;
        if *retries >= self.max_retries {
            return Err(BlockError::RetriesExhausted { index });
        }
        *retries += 1;
        self.counters.retries_issued += 1;
        Ok(())
    }

    /// Retries spent on block `index`.
    pub fn retries(&self, index: u32) -> u8 {
        self.retries.get(index as usize).copied().unwrap_or(0)
    }

    /// Digest of the whole image, once every block is stored.
    pub fn digest(&self) -> Result<Sha256, BlockError> {
        if !self.is_complete() || self.digested != self.bitmap.len() {
            return Err(BlockError::Incomplete);
        }
        Ok(self.digest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::SinkError, testing::MemorySink};

    fn image(len: usize) -> alloc::vec::Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn block(image: &[u8], index: u32, block_size: usize) -> FirmwareBlock<'_> {
        let start = index as usize * block_size;
        let end = (start + block_size).min(image.len());
        FirmwareBlock {
            index,
            payload: &image[start..end],
        }
    }

    /// 4096 bytes in 1024 byte blocks is exactly four blocks.
    #[test]
    fn four_blocks_in_order() {
        let data = image(4096);
        let mut sink = MemorySink::new(8192);
        let mut transfer = BlockTransfer::new(0, 4096, 1024, 3).unwrap();
        assert_eq!(transfer.total_blocks(), 4);
        for i in 0..4 {
            assert_eq!(
                transfer.on_block_received(block(&data, i, 1024), &mut sink),
                Ok(BlockOutcome::Accepted)
            );
        }
        assert!(transfer.is_complete());
        assert_eq!(sink.reads, 0);
        assert_eq!(&sink.bank[..4096], &data[..]);
        let digest = transfer.digest().unwrap().finalize();
        assert_eq!(digest, Sha256::digest(&data));
    }

    /// A repeated block is stored once and counted as a duplicate.
    #[test]
    fn duplicate_block() {
        let data = image(4096);
        let mut sink = MemorySink::new(8192);
        let mut transfer = BlockTransfer::new(0, 4096, 1024, 3).unwrap();
        for i in [0, 1, 1, 2, 3] {
            transfer
                .on_block_received(block(&data, i, 1024), &mut sink)
                .unwrap();
        }
        assert!(transfer.is_complete());
        assert_eq!(sink.writes, 4);
        assert_eq!(transfer.counters().duplicate_blocks, 1);
        assert_eq!(transfer.counters().blocks_received, 4);
        assert_eq!(transfer.bytes_written(), 4096);
    }

    /// Blocks stored ahead of a gap are read back into the digest once the
    /// gap closes.
    #[test]
    fn out_of_order_digest() {
        let data = image(3000);
        let mut sink = MemorySink::new(4096);
        let mut transfer = BlockTransfer::new(1, 3000, 1024, 3).unwrap();
        for i in [2, 1, 0] {
            transfer
                .on_block_received(block(&data, i, 1024), &mut sink)
                .unwrap();
        }
        assert_eq!(sink.reads, 2);
        let digest = transfer.digest().unwrap().finalize();
        assert_eq!(digest, Sha256::digest(&data));
    }

    #[test]
    fn rejects_bad_blocks() {
        let data = image(3000);
        let mut sink = MemorySink::new(4096);
        let mut transfer = BlockTransfer::new(0, 3000, 1024, 3).unwrap();
        assert_eq!(
            transfer.on_block_received(block(&data, 3, 1024), &mut sink),
            Err(BlockError::OutOfRange { index: 3 })
        );
        // Last block must be exactly the remainder.
        assert_eq!(
            transfer.on_block_received(
                FirmwareBlock {
                    index: 2,
                    payload: &data[..1024]
                },
                &mut sink
            ),
            Err(BlockError::SizeMismatch {
                index: 2,
                len: 1024
            })
        );
        // Other blocks must be full.
        assert_eq!(
            transfer.on_block_received(
                FirmwareBlock {
                    index: 0,
                    payload: &data[..100]
                },
                &mut sink
            ),
            Err(BlockError::SizeMismatch { index: 0, len: 100 })
        );
        assert!(transfer.bitmap().is_empty());
        assert_eq!(transfer.digest().err(), Some(BlockError::Incomplete));
    }

    /// A failed write leaves the block missing so it can be stored later.
    #[test]
    fn sink_write_failure_keeps_block_missing() {
        let data = image(2048);
        let mut sink = MemorySink::new(4096);
        sink.fail_writes_at = Some(1024);
        let mut transfer = BlockTransfer::new(0, 2048, 1024, 3).unwrap();
        transfer
            .on_block_received(block(&data, 0, 1024), &mut sink)
            .unwrap();
        assert_eq!(
            transfer.on_block_received(block(&data, 1, 1024), &mut sink),
            Err(BlockError::SinkWrite {
                index: 1,
                error: SinkError::Write
            })
        );
        assert!(transfer.missing_blocks().eq([1]));
        assert_eq!(transfer.retries(1), 1);

        sink.fail_writes_at = None;
        transfer
            .on_block_received(block(&data, 1, 1024), &mut sink)
            .unwrap();
        assert!(transfer.is_complete());
    }

    /// No block is retried more often than allowed.
    #[test]
    fn retry_bound() {
        let data = image(4096);
        let mut sink = MemorySink::new(8192);
        let mut transfer = BlockTransfer::new(0, 4096, 1024, 3).unwrap();
        for i in [0, 1, 3] {
            transfer
                .on_block_received(block(&data, i, 1024), &mut sink)
                .unwrap();
        }
        let first = transfer.next_request(8).unwrap().unwrap();
        assert!(first.requested().eq([2]));
        assert_eq!(transfer.retries(2), 0);
        for _ in 0..3 {
            let window = transfer.next_request(8).unwrap().unwrap();
            assert!(window.requested().eq([2]));
        }
        assert_eq!(
            transfer.next_request(8),
            Err(BlockError::RetriesExhausted { index: 2 })
        );
        assert_eq!(transfer.retries(2), 3);
        assert_eq!(transfer.counters().retries_issued, 3);
    }

    /// Moving on to the next window costs no retries, asking again for the
    /// part of a window that never came does.
    #[test]
    fn windows_move_forward_without_retries() {
        let data = image(20 * 1024);
        let mut sink = MemorySink::new(20 * 1024);
        let mut transfer = BlockTransfer::new(0, 20 * 1024, 1024, 0).unwrap();

        let first = transfer.next_request(8).unwrap().unwrap();
        assert_eq!((first.offset, first.count), (0, 8));
        assert!(!transfer.window_received());
        for i in 0..8 {
            transfer
                .on_block_received(block(&data, i, 1024), &mut sink)
                .unwrap();
        }
        assert!(transfer.window_received());

        let second = transfer.next_request(8).unwrap().unwrap();
        assert_eq!((second.offset, second.count), (8, 8));
        assert!(!transfer.window_received());
        for i in 8..15 {
            transfer
                .on_block_received(block(&data, i, 1024), &mut sink)
                .unwrap();
        }
        assert!(!transfer.window_received());
        assert_eq!(transfer.counters().retries_issued, 0);

        // Block 15 was asked for and has no retries left.
        assert_eq!(
            transfer.next_request(8),
            Err(BlockError::RetriesExhausted { index: 15 })
        );
    }

    /// The window after a gap asks again for the gap and for fresh blocks,
    /// charging only the gap.
    #[test]
    fn retry_charges_only_requested_blocks() {
        let data = image(12 * 1024);
        let mut sink = MemorySink::new(12 * 1024);
        let mut transfer = BlockTransfer::new(0, 12 * 1024, 1024, 3).unwrap();
        transfer.next_request(8).unwrap();
        for i in (0..8).filter(|i| *i != 3) {
            transfer
                .on_block_received(block(&data, i, 1024), &mut sink)
                .unwrap();
        }
        let retry = transfer.next_request(8).unwrap().unwrap();
        assert!(retry.requested().eq([3, 8, 9, 10]));
        assert_eq!(transfer.retries(3), 1);
        assert_eq!(transfer.retries(8), 0);
        assert_eq!(transfer.counters().retries_issued, 1);
    }

    #[test]
    fn rejects_oversized_files() {
        assert_eq!(
            BlockTransfer::new(0, (MAX_BLOCKS as u32 + 1) * 1024, 1024, 3).err(),
            Some(BlockError::TooManyBlocks)
        );
        assert_eq!(
            BlockTransfer::new(0, 0, 1024, 3).err(),
            Some(BlockError::TooManyBlocks)
        );
    }
}
