// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::BlockError;
use consts::{MAX_BLOCKS, MAX_BLOCK_BITMAP_SIZE};

/// Bits of a stream request, one per block of the window.
pub type WindowBits = heapless::Vec<u8, MAX_BLOCK_BITMAP_SIZE>;

/// One bit per block of the image, set once the block is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBitmap {
    bits: heapless::Vec<u8, MAX_BLOCK_BITMAP_SIZE>,
    blocks: u32,
    set: u32,
}

/// A run of blocks to ask the stream service for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// First block of the run, always a missing one
    pub offset: u32,
    /// Number of blocks covered by `bits`
    pub count: u32,
    /// Bit `i` set means block `offset + i` is missing
    pub bits: WindowBits,
}

impl Window {
    pub fn contains(&self, index: u32) -> bool {
        index
            .checked_sub(self.offset)
            .filter(|i| *i < self.count)
            .is_some_and(|i| self.bits[(i / 8) as usize] & (1 << (i % 8)) != 0)
    }

    /// Indices of the blocks the window asks for.
    pub fn requested(&self) -> impl Iterator<Item = u32> + '_ {
        (self.offset..self.offset + self.count).filter(|i| self.contains(*i))
    }
}

impl BlockBitmap {
    pub fn new(blocks: u32) -> Result<Self, BlockError> {
        if blocks == 0 || blocks as usize > MAX_BLOCKS {
            return Err(BlockError::TooManyBlocks);
        }
        let mut bits = heapless::Vec::new();
        bits.resize(blocks.div_ceil(8) as usize, 0)
            .map_err(|_| BlockError::TooManyBlocks)?;
        Ok(Self {
            bits,
            blocks,
            set: 0,
        })
    }

    /// Number of blocks tracked.
    pub fn len(&self) -> u32 {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.set == 0
    }

    /// Number of blocks stored so far.
    pub fn count(&self) -> u32 {
        self.set
    }

    pub fn is_complete(&self) -> bool {
        self.set == self.blocks
    }

    pub fn is_set(&self, index: u32) -> bool {
        index < self.blocks && self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Mark `index` as stored. Returns `false` if it already was.
    pub fn set(&mut self, index: u32) -> Result<bool, BlockError> {
        if index >= self.blocks {
            return Err(BlockError::OutOfRange { index });
        }
        let byte = &mut self.bits[(index / 8) as usize];
        let mask = 1 << (index % 8);
        if *byte & mask != 0 {
            return Ok(false);
        }
        *byte |= mask;
        self.set += 1;
        Ok(true)
    }

    /// Indices of the blocks not stored yet, in ascending order.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.blocks).filter(|i| !self.is_set(*i))
    }

    /// Window of at most `max` blocks starting at the first missing one.
    pub fn window(&self, max: u32) -> Option<Window> {
        let offset = self.missing().next()?;
        let count = max.min(self.blocks - offset);
        let mut bits = WindowBits::new();
        // Cannot fail, count is bounded by the bitmap size.
        let _ = bits.resize(count.div_ceil(8) as usize, 0);
        for i in 0..count {
            if !self.is_set(offset + i) {
                bits[(i / 8) as usize] |= 1 << (i % 8);
            }
        }
        Some(Window {
            offset,
            count,
            bits,
        })
    }
}
