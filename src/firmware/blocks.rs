//! Coded transfer blocks for the block coded family

use super::{partition_table, EcuFamily, FirmwareImage, ImageError, Partition};
use crate::{
    kwp2000::{transfer_request, TransferMode},
    DiagResult,
};

/// First flash address written in blocks
pub const BLOCK_BASE: u32 = 0x020000;
/// Raw bytes per block
pub const RAW_BLOCK_LEN: u32 = 0xEA;
/// Index of the final, shorter block
pub const FINAL_BLOCK_INDEX: u32 = 0xF50;
/// Raw bytes of the final block
pub const FINAL_BLOCK_LEN: u32 = 0xE0;
/// Bytes written past the last used address
pub const BLOCK_MARGIN: u32 = 0x200;
/// Blocks in a full image
pub const MAX_BLOCKS: u32 = FINAL_BLOCK_INDEX + 1;

const KEYSTREAM: [u8; 6] = [0x39, 0x68, 0x77, 0x6D, 0x47, 0x39];

/// Applies the block keystream. Each call starts the keystream from its beginning
pub fn code_block(raw: &[u8]) -> Vec<u8> {
    raw.iter()
        .zip(KEYSTREAM.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

/// Number of blocks needed to cover flash up to `last_used` plus the margin.
///
/// A pointer outside the block region means the whole image is written.
pub fn block_count_for(last_used: u32) -> u32 {
    let block_region = BLOCK_BASE..BLOCK_BASE + FINAL_BLOCK_INDEX * RAW_BLOCK_LEN + FINAL_BLOCK_LEN;
    if !block_region.contains(&last_used) {
        log::warn!("Last used address 0x{last_used:06X} is outside flash, writing every block");
        return MAX_BLOCKS;
    }
    (last_used + BLOCK_MARGIN - BLOCK_BASE)
        .div_ceil(RAW_BLOCK_LEN)
        .min(MAX_BLOCKS)
}

/// One coded block, ready for transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block index, from 0
    pub index: u32,
    /// Flash address of the first byte
    pub address: u32,
    /// Coded payload
    pub payload: Vec<u8>,
}

impl Block {
    /// Transfer data request carrying this block
    pub fn to_transfer_request(&self) -> DiagResult<Vec<u8>> {
        transfer_request(TransferMode::Download, self.address, &self.payload)
    }

    /// Raw (uncoded) length of this block
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for an empty block. Never produced by [BlockManager]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Produces blocks or partitions of an image, in increasing address order
#[derive(Debug, Clone)]
pub struct BlockManager<'a> {
    image: &'a FirmwareImage,
    cursor: u32,
    count: u32,
}

impl<'a> BlockManager<'a> {
    /// Creates a manager positioned at the first block
    pub fn new(image: &'a FirmwareImage) -> Self {
        Self::starting_at(image, 0)
    }

    /// Creates a manager positioned at block `index`
    pub fn starting_at(image: &'a FirmwareImage, index: u32) -> Self {
        let count = match image.variant().family() {
            EcuFamily::BlockCoded => block_count_for(image.last_used_address()),
            EcuFamily::Partitioned => 0,
        };
        Self {
            image,
            cursor: index,
            count,
        }
    }

    /// The image
    pub fn image(&self) -> &'a FirmwareImage {
        self.image
    }

    /// Blocks to be transferred
    pub fn block_count(&self) -> u32 {
        self.count
    }

    /// Index of the block [BlockManager::next_block] returns next
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Codes block `index`. The same index always yields the same bytes
    pub fn block_at(&self, index: u32) -> Option<Block> {
        if index >= self.count {
            return None;
        }
        let len = if index == FINAL_BLOCK_INDEX {
            FINAL_BLOCK_LEN
        } else {
            RAW_BLOCK_LEN
        };
        let address = BLOCK_BASE + index * RAW_BLOCK_LEN;
        let raw = self
            .image
            .data()
            .get(address as usize..(address + len) as usize)?;
        Some(Block {
            index,
            address,
            payload: code_block(raw),
        })
    }

    /// Returns the next block and advances
    pub fn next_block(&mut self) -> Option<Block> {
        let b = self.block_at(self.cursor)?;
        self.cursor += 1;
        Some(b)
    }

    /// Partition table of the image's variant
    pub fn partitions(&self) -> Result<&'static [Partition], ImageError> {
        partition_table(self.image.variant())
    }

    /// Partitions of the image's variant
    pub fn partition_count(&self) -> usize {
        self.partitions().map(|p| p.len()).unwrap_or(0)
    }

    /// Address ranges of partition `index`
    pub fn partition_for(&self, index: usize) -> Result<Partition, ImageError> {
        let table = self.partitions()?;
        table
            .get(index)
            .copied()
            .ok_or(ImageError::PartitionOutOfRange {
                index,
                count: table.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::LAST_ADDRESS_OFFSET;

    fn t8_image(last: u32) -> FirmwareImage {
        let mut data: Vec<u8> = (0..0x100000u32).map(|x| (x % 251) as u8).collect();
        data[LAST_ADDRESS_OFFSET] = (last >> 16) as u8;
        data[LAST_ADDRESS_OFFSET + 1] = (last >> 8) as u8;
        data[LAST_ADDRESS_OFFSET + 2] = last as u8;
        FirmwareImage::from_bytes(data).unwrap()
    }

    #[test]
    fn count_from_header_pointer() {
        let img = t8_image(0x021000);
        let bm = BlockManager::new(&img);
        assert_eq!(bm.block_count(), 20);
        assert_eq!(bm.block_count(), (0x021000u32 + 0x200 - 0x020000).div_ceil(0xEA));
        assert_eq!(BlockManager::new(&t8_image(0xFFFFFF)).block_count(), MAX_BLOCKS);
        assert_eq!(BlockManager::new(&t8_image(0x0FFFFF)).block_count(), MAX_BLOCKS);
    }

    #[test]
    fn keystream_resets_per_block() {
        assert_eq!(code_block(&[0; 8]), vec![0x39, 0x68, 0x77, 0x6D, 0x47, 0x39, 0x39, 0x68]);
        let img = t8_image(0x021000);
        let bm = BlockManager::new(&img);
        let b1 = bm.block_at(1).unwrap();
        let raw = &img.data()[0x0200EA..0x0200EA + 0xEA];
        assert_eq!(b1.payload, code_block(raw));
        assert_eq!(b1.address, 0x0200EA);
    }

    #[test]
    fn blocks_are_deterministic() {
        let img = t8_image(0x021000);
        let first: Vec<Block> = {
            let mut bm = BlockManager::new(&img);
            std::iter::from_fn(|| bm.next_block()).collect()
        };
        let second: Vec<Block> = {
            let mut bm = BlockManager::new(&img);
            std::iter::from_fn(|| bm.next_block()).collect()
        };
        assert_eq!(first.len(), 20);
        assert_eq!(first, second);
        let mut resumed = BlockManager::starting_at(&img, 7);
        assert_eq!(resumed.next_block().unwrap(), first[7]);
    }

    #[test]
    fn final_block_is_short() {
        let img = t8_image(0xFFFFFF);
        let bm = BlockManager::new(&img);
        let last = bm.block_at(FINAL_BLOCK_INDEX).unwrap();
        assert_eq!(last.payload.len(), 0xE0);
        assert_eq!(last.address + 0xE0, 0x100000);
        assert_eq!(last.to_transfer_request().unwrap().len(), 0xE6);
        assert_eq!(bm.block_at(0).unwrap().to_transfer_request().unwrap().len(), 0xF0);
        assert!(bm.block_at(MAX_BLOCKS).is_none());
    }
}
