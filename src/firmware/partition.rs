//! Partition tables of the partitioned family

use super::{EcuVariant, FirmwareImage, ImageError};

/// A contiguous flash region, the unit of erase and verification
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Index in the variant's table
    pub index: u8,
    /// First image offset
    pub file_start: u32,
    /// Image offset one past the end
    pub file_end: u32,
    /// First flash address
    pub phys_start: u32,
    /// Flash address one past the end
    pub phys_end: u32,
    /// False for regions which must never be erased (boot code)
    pub writable: bool,
}

impl Partition {
    const fn new(
        index: u8,
        file_start: u32,
        file_end: u32,
        phys_start: u32,
        writable: bool,
    ) -> Self {
        Self {
            index,
            file_start,
            file_end,
            phys_start,
            phys_end: phys_start + (file_end - file_start),
            writable,
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        (self.file_end - self.file_start) as usize
    }

    /// True for an empty partition
    pub fn is_empty(&self) -> bool {
        self.file_end == self.file_start
    }

    /// The partition's bytes within an image
    pub fn slice<'a>(&self, image: &'a FirmwareImage) -> Option<&'a [u8]> {
        image
            .data()
            .get(self.file_start as usize..self.file_end as usize)
    }
}

const ME96_PARTITIONS: [Partition; 10] = [
    Partition::new(0, 0x000000, 0x020000, 0x000000, false),
    Partition::new(1, 0x020000, 0x040000, 0x020000, true),
    Partition::new(2, 0x040000, 0x060000, 0x040000, true),
    Partition::new(3, 0x060000, 0x080000, 0x060000, true),
    Partition::new(4, 0x080000, 0x0C0000, 0x080000, true),
    Partition::new(5, 0x0C0000, 0x100000, 0x0C0000, true),
    Partition::new(6, 0x100000, 0x140000, 0x100000, true),
    Partition::new(7, 0x140000, 0x180000, 0x140000, true),
    Partition::new(8, 0x180000, 0x1C0000, 0x180000, true),
    Partition::new(9, 0x1C0000, 0x200000, 0x1C0000, true),
];

// The calibration area of E39 images lives above the boot block on the device
const E39_PARTITIONS: [Partition; 4] = [
    Partition::new(0, 0x000000, 0x040000, 0x000000, false),
    Partition::new(1, 0x040000, 0x080000, 0x040000, true),
    Partition::new(2, 0x080000, 0x100000, 0x080000, true),
    Partition::new(3, 0x100000, 0x180000, 0x1C0000, true),
];

/// Partition table of a variant
pub fn partition_table(variant: EcuVariant) -> Result<&'static [Partition], ImageError> {
    match variant {
        EcuVariant::Me96 => Ok(&ME96_PARTITIONS),
        EcuVariant::E39 => Ok(&E39_PARTITIONS),
        v => Err(ImageError::NoPartitions(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_cover_images() {
        for v in [EcuVariant::Me96, EcuVariant::E39] {
            let table = partition_table(v).unwrap();
            assert_eq!(table.first().unwrap().file_start, 0);
            assert_eq!(table.last().unwrap().file_end as usize, v.image_len());
            for w in table.windows(2) {
                assert_eq!(w[0].file_end, w[1].file_start);
            }
            assert!(!table[0].writable);
        }
        let p = partition_table(EcuVariant::E39).unwrap()[3];
        assert_eq!((p.phys_start, p.phys_end), (0x1C0000, 0x240000));
        assert!(matches!(
            partition_table(EcuVariant::T8),
            Err(ImageError::NoPartitions(EcuVariant::T8))
        ));
    }
}
