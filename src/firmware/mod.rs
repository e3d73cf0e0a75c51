//! Firmware images and the ECU variants they identify
//!
//! An image is a flat binary dump of the whole flash. Its length identifies the variant,
//! and with it the family:
//!
//! | Variant | Length | Family |
//! |--|--|--|
//! |[EcuVariant::T8]|0x100000|[EcuFamily::BlockCoded]|
//! |[EcuVariant::T8Mcp]|0x140000|[EcuFamily::BlockCoded]|
//! |[EcuVariant::Me96]|0x200000|[EcuFamily::Partitioned]|
//! |[EcuVariant::E39]|0x180000|[EcuFamily::Partitioned]|

use std::path::Path;

use strum_macros::{Display, EnumIter};

mod blocks;
mod partition;

pub use blocks::*;
pub use partition::*;

/// Offset of the 24 bit 'last used flash address' pointer
pub const LAST_ADDRESS_OFFSET: usize = 0x020141;

/// How an ECU is programmed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum EcuFamily {
    /// Written in fixed size coded blocks, verified by reading back
    BlockCoded,
    /// Written per partition, verified by digest
    Partitioned,
}

/// ECU variants, identified by image length
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EcuVariant {
    /// Trionic 8
    #[strum(to_string = "Trionic 8")]
    T8,
    /// Trionic 8 with its MCP co-processor firmware appended
    #[strum(to_string = "Trionic 8 (MCP)")]
    T8Mcp,
    /// Bosch ME9.6
    #[strum(to_string = "ME9.6")]
    Me96,
    /// E39
    #[strum(to_string = "E39")]
    E39,
}

impl EcuVariant {
    /// Length of a full image of this variant
    pub fn image_len(&self) -> usize {
        match self {
            EcuVariant::T8 => 0x100000,
            EcuVariant::T8Mcp => 0x140000,
            EcuVariant::Me96 => 0x200000,
            EcuVariant::E39 => 0x180000,
        }
    }

    /// Identifies the variant of an image from its length
    pub fn from_len(len: usize) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|v| v.image_len() == len)
    }

    /// Programming family
    pub fn family(&self) -> EcuFamily {
        match self {
            EcuVariant::T8 | EcuVariant::T8Mcp => EcuFamily::BlockCoded,
            EcuVariant::Me96 | EcuVariant::E39 => EcuFamily::Partitioned,
        }
    }
}

#[derive(Debug, thiserror::Error)]
/// Error produced while loading or slicing a firmware image
pub enum ImageError {
    /// Image length matches no known variant
    #[error("Image of {0} bytes matches no known ECU")]
    UnknownLength(usize),
    /// Image could not be read
    #[error("Image IO error")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
    /// Partition index outside the variant's table
    #[error("Partition {index} does not exist (variant has {count})")]
    PartitionOutOfRange {
        /// Requested index
        index: usize,
        /// Partitions of the variant
        count: usize,
    },
    /// Variant is not programmed per partition
    #[error("{0} has no partition table")]
    NoPartitions(EcuVariant),
}

/// A firmware image. Read-only once loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    variant: EcuVariant,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Wraps an in-memory image, identifying its variant
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ImageError> {
        let variant =
            EcuVariant::from_len(data.len()).ok_or(ImageError::UnknownLength(data.len()))?;
        log::debug!("Image of 0x{:06X} bytes is a {variant} image", data.len());
        Ok(Self { variant, data })
    }

    /// Loads an image from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Variant identified from the image length
    pub fn variant(&self) -> EcuVariant {
        self.variant
    }

    /// Raw image bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false, known variants are never empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The last flash address in use, read big endian from [LAST_ADDRESS_OFFSET]
    pub fn last_used_address(&self) -> u32 {
        let p = &self.data[LAST_ADDRESS_OFFSET..LAST_ADDRESS_OFFSET + 3];
        (p[0] as u32) << 16 | (p[1] as u32) << 8 | p[2] as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_from_length() {
        assert_eq!(EcuVariant::from_len(0x100000), Some(EcuVariant::T8));
        assert_eq!(EcuVariant::from_len(0x140000), Some(EcuVariant::T8Mcp));
        assert_eq!(EcuVariant::from_len(0x180000), Some(EcuVariant::E39));
        assert_eq!(EcuVariant::from_len(0x12345), None);
        assert_eq!(EcuVariant::Me96.family(), EcuFamily::Partitioned);
        assert!(matches!(
            FirmwareImage::from_bytes(vec![0; 10]),
            Err(ImageError::UnknownLength(10))
        ));
    }

    #[test]
    fn header_pointer() {
        let mut data = vec![0xFF; 0x100000];
        data[LAST_ADDRESS_OFFSET..LAST_ADDRESS_OFFSET + 3].copy_from_slice(&[0x02, 0x10, 0x00]);
        let img = FirmwareImage::from_bytes(data).unwrap();
        assert_eq!(img.last_used_address(), 0x021000);
    }
}
