use packed_struct::prelude::*;

use crate::fs::storage::SECTOR_SIZE;
use eyre::{ensure, Result};

/// Sits in front of sector 0 in a disk image file.
#[derive(PackedStruct, Debug, Clone, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct DiskImageHeader {
    /// Magic string "SECTORFS"
    pub magic: [u8; 8],
    /// Always 1
    pub version: u32,
    /// Bytes per sector, must match `SECTOR_SIZE`
    pub sector_size: u32,
    /// Total sectors following the header
    pub sector_count: u64,
}

impl DiskImageHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();
    pub const MAGIC: &'static [u8; 8] = b"SECTORFS";
    pub const VERSION: u32 = 1;
    /// 32 tracks of 32 sectors.
    pub const DEFAULT_SECTOR_COUNT: usize = 1024;

    pub fn new(sector_count: usize) -> Self {
        Self {
            magic: *Self::MAGIC,
            version: Self::VERSION,
            sector_size: SECTOR_SIZE as u32,
            sector_count: sector_count as u64,
        }
    }

    /// Bytes an image with this header must have on the host.
    pub fn image_len(&self) -> u64 {
        Self::SIZE as u64 + self.sector_count * self.sector_size as u64
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(&self.magic == Self::MAGIC, "Bad file magic");
        ensure!(
            self.version == Self::VERSION,
            "Version field in header must be {}",
            Self::VERSION
        );
        ensure!(
            self.sector_size as usize == SECTOR_SIZE,
            "Invalid sector size {}: only {} byte sectors are supported",
            self.sector_size,
            SECTOR_SIZE
        );
        ensure!(
            self.sector_count > 0 && self.sector_count % 8 == 0,
            "Invalid sector count {}: must be a non-zero multiple of 8",
            self.sector_count
        );
        Ok(())
    }
}

#[test]
fn test_header_layout() {
    use hex_literal::hex;

    let packed = DiskImageHeader::new(1024).pack().unwrap();
    assert_eq!(packed.len(), DiskImageHeader::SIZE);
    assert_eq!(
        packed,
        hex!("53454354 4f524653 01000000 80000000 00040000 00000000")
    );
}

#[test]
fn test_validate() {
    let header = DiskImageHeader::new(64);
    assert!(header.validate().is_ok());
    assert_eq!(header.image_len(), 24 + 64 * 128);

    let mut bad = header.clone();
    bad.magic = *b"NOTSECTR";
    assert!(bad.validate().is_err());

    let mut bad = header.clone();
    bad.version = 2;
    assert!(bad.validate().is_err());

    let mut bad = header;
    bad.sector_size = 512;
    assert!(bad.validate().is_err());
}
