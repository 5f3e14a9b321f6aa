//! This module implements sector level access
//! on an underlying block device. Every other
//! part of the file system reads and writes
//! whole sectors through a `Storage`.

use super::{FsError, Result};
use tracing::{debug, trace};

/// Size of one sector in bytes. The on-disk file header
/// is laid out to fill exactly one sector of this size.
pub const SECTOR_SIZE: usize = 128;

/// Smallest device the storage layer accepts.
pub const MIN_SECTOR_COUNT: usize = 16;

/// The contents of a single sector.
pub type Sector = [u8; SECTOR_SIZE];

/// Trait that abstracts out a block device,
/// this crate implements a host file backing
/// and an in-memory one.
pub trait BlockIO {
    /// Error type returned from the IO methods
    type IoError: std::error::Error + Send + Sync + 'static;
    /// The total amount of blocks available
    /// to do IO
    fn block_count(&self) -> usize;
    /// The size of a single block. It is required
    /// all blocks are the same size.
    fn block_size(&self) -> usize;
    /// Read a single block at offset `block_number` (starting at 0),
    /// stores the block into the `block` argument (must be big enough).
    fn read_block(
        &mut self,
        block_number: u64,
        block: &mut [u8],
    ) -> std::result::Result<(), Self::IoError>;
    /// Write a single `block` at offset `block_number` (starting at 0).
    /// The `block` argument must be at least `block_size` long.
    fn write_block(
        &mut self,
        block_number: u64,
        block: &[u8],
    ) -> std::result::Result<(), Self::IoError>;
}

#[derive(Debug)]
pub struct Storage<Device: BlockIO> {
    device: Device,
    sector_count: usize,
}

impl<Device: BlockIO> Storage<Device> {
    pub fn open(device: Device) -> Result<Self> {
        let block_size = device.block_size();
        if block_size != SECTOR_SIZE {
            return Err(FsError::BlockSizeMismatch {
                expected: SECTOR_SIZE,
                device: block_size,
            });
        }
        let sector_count = device.block_count();
        if sector_count < MIN_SECTOR_COUNT
            || sector_count % 8 != 0
            || sector_count > u32::MAX as usize
        {
            debug!("Rejecting device with {} sectors", sector_count);
            return Err(FsError::InvalidDevice);
        }
        Ok(Self {
            device,
            sector_count,
        })
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    fn check_range(&self, sector: u32) -> Result<()> {
        if sector as usize >= self.sector_count {
            return Err(FsError::SectorOutOfRange(sector));
        }
        Ok(())
    }

    pub fn read_sector(&mut self, sector: u32) -> Result<Sector> {
        self.check_range(sector)?;
        trace!("read sector {}", sector);
        let mut data = [0; SECTOR_SIZE];
        self.device
            .read_block(sector as u64, &mut data)
            .map_err(|err| FsError::Device(Box::new(err)))?;
        Ok(data)
    }

    pub fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<()> {
        self.check_range(sector)?;
        trace!("write sector {}", sector);
        self.device
            .write_block(sector as u64, data)
            .map_err(|err| FsError::Device(Box::new(err)))
    }

    pub fn into_device(self) -> Device {
        self.device
    }
}
