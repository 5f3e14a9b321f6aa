//! Block devices the file system can live on: an image file
//! on the host, or plain memory.

mod header;

pub use header::DiskImageHeader;

use crate::fs::storage::{BlockIO, MIN_SECTOR_COUNT, SECTOR_SIZE};
use eyre::{ensure, Context, Result};
use packed_struct::prelude::*;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

/// A host file laid out as `[header | sector 0 | sector 1 | ...]`.
#[derive(Debug)]
pub struct DiskImage {
    file: File,
    sector_count: usize,
}

impl DiskImage {
    fn read_and_parse_header(mut file: File) -> Result<Self> {
        let mut buf = [0; DiskImageHeader::SIZE];
        file.read_exact(&mut buf)
            .context("Couldn't read the disk image header... Maybe it is corrupt?")?;
        let header = DiskImageHeader::unpack_from_slice(&buf)?;
        header.validate()?;
        let size = file.metadata()?.len();
        trace!("Stat'ed image size: {}", size);
        ensure!(
            size == header.image_len(),
            "Image has the wrong size: expected {} bytes, is {} bytes",
            header.image_len(),
            size
        );
        Ok(Self {
            file,
            sector_count: header.sector_count as usize,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening disk image at {:?}", path);
        let file = File::options()
            .append(false)
            .read(true)
            .write(true)
            .open(path)
            .context("Couldn't open disk image")?;
        Self::read_and_parse_header(file)
    }

    /// Creates a zeroed image of `sector_count` sectors. Refuses
    /// to overwrite an existing file.
    pub fn create(path: impl AsRef<Path>, sector_count: usize) -> Result<()> {
        let path = path.as_ref();
        debug!("Creating disk image at {path:?} with {sector_count} sectors");
        ensure!(
            sector_count >= MIN_SECTOR_COUNT && sector_count % 8 == 0,
            "Invalid sector count {}: must be a multiple of 8 and at least {}",
            sector_count,
            MIN_SECTOR_COUNT
        );
        ensure!(!path.exists(), "target file location already exists");
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .context("Couldn't create disk image")?;
        let header = DiskImageHeader::new(sector_count).pack()?;
        // fill in header last so a half written image never validates
        file.write_all(&[0; DiskImageHeader::SIZE])?;
        let sector = [0; SECTOR_SIZE];
        for _ in 0..sector_count {
            file.write_all(&sector)?;
        }
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.flush()?;
        Ok(())
    }

    fn seek_to(&mut self, block_number: u64) -> io::Result<()> {
        if block_number >= self.sector_count as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {} is outside the image", block_number),
            ));
        }
        let offset = DiskImageHeader::SIZE as u64 + block_number * SECTOR_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl BlockIO for DiskImage {
    type IoError = io::Error;

    fn block_count(&self) -> usize {
        self.sector_count
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn read_block(&mut self, block_number: u64, block: &mut [u8]) -> io::Result<()> {
        self.seek_to(block_number)?;
        self.file.read_exact(&mut block[..SECTOR_SIZE])
    }

    fn write_block(&mut self, block_number: u64, block: &[u8]) -> io::Result<()> {
        self.seek_to(block_number)?;
        self.file.write_all(&block[..SECTOR_SIZE])
    }
}

#[derive(Error, Debug)]
#[error("Block {block} is outside a disk of {count} blocks")]
pub struct OutOfRange {
    pub block: u64,
    pub count: usize,
}

/// A device kept entirely in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDisk {
    data: Vec<u8>,
    block_size: usize,
}

impl MemoryDisk {
    pub fn new(sector_count: usize) -> Self {
        Self::with_block_size(sector_count, SECTOR_SIZE)
    }

    pub fn with_block_size(block_count: usize, block_size: usize) -> Self {
        Self {
            data: vec![0; block_count * block_size],
            block_size,
        }
    }

    fn range(&self, block_number: u64) -> Result<std::ops::Range<usize>, OutOfRange> {
        let count = self.block_count();
        if block_number >= count as u64 {
            return Err(OutOfRange {
                block: block_number,
                count,
            });
        }
        let start = block_number as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockIO for MemoryDisk {
    type IoError = OutOfRange;

    fn block_count(&self) -> usize {
        self.data.len() / self.block_size
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, block_number: u64, block: &mut [u8]) -> Result<(), OutOfRange> {
        let range = self.range(block_number)?;
        block[..self.block_size].copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, block_number: u64, block: &[u8]) -> Result<(), OutOfRange> {
        let range = self.range(block_number)?;
        self.data[range].copy_from_slice(&block[..self.block_size]);
        Ok(())
    }
}
