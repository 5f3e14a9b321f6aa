//! Shared setup for the integration tests

#![allow(dead_code)]

use sectorfs::disk::MemoryDisk;
use sectorfs::FileSystem;

pub const SECTORS: usize = 1024;

/// Sectors in use right after format: the two headers, one
/// bitmap sector and eight root directory sectors.
pub const FORMAT_USED: usize = 11;

pub fn formatted() -> FileSystem<MemoryDisk> {
    FileSystem::format(MemoryDisk::new(SECTORS)).unwrap()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}
