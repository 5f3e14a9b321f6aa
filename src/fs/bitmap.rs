//! Free-space bookkeeping. One bit per sector, set while
//! the sector belongs to some file (or is one of the two
//! well-known header sectors).
//!
//! The map lives on disk as an ordinary file. Every
//! mutating operation fetches a fresh copy, changes it,
//! and either writes all of it back or drops it.

use super::openfile::OpenFile;
use super::storage::{BlockIO, Storage};
use super::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeMap {
    bits: Vec<u8>,
    num_bits: usize,
}

impl FreeMap {
    /// A map with every sector clear. `num_bits` must be a multiple of 8.
    pub fn new(num_bits: usize) -> Self {
        assert!(num_bits % 8 == 0, "bitmap size must be a whole number of bytes");
        Self {
            bits: vec![0; num_bits / 8],
            num_bits,
        }
    }

    /// Size of the backing file in bytes.
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }

    fn locate(&self, which: u32) -> (usize, u8) {
        let which = which as usize;
        assert!(
            which < self.num_bits,
            "sector {} is outside a bitmap of {} bits",
            which,
            self.num_bits
        );
        (which / 8, 1 << (which % 8))
    }

    pub fn test(&self, which: u32) -> bool {
        let (byte, mask) = self.locate(which);
        self.bits[byte] & mask != 0
    }

    pub fn mark(&mut self, which: u32) {
        let (byte, mask) = self.locate(which);
        self.bits[byte] |= mask;
    }

    /// Panics when the sector is already free: a double free
    /// means some header was corrupted or freed twice.
    pub fn clear(&mut self, which: u32) {
        let (byte, mask) = self.locate(which);
        assert!(self.bits[byte] & mask != 0, "sector {} freed twice", which);
        self.bits[byte] &= !mask;
    }

    /// Claims the lowest numbered free sector.
    pub fn find_and_set(&mut self) -> Option<u32> {
        let (index, byte) = self
            .bits
            .iter_mut()
            .enumerate()
            .find(|(_, byte)| **byte != u8::MAX)?;
        let bit = (!*byte).trailing_zeros();
        *byte |= 1 << bit;
        Some((index * 8) as u32 + bit)
    }

    pub fn count_clear(&self) -> usize {
        let set: u32 = self.bits.iter().map(|byte| byte.count_ones()).sum();
        self.num_bits - set as usize
    }

    /// Every sector currently marked in use, in ascending order.
    pub fn used(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_bits as u32).filter(|&which| self.test(which))
    }

    pub fn fetch_from<D: BlockIO>(storage: &mut Storage<D>, file: &OpenFile) -> Result<Self> {
        let mut bits = vec![0; file.length()];
        file.read_at(storage, &mut bits, 0)?;
        Ok(Self {
            num_bits: bits.len() * 8,
            bits,
        })
    }

    pub fn write_back<D: BlockIO>(&self, storage: &mut Storage<D>, file: &OpenFile) -> Result<()> {
        file.write_at(storage, &self.bits, 0)?;
        Ok(())
    }
}

#[test]
fn test_find_and_set_lowest_first() {
    let mut map = FreeMap::new(16);
    map.mark(0);
    map.mark(1);
    map.mark(3);
    assert_eq!(map.find_and_set(), Some(2));
    assert_eq!(map.find_and_set(), Some(4));
    assert_eq!(map.count_clear(), 11);
    map.clear(3);
    assert_eq!(map.find_and_set(), Some(3));
    assert_eq!(map.used().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_exhaustion() {
    let mut map = FreeMap::new(8);
    for expected in 0..8 {
        assert_eq!(map.find_and_set(), Some(expected));
    }
    assert_eq!(map.find_and_set(), None);
    assert_eq!(map.count_clear(), 0);
}

#[test]
#[should_panic(expected = "freed twice")]
fn test_double_free_panics() {
    let mut map = FreeMap::new(8);
    map.mark(5);
    map.clear(5);
    map.clear(5);
}

#[test]
fn test_random_claims_and_releases() {
    use rand::seq::SliceRandom;

    let mut map = FreeMap::new(256);
    let mut claimed: Vec<u32> = (0..100).map(|_| map.find_and_set().unwrap()).collect();
    assert_eq!(map.count_clear(), 156);
    claimed.shuffle(&mut rand::thread_rng());
    for sector in claimed {
        assert!(map.test(sector));
        map.clear(sector);
    }
    assert_eq!(map, FreeMap::new(256));
}
