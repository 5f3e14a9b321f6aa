//! The on-disk file header, the record that tells where
//! a file's bytes live.
//!
//! A header is one sector: the file length, the number of
//! data sectors, and `NUM_DIRECT` sector pointers. Small files
//! point straight at their data. Larger files point at child
//! headers instead, each covering a fixed span of the file,
//! and those children are ordinary headers themselves. The
//! depth of the tree follows from the length alone:
//!
//! | length                    | each slot points to          |
//! |---------------------------|------------------------------|
//! | `..= LEVEL1_BYTES`        | a data sector                |
//! | `..= LEVEL2_BYTES`        | a header of `LEVEL1_BYTES`   |
//! | `..= LEVEL3_BYTES`        | a header of `LEVEL2_BYTES`   |
//!
//! All children of one header cover the same span except the
//! last, which covers whatever remains.

use std::fmt;
use std::mem::size_of;

use super::bitmap::FreeMap;
use super::storage::{BlockIO, Sector, Storage, SECTOR_SIZE};
use super::{FsError, Result};
use tracing::{debug, trace};

/// Pointer slots that fit beside the two length fields.
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 2 * size_of::<u32>()) / size_of::<u32>();
pub const LEVEL1_BYTES: usize = NUM_DIRECT * SECTOR_SIZE;
pub const LEVEL2_BYTES: usize = NUM_DIRECT * LEVEL1_BYTES;
pub const LEVEL3_BYTES: usize = NUM_DIRECT * LEVEL2_BYTES;
pub const MAX_FILE_SIZE: usize = LEVEL3_BYTES;

/// What the pointer slots of a header refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Slots hold data sectors.
    Direct,
    /// Slots hold child headers, each covering `span` bytes
    /// (the last one possibly less).
    Indirect { span: usize },
}

impl Level {
    pub fn for_length(length: usize) -> Self {
        if length <= LEVEL1_BYTES {
            Level::Direct
        } else if length <= LEVEL2_BYTES {
            Level::Indirect { span: LEVEL1_BYTES }
        } else {
            Level::Indirect { span: LEVEL2_BYTES }
        }
    }

    /// Bytes covered by one slot.
    fn slot_span(self) -> usize {
        match self {
            Level::Direct => SECTOR_SIZE,
            Level::Indirect { span } => span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    num_bytes: u32,
    num_sectors: u32,
    data_sectors: [u32; NUM_DIRECT],
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            data_sectors: [0; NUM_DIRECT],
        }
    }
}

fn claim(free_map: &mut FreeMap) -> Result<u32> {
    free_map.find_and_set().ok_or(FsError::OutOfSpace)
}

impl FileHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn length(&self) -> usize {
        self.num_bytes as usize
    }

    pub fn level(&self) -> Level {
        Level::for_length(self.length())
    }

    /// The pointer slots in use, data sectors or child headers
    /// depending on `level`.
    pub fn slots(&self) -> &[u32] {
        let used = self.length().div_ceil(self.level().slot_span());
        &self.data_sectors[..used]
    }

    /// Sectors `allocate` claims for a file of `length` bytes,
    /// counting child headers but not the top-level header itself.
    pub fn sectors_needed(length: usize) -> usize {
        match Level::for_length(length) {
            Level::Direct => length.div_ceil(SECTOR_SIZE),
            Level::Indirect { span } => {
                let full = length / span;
                let rest = length % span;
                let mut needed = full * (1 + Self::sectors_needed(span));
                if rest > 0 {
                    needed += 1 + Self::sectors_needed(rest);
                }
                needed
            }
        }
    }

    /// Builds the sector tree for a new file of `length` bytes.
    ///
    /// Nothing is claimed unless the whole tree fits, so an
    /// `OutOfSpace` error leaves `free_map` untouched. Child
    /// headers and zeroed data sectors are written as they
    /// are claimed; they stay unreachable until the caller
    /// writes this header and the free map back.
    pub fn allocate<D: BlockIO>(
        &mut self,
        free_map: &mut FreeMap,
        storage: &mut Storage<D>,
        length: usize,
    ) -> Result<()> {
        if length > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge {
                length,
                max: MAX_FILE_SIZE,
            });
        }
        let needed = Self::sectors_needed(length);
        if free_map.count_clear() < needed {
            return Err(FsError::OutOfSpace);
        }
        trace!("allocating {} bytes over {} sectors", length, needed);
        self.fill(free_map, storage, length)
    }

    fn fill<D: BlockIO>(
        &mut self,
        free_map: &mut FreeMap,
        storage: &mut Storage<D>,
        length: usize,
    ) -> Result<()> {
        *self = Self {
            num_bytes: length as u32,
            num_sectors: length.div_ceil(SECTOR_SIZE) as u32,
            data_sectors: [0; NUM_DIRECT],
        };
        match Level::for_length(length) {
            Level::Direct => {
                for slot in 0..self.num_sectors as usize {
                    let sector = claim(free_map)?;
                    storage.write_sector(sector, &[0; SECTOR_SIZE])?;
                    self.data_sectors[slot] = sector;
                }
            }
            Level::Indirect { span } => {
                let mut remaining = length;
                let mut slot = 0;
                while remaining > 0 {
                    let sector = claim(free_map)?;
                    let mut child = FileHeader::new();
                    child.fill(free_map, storage, remaining.min(span))?;
                    child.write_back(storage, sector)?;
                    self.data_sectors[slot] = sector;
                    remaining = remaining.saturating_sub(span);
                    slot += 1;
                }
            }
        }
        Ok(())
    }

    /// Releases every sector `allocate` claimed for this header,
    /// child headers included. The header's own sector is the
    /// caller's to free.
    pub fn deallocate<D: BlockIO>(
        &self,
        free_map: &mut FreeMap,
        storage: &mut Storage<D>,
    ) -> Result<()> {
        match self.level() {
            Level::Direct => {
                for &sector in self.slots() {
                    free_map.clear(sector);
                }
            }
            Level::Indirect { .. } => {
                for &sector in self.slots() {
                    let child = Self::fetch_from(storage, sector)?;
                    child.deallocate(free_map, storage)?;
                    free_map.clear(sector);
                }
            }
        }
        Ok(())
    }

    /// Translates a byte offset within the file into the
    /// sector holding that byte.
    pub fn byte_to_sector<D: BlockIO>(&self, storage: &mut Storage<D>, offset: usize) -> Result<u32> {
        if offset >= self.length() {
            return Err(FsError::OutOfBounds {
                offset,
                length: self.length(),
            });
        }
        match self.level() {
            Level::Direct => Ok(self.data_sectors[offset / SECTOR_SIZE]),
            Level::Indirect { span } => {
                let child = Self::fetch_from(storage, self.data_sectors[offset / span])?;
                child.byte_to_sector(storage, offset % span)
            }
        }
    }

    /// Number of header sectors in this file's tree, this one included.
    pub fn header_sectors<D: BlockIO>(&self, storage: &mut Storage<D>) -> Result<usize> {
        match self.level() {
            Level::Direct => Ok(1),
            Level::Indirect { .. } => {
                let mut count = 1;
                for &sector in self.slots() {
                    count += Self::fetch_from(storage, sector)?.header_sectors(storage)?;
                }
                Ok(count)
            }
        }
    }

    pub fn fetch_from<D: BlockIO>(storage: &mut Storage<D>, sector: u32) -> Result<Self> {
        Self::from_bytes(&storage.read_sector(sector)?)
    }

    pub fn write_back<D: BlockIO>(&self, storage: &mut Storage<D>, sector: u32) -> Result<()> {
        storage.write_sector(sector, &self.to_bytes())
    }

    /// Little-endian `num_bytes`, `num_sectors`, then every slot.
    /// Encoded by hand: `packed_struct` has no `u32` array fields.
    pub fn to_bytes(&self) -> Sector {
        let mut bytes = [0; SECTOR_SIZE];
        bytes[0..4].copy_from_slice(&self.num_bytes.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.num_sectors.to_le_bytes());
        for (chunk, sector) in bytes[8..].chunks_exact_mut(4).zip(self.data_sectors.iter()) {
            chunk.copy_from_slice(&sector.to_le_bytes());
        }
        bytes
    }

    /// Fails with `InvalidDevice` when the recorded length is
    /// more than a header can address.
    pub fn from_bytes(bytes: &Sector) -> Result<Self> {
        let word = |chunk: &[u8]| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let mut header = Self {
            num_bytes: word(&bytes[0..4]),
            num_sectors: word(&bytes[4..8]),
            data_sectors: [0; NUM_DIRECT],
        };
        for (sector, chunk) in header.data_sectors.iter_mut().zip(bytes[8..].chunks_exact(4)) {
            *sector = word(chunk);
        }
        if header.length() > MAX_FILE_SIZE {
            debug!("Header claims {} bytes", header.num_bytes);
            return Err(FsError::InvalidDevice);
        }
        Ok(header)
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File size: {}. ", self.num_bytes)?;
        match self.level() {
            Level::Direct => write!(f, "Data sectors:")?,
            Level::Indirect { span } => write!(f, "Child headers of {} bytes:", span)?,
        }
        for sector in self.slots() {
            write!(f, " {}", sector)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;
    use hex_literal::hex;

    fn setup(sectors: usize) -> (Storage<MemoryDisk>, FreeMap) {
        let storage = Storage::open(MemoryDisk::new(sectors)).unwrap();
        let mut free_map = FreeMap::new(sectors);
        free_map.mark(0);
        free_map.mark(1);
        (storage, free_map)
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(NUM_DIRECT, 30);
        assert_eq!(LEVEL1_BYTES, 3840);
        assert_eq!(LEVEL2_BYTES, 115_200);
        assert_eq!(LEVEL3_BYTES, 3_456_000);
        assert_eq!(Level::for_length(0), Level::Direct);
        assert_eq!(Level::for_length(3840), Level::Direct);
        assert_eq!(Level::for_length(3841), Level::Indirect { span: 3840 });
        assert_eq!(Level::for_length(115_200), Level::Indirect { span: 3840 });
        assert_eq!(Level::for_length(115_201), Level::Indirect { span: 115_200 });
    }

    #[test]
    fn test_sectors_needed() {
        assert_eq!(FileHeader::sectors_needed(0), 0);
        assert_eq!(FileHeader::sectors_needed(1), 1);
        assert_eq!(FileHeader::sectors_needed(128), 1);
        assert_eq!(FileHeader::sectors_needed(129), 2);
        assert_eq!(FileHeader::sectors_needed(3840), 30);
        // two children: 30 + 2 data sectors, plus their headers
        assert_eq!(FileHeader::sectors_needed(4000), 34);
        // 30 full children of 31 sectors each
        assert_eq!(FileHeader::sectors_needed(115_200), 930);
        // one full child (931) plus a one-byte child and its data sector
        assert_eq!(FileHeader::sectors_needed(115_201), 933);
    }

    #[test]
    fn test_on_disk_layout() {
        let mut header = FileHeader::new();
        header.num_bytes = 300;
        header.num_sectors = 3;
        header.data_sectors[0] = 2;
        header.data_sectors[1] = 3;
        header.data_sectors[2] = 0x0102_0304;
        let bytes = header.to_bytes();
        assert_eq!(
            bytes[..20],
            hex!("2c010000 03000000 02000000 03000000 04030201")
        );
        assert!(bytes[20..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_last_slot_fills_the_sector() {
        let mut header = FileHeader::new();
        header.num_bytes = LEVEL1_BYTES as u32;
        header.num_sectors = NUM_DIRECT as u32;
        header.data_sectors[NUM_DIRECT - 1] = 0xA1B2_C3D4;
        let bytes = header.to_bytes();
        assert_eq!(bytes[SECTOR_SIZE - 4..], hex!("d4c3b2a1"));
        assert_eq!(FileHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_corrupt_length_is_rejected() {
        let (mut storage, _) = setup(16);
        let mut bytes = [0xFF; SECTOR_SIZE];
        bytes[..4].copy_from_slice(&(MAX_FILE_SIZE as u32 + 1).to_le_bytes());
        storage.write_sector(5, &bytes).unwrap();
        assert!(matches!(
            FileHeader::fetch_from(&mut storage, 5),
            Err(FsError::InvalidDevice)
        ));

        bytes[..4].copy_from_slice(&(MAX_FILE_SIZE as u32).to_le_bytes());
        storage.write_sector(5, &bytes).unwrap();
        assert_eq!(
            FileHeader::fetch_from(&mut storage, 5).unwrap().length(),
            MAX_FILE_SIZE
        );
    }

    #[test]
    fn test_direct_allocation() {
        let (mut storage, mut free_map) = setup(64);
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, &mut storage, 300).unwrap();
        assert_eq!(header.level(), Level::Direct);
        assert_eq!(header.slots(), &[2, 3, 4]);
        assert_eq!(header.byte_to_sector(&mut storage, 0).unwrap(), 2);
        assert_eq!(header.byte_to_sector(&mut storage, 128).unwrap(), 3);
        assert_eq!(header.byte_to_sector(&mut storage, 299).unwrap(), 4);
        assert!(matches!(
            header.byte_to_sector(&mut storage, 300),
            Err(FsError::OutOfBounds {
                offset: 300,
                length: 300
            })
        ));
        assert_eq!(header.header_sectors(&mut storage).unwrap(), 1);
    }

    #[test]
    fn test_offsets_cross_into_second_child() {
        let (mut storage, mut free_map) = setup(128);
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, &mut storage, 4000).unwrap();
        assert_eq!(header.level(), Level::Indirect { span: LEVEL1_BYTES });
        assert_eq!(header.slots().len(), 2);

        let first = FileHeader::fetch_from(&mut storage, header.slots()[0]).unwrap();
        let second = FileHeader::fetch_from(&mut storage, header.slots()[1]).unwrap();
        assert_eq!(first.length(), LEVEL1_BYTES);
        assert_eq!(second.length(), 160);
        assert_eq!(first.level(), Level::Direct);

        assert_eq!(
            header.byte_to_sector(&mut storage, 0).unwrap(),
            first.slots()[0]
        );
        assert_eq!(
            header.byte_to_sector(&mut storage, 3900).unwrap(),
            second.slots()[0]
        );
        assert_eq!(
            header.byte_to_sector(&mut storage, 3999).unwrap(),
            second.slots()[1]
        );
        assert_eq!(header.header_sectors(&mut storage).unwrap(), 3);
    }

    #[test]
    fn test_offsets_match_reference_model() {
        use rand::Rng;

        let (mut storage, mut free_map) = setup(1024);
        let length = 50_000;
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, &mut storage, length).unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let offset = rng.gen_range(0..length);
            let child = FileHeader::fetch_from(&mut storage, header.slots()[offset / LEVEL1_BYTES])
                .unwrap();
            let expected = child.slots()[(offset % LEVEL1_BYTES) / SECTOR_SIZE];
            assert_eq!(header.byte_to_sector(&mut storage, offset).unwrap(), expected);
        }
    }

    #[test]
    fn test_allocate_deallocate_is_inverse() {
        let (mut storage, mut free_map) = setup(1024);
        let before = free_map.clone();
        for length in [0, 1, 128, 3840, 3841, 4000, 20_000, 115_200] {
            let mut header = FileHeader::new();
            header.allocate(&mut free_map, &mut storage, length).unwrap();
            assert_eq!(
                before.count_clear() - free_map.count_clear(),
                FileHeader::sectors_needed(length)
            );
            header.deallocate(&mut free_map, &mut storage).unwrap();
            assert_eq!(free_map, before, "length {}", length);
        }
    }

    #[test]
    fn test_out_of_space_claims_nothing() {
        let (mut storage, mut free_map) = setup(64);
        let before = free_map.clone();
        let mut header = FileHeader::new();
        let result = header.allocate(&mut free_map, &mut storage, 62 * SECTOR_SIZE + 1);
        assert!(matches!(result, Err(FsError::OutOfSpace)));
        assert_eq!(free_map, before);

        let result = header.allocate(&mut free_map, &mut storage, MAX_FILE_SIZE + 1);
        assert!(matches!(result, Err(FsError::FileTooLarge { .. })));
    }

    #[test]
    fn test_write_back_fetch_round_trip_every_depth() {
        let (mut storage, mut free_map) = setup(1024);
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, &mut storage, 116_000).unwrap();
        assert_eq!(header.level(), Level::Indirect { span: LEVEL2_BYTES });

        header.write_back(&mut storage, 1).unwrap();
        assert_eq!(FileHeader::fetch_from(&mut storage, 1).unwrap(), header);

        let first = FileHeader::fetch_from(&mut storage, header.slots()[0]).unwrap();
        assert_eq!(first.length(), LEVEL2_BYTES);
        assert_eq!(first.level(), Level::Indirect { span: LEVEL1_BYTES });
        first.write_back(&mut storage, 1).unwrap();
        assert_eq!(FileHeader::fetch_from(&mut storage, 1).unwrap(), first);

        let tail = FileHeader::fetch_from(&mut storage, header.slots()[1]).unwrap();
        assert_eq!(tail.length(), 800);

        let leaf = FileHeader::fetch_from(&mut storage, first.slots()[0]).unwrap();
        assert_eq!(leaf.level(), Level::Direct);
        assert_eq!(leaf.length(), LEVEL1_BYTES);
        leaf.write_back(&mut storage, 1).unwrap();
        assert_eq!(FileHeader::fetch_from(&mut storage, 1).unwrap(), leaf);
    }
}
