use super::header::FileHeader;
use super::storage::{BlockIO, Storage, SECTOR_SIZE};
use super::Result;

/// A file opened for reading and writing: its header sector,
/// an in-memory copy of the header, and a seek position.
///
/// Files keep the size they were created with. Reads and
/// writes stop at the end of the file and report how many
/// bytes they moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    sector: u32,
    header: FileHeader,
    position: usize,
}

impl OpenFile {
    pub fn open<D: BlockIO>(storage: &mut Storage<D>, sector: u32) -> Result<Self> {
        Ok(Self::from_header(sector, FileHeader::fetch_from(storage, sector)?))
    }

    pub(crate) fn from_header(sector: u32, header: FileHeader) -> Self {
        Self {
            sector,
            header,
            position: 0,
        }
    }

    /// The sector holding this file's header, which also
    /// identifies the file.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn length(&self) -> usize {
        self.header.length()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    pub fn read_at<D: BlockIO>(
        &self,
        storage: &mut Storage<D>,
        buf: &mut [u8],
        position: usize,
    ) -> Result<usize> {
        let length = self.length();
        if position >= length {
            return Ok(0);
        }
        let count = buf.len().min(length - position);
        let mut done = 0;
        while done < count {
            let offset = position + done;
            let within = offset % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(count - done);
            let sector = self.header.byte_to_sector(storage, offset)?;
            let data = storage.read_sector(sector)?;
            buf[done..done + chunk].copy_from_slice(&data[within..within + chunk]);
            done += chunk;
        }
        Ok(count)
    }

    pub fn write_at<D: BlockIO>(
        &self,
        storage: &mut Storage<D>,
        buf: &[u8],
        position: usize,
    ) -> Result<usize> {
        let length = self.length();
        if position >= length {
            return Ok(0);
        }
        let count = buf.len().min(length - position);
        let mut done = 0;
        while done < count {
            let offset = position + done;
            let within = offset % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(count - done);
            let sector = self.header.byte_to_sector(storage, offset)?;
            // partial sectors keep the bytes around the written range
            let mut data = if chunk == SECTOR_SIZE {
                [0; SECTOR_SIZE]
            } else {
                storage.read_sector(sector)?
            };
            data[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
            storage.write_sector(sector, &data)?;
            done += chunk;
        }
        Ok(count)
    }

    pub fn read<D: BlockIO>(&mut self, storage: &mut Storage<D>, buf: &mut [u8]) -> Result<usize> {
        let read = self.read_at(storage, buf, self.position)?;
        self.position += read;
        Ok(read)
    }

    pub fn write<D: BlockIO>(&mut self, storage: &mut Storage<D>, buf: &[u8]) -> Result<usize> {
        let written = self.write_at(storage, buf, self.position)?;
        self.position += written;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;
    use crate::fs::bitmap::FreeMap;

    fn new_file(length: usize) -> (Storage<MemoryDisk>, OpenFile) {
        let mut storage = Storage::open(MemoryDisk::new(256)).unwrap();
        let mut free_map = FreeMap::new(256);
        free_map.mark(0);
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, &mut storage, length).unwrap();
        header.write_back(&mut storage, 0).unwrap();
        let file = OpenFile::open(&mut storage, 0).unwrap();
        (storage, file)
    }

    #[test]
    fn test_unaligned_write_read() {
        let (mut storage, file) = new_file(1000);
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();
        assert_eq!(file.write_at(&mut storage, &data, 100).unwrap(), 300);

        let mut back = vec![0; 300];
        assert_eq!(file.read_at(&mut storage, &mut back, 100).unwrap(), 300);
        assert_eq!(back, data);

        // neighbouring bytes stay zero
        let mut around = vec![0xFF; 2];
        file.read_at(&mut storage, &mut around, 99).unwrap();
        assert_eq!(around, vec![0, 0]);
        file.read_at(&mut storage, &mut around, 400).unwrap();
        assert_eq!(around, vec![0, 0]);
    }

    #[test]
    fn test_io_stops_at_end_of_file() {
        let (mut storage, mut file) = new_file(200);
        assert_eq!(file.write(&mut storage, &[7; 150]).unwrap(), 150);
        assert_eq!(file.write(&mut storage, &[9; 150]).unwrap(), 50);
        assert_eq!(file.write(&mut storage, &[1; 10]).unwrap(), 0);

        file.seek(0);
        let mut buf = vec![0; 500];
        assert_eq!(file.read(&mut storage, &mut buf).unwrap(), 200);
        assert!(buf[..150].iter().all(|&byte| byte == 7));
        assert!(buf[150..200].iter().all(|&byte| byte == 9));
        assert_eq!(file.position(), 200);
        assert_eq!(file.read(&mut storage, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_io_across_indirect_children() {
        let (mut storage, file) = new_file(8000);
        let data: Vec<u8> = (0..8000).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write_at(&mut storage, &data, 0).unwrap(), 8000);
        let mut back = vec![0; 8000];
        assert_eq!(file.read_at(&mut storage, &mut back, 0).unwrap(), 8000);
        assert_eq!(back, data);
    }
}
