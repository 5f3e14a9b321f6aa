//! The file system proper: path names mapped onto files whose
//! sectors are tracked by a free-space bitmap.
//!
//! Two files are always present. The free-sector bitmap has its
//! header in sector 0 and the root directory has its header in
//! sector 1; their data sits wherever format placed it.
//!
//! A `FileSystem` takes `&mut self` for every operation, so a
//! single owner serializes all access. Operations that change the
//! bitmap or a directory fetch private copies, and only a fully
//! successful operation writes them back. Nothing here survives
//! a crash in the middle of those writes.

use std::fmt;

use packed_struct::PackingError;
use thiserror::Error;
use tracing::{debug, warn};

pub mod bitmap;
pub mod directory;
pub mod header;
pub mod openfile;
pub mod path;
pub mod storage;

use bitmap::FreeMap;
use directory::{Directory, Listing, NUM_DIR_ENTRIES};
use header::FileHeader;
use openfile::OpenFile;
use path::{walk, FsPath, Walk};
use storage::{BlockIO, Storage, SECTOR_SIZE};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FsError {
    #[error("No such file or directory")]
    NotFound,
    #[error("The name is already taken")]
    AlreadyExists,
    #[error("Not enough free sectors for operation")]
    OutOfSpace,
    #[error("The directory has no free entries")]
    DirectoryFull,
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("A file of {length} bytes exceeds the maximum of {max} bytes")]
    FileTooLarge { length: usize, max: usize },
    #[error("The path names a directory")]
    IsDirectory,
    #[error("The directory is not empty")]
    NotEmpty,
    #[error("Offset {offset} is outside a file of {length} bytes")]
    OutOfBounds { offset: usize, length: usize },
    #[error("Sector {0} is outside the device")]
    SectorOutOfRange(u32),
    #[error("The device is invalid")]
    InvalidDevice,
    #[error("The expected block size is {expected}, but the device reports {device}")]
    BlockSizeMismatch { expected: usize, device: usize },
    #[error("Device I/O failed: {0}")]
    Device(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Malformed on-disk record: {0}")]
    Packing(#[from] PackingError),
}

type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug)]
pub struct FileSystem<Device: BlockIO> {
    storage: Storage<Device>,
    free_map_file: OpenFile,
    directory_file: OpenFile,
}

impl<Device: BlockIO> FileSystem<Device> {
    pub const FREE_MAP_SECTOR: u32 = 0;
    pub const DIRECTORY_SECTOR: u32 = 1;

    /// Lays out an empty file system on `device`: the bitmap and
    /// root directory headers in their fixed sectors, space for
    /// their contents, then the contents themselves.
    pub fn format(device: Device) -> Result<Self> {
        let mut storage = Storage::open(device)?;
        debug!("Formatting {} sectors", storage.sector_count());
        let mut free_map = FreeMap::new(storage.sector_count());
        let directory = Directory::new(NUM_DIR_ENTRIES);

        free_map.mark(Self::FREE_MAP_SECTOR);
        free_map.mark(Self::DIRECTORY_SECTOR);

        let map_len = free_map.byte_len();
        let mut map_header = FileHeader::new();
        map_header.allocate(&mut free_map, &mut storage, map_len)?;
        let mut dir_header = FileHeader::new();
        dir_header.allocate(&mut free_map, &mut storage, Directory::FILE_SIZE)?;

        map_header.write_back(&mut storage, Self::FREE_MAP_SECTOR)?;
        dir_header.write_back(&mut storage, Self::DIRECTORY_SECTOR)?;

        let free_map_file = OpenFile::from_header(Self::FREE_MAP_SECTOR, map_header);
        let directory_file = OpenFile::from_header(Self::DIRECTORY_SECTOR, dir_header);
        free_map.write_back(&mut storage, &free_map_file)?;
        directory.write_back(&mut storage, &directory_file)?;
        debug!("Format done, {} sectors free", free_map.count_clear());

        Ok(Self {
            storage,
            free_map_file,
            directory_file,
        })
    }

    /// Opens a device that was formatted before.
    pub fn mount(device: Device) -> Result<Self> {
        let mut storage = Storage::open(device)?;
        let free_map_file = OpenFile::open(&mut storage, Self::FREE_MAP_SECTOR)?;
        let directory_file = OpenFile::open(&mut storage, Self::DIRECTORY_SECTOR)?;
        if free_map_file.length() * 8 != storage.sector_count() {
            debug!(
                "Bitmap covers {} sectors, device has {}",
                free_map_file.length() * 8,
                storage.sector_count()
            );
            return Err(FsError::InvalidDevice);
        }
        if directory_file.length() != Directory::FILE_SIZE {
            debug!("Root directory is {} bytes", directory_file.length());
            return Err(FsError::InvalidDevice);
        }
        Ok(Self {
            storage,
            free_map_file,
            directory_file,
        })
    }

    fn fetch_free_map(&mut self) -> Result<FreeMap> {
        FreeMap::fetch_from(&mut self.storage, &self.free_map_file)
    }

    fn walk(&mut self, path: &FsPath) -> Result<Walk> {
        walk(&mut self.storage, &self.directory_file, path)
    }

    /// A copy of the bitmap as it is on disk.
    pub fn free_map(&mut self) -> Result<FreeMap> {
        self.fetch_free_map()
    }

    pub fn free_sectors(&mut self) -> Result<usize> {
        Ok(self.fetch_free_map()?.count_clear())
    }

    /// Creates a file of `initial_size` bytes. Files cannot
    /// grow later.
    pub fn create(&mut self, path: &str, initial_size: usize) -> Result<()> {
        let path = FsPath::new(path)?;
        debug!("Creating file {} of {} bytes", path, initial_size);
        let Walk {
            mut directory,
            directory_file,
            last_dir,
            leaf,
            ..
        } = self.walk(&path)?;
        let name = leaf_name(leaf, last_dir, FsError::AlreadyExists)?;
        if directory.find(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mut free_map = self.fetch_free_map()?;
        let sector = free_map.find_and_set().ok_or(FsError::OutOfSpace)?;
        directory.add(&name, sector)?;
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, &mut self.storage, initial_size)?;

        header.write_back(&mut self.storage, sector)?;
        directory.write_back(&mut self.storage, &directory_file)?;
        free_map.write_back(&mut self.storage, &self.free_map_file)?;
        Ok(())
    }

    /// Creates an empty sub-directory.
    pub fn create_subdir(&mut self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?;
        debug!("Creating directory {}", path);
        let Walk {
            mut directory,
            directory_file,
            last_dir,
            leaf,
            ..
        } = self.walk(&path)?;
        let name = leaf_name(leaf, last_dir, FsError::AlreadyExists)?;

        let mut free_map = self.fetch_free_map()?;
        let sector = free_map.find_and_set().ok_or(FsError::OutOfSpace)?;
        directory.add_dir(&name, sector)?;
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, &mut self.storage, Directory::FILE_SIZE)?;

        header.write_back(&mut self.storage, sector)?;
        let sub_file = OpenFile::from_header(sector, header);
        Directory::new(NUM_DIR_ENTRIES).write_back(&mut self.storage, &sub_file)?;
        directory.write_back(&mut self.storage, &directory_file)?;
        free_map.write_back(&mut self.storage, &self.free_map_file)?;
        Ok(())
    }

    pub fn open(&mut self, path: &str) -> Result<OpenFile> {
        let path = FsPath::new(path)?;
        debug!("Opening file {}", path);
        let Walk {
            directory,
            last_dir,
            leaf,
            ..
        } = self.walk(&path)?;
        let name = leaf_name(leaf, last_dir, FsError::IsDirectory)?;
        let sector = directory.find(&name).ok_or(FsError::NotFound)?;
        OpenFile::open(&mut self.storage, sector)
    }

    pub fn read(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        file.read(&mut self.storage, buf)
    }

    pub fn write(&mut self, file: &mut OpenFile, buf: &[u8]) -> Result<usize> {
        file.write(&mut self.storage, buf)
    }

    pub fn read_at(&mut self, file: &OpenFile, buf: &mut [u8], position: usize) -> Result<usize> {
        file.read_at(&mut self.storage, buf, position)
    }

    pub fn write_at(&mut self, file: &OpenFile, buf: &[u8], position: usize) -> Result<usize> {
        file.write_at(&mut self.storage, buf, position)
    }

    /// Removes a file and releases its sectors.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?;
        self.remove_file(&path)
    }

    fn remove_file(&mut self, path: &FsPath) -> Result<()> {
        debug!("Removing file {}", path);
        let Walk {
            mut directory,
            directory_file,
            last_dir,
            leaf,
            ..
        } = self.walk(path)?;
        let name = leaf_name(leaf, last_dir, FsError::IsDirectory)?;
        let sector = directory.find(&name).ok_or(FsError::NotFound)?;

        let header = FileHeader::fetch_from(&mut self.storage, sector)?;
        let mut free_map = self.fetch_free_map()?;
        header.deallocate(&mut free_map, &mut self.storage)?;
        free_map.clear(sector);
        directory.remove(&name);

        free_map.write_back(&mut self.storage, &self.free_map_file)?;
        directory.write_back(&mut self.storage, &directory_file)?;
        Ok(())
    }

    /// Removes an empty sub-directory.
    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?;
        self.remove_empty_dir(&path)
    }

    fn remove_empty_dir(&mut self, path: &FsPath) -> Result<()> {
        debug!("Removing directory {}", path);
        let Walk {
            directory,
            directory_file,
            parent_file,
            last_dir,
            leaf,
        } = self.walk(path)?;
        if leaf.is_some() {
            return Err(FsError::NotFound);
        }
        let name = last_dir.ok_or_else(root_error)?;
        if !directory.is_empty() {
            return Err(FsError::NotEmpty);
        }

        let mut free_map = self.fetch_free_map()?;
        directory_file
            .header()
            .deallocate(&mut free_map, &mut self.storage)?;
        free_map.clear(directory_file.sector());
        // the walk ends inside the target, its entry lives one level up
        let mut parent = Directory::fetch_from(&mut self.storage, &parent_file)?;
        parent.remove(&name);

        free_map.write_back(&mut self.storage, &self.free_map_file)?;
        parent.write_back(&mut self.storage, &parent_file)?;
        Ok(())
    }

    /// Removes a file, or a directory together with everything
    /// beneath it.
    pub fn recursive_remove(&mut self, path: &str) -> Result<()> {
        let path = FsPath::new(path)?;
        self.remove_tree(&path)
    }

    fn remove_tree(&mut self, path: &FsPath) -> Result<()> {
        let Walk {
            directory,
            last_dir,
            leaf,
            ..
        } = self.walk(path)?;
        match (leaf, last_dir) {
            (Some(name), _) => {
                if directory.find(&name).is_none() {
                    return Err(FsError::NotFound);
                }
                self.remove_file(path)
            }
            (None, None) => Err(root_error()),
            (None, Some(_)) => {
                for entry in directory.entries() {
                    let child = path.join(&entry.name())?;
                    if entry.is_dir() {
                        self.remove_tree(&child)?;
                    } else {
                        self.remove_file(&child)?;
                    }
                }
                self.remove_empty_dir(path)
            }
        }
    }

    /// Entries of the directory `path` resolves to.
    pub fn list(&mut self, path: &str) -> Result<Listing> {
        let path = FsPath::new(path)?;
        let walk = self.walk(&path)?;
        if let Some(leaf) = &walk.leaf {
            warn!("{} is not a directory, listing the directory holding it", leaf);
        }
        Ok(walk.directory.list())
    }

    /// Like `list`, descending into every sub-directory.
    pub fn recursive_list(&mut self, path: &str) -> Result<Listing> {
        let path = FsPath::new(path)?;
        let walk = self.walk(&path)?;
        if let Some(leaf) = &walk.leaf {
            warn!("{} is not a directory, listing the directory holding it", leaf);
        }
        walk.directory.recursive_list(&mut self.storage, 0)
    }

    /// Length of the file at `path` and the bytes taken by its
    /// header sectors at every level.
    pub fn header_size(&mut self, path: &str) -> Result<(usize, usize)> {
        let file = self.open(path)?;
        let headers = file.header().header_sectors(&mut self.storage)?;
        Ok((file.length(), headers * SECTOR_SIZE))
    }

    /// Human readable description of the bitmap, the root
    /// directory, and the headers of the root's entries.
    pub fn dump(&mut self) -> Result<Dump> {
        let free_map = self.fetch_free_map()?;
        let directory = Directory::fetch_from(&mut self.storage, &self.directory_file)?;
        let mut entries = Vec::new();
        for entry in directory.entries() {
            let header = FileHeader::fetch_from(&mut self.storage, entry.sector)?;
            entries.push((entry.name(), entry.sector, header));
        }
        Ok(Dump {
            free_map_header: self.free_map_file.header().clone(),
            directory_header: self.directory_file.header().clone(),
            used: free_map.used().collect(),
            entries,
        })
    }

    pub fn sector_count(&self) -> usize {
        self.storage.sector_count()
    }

    pub fn into_device(self) -> Device {
        self.storage.into_device()
    }
}

/// Snapshot taken by `FileSystem::dump`.
#[derive(Debug, Clone)]
pub struct Dump {
    free_map_header: FileHeader,
    directory_header: FileHeader,
    used: Vec<u32>,
    entries: Vec<(String, u32, FileHeader)>,
}

impl fmt::Display for Dump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bit map file header: {}", self.free_map_header)?;
        writeln!(f, "Directory file header: {}", self.directory_header)?;
        writeln!(f, "Sectors in use:")?;
        for (i, sector) in self.used.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", sector)?;
        }
        writeln!(f)?;
        writeln!(f, "Directory contents:")?;
        for (name, sector, header) in &self.entries {
            writeln!(f, "Name: {}, Sector: {}, {}", name, sector, header)?;
        }
        Ok(())
    }
}

fn root_error() -> FsError {
    FsError::InvalidPath("the root directory cannot be removed".to_owned())
}

/// Picks the name an operation acts on. A walk that consumed
/// every component ended on a directory (`when_dir`), or on the
/// root if it never descended.
fn leaf_name(leaf: Option<String>, last_dir: Option<String>, when_dir: FsError) -> Result<String> {
    match (leaf, last_dir) {
        (Some(name), _) => Ok(name),
        (None, Some(_)) => Err(when_dir),
        (None, None) => Err(FsError::InvalidPath("the path names the root directory".to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;

    fn formatted() -> FileSystem<MemoryDisk> {
        FileSystem::format(MemoryDisk::new(1024)).unwrap()
    }

    #[test]
    fn test_format_layout() {
        let mut fs = formatted();
        let free_map = fs.free_map().unwrap();
        // two headers, one bitmap sector, eight directory sectors
        assert_eq!(free_map.used().collect::<Vec<_>>(), (0..11).collect::<Vec<_>>());
        assert_eq!(fs.free_sectors().unwrap(), 1024 - 11);
        assert_eq!(fs.list("/").unwrap().to_string(), "the directory is empty\n");
    }

    #[test]
    fn test_mount_sees_formatted_state() {
        let mut fs = formatted();
        fs.create("/kept", 500).unwrap();
        let free = fs.free_sectors().unwrap();
        let mut fs = FileSystem::mount(fs.into_device()).unwrap();
        assert_eq!(fs.free_sectors().unwrap(), free);
        assert_eq!(fs.open("/kept").unwrap().length(), 500);
    }

    #[test]
    fn test_mount_rejects_blank_device() {
        assert!(FileSystem::mount(MemoryDisk::new(1024)).is_err());
    }

    #[test]
    fn test_create_write_read() {
        let mut fs = formatted();
        fs.create("/hello", 20).unwrap();
        let mut file = fs.open("/hello").unwrap();
        assert_eq!(fs.write(&mut file, b"hello, sectors").unwrap(), 14);

        let mut file = fs.open("hello").unwrap();
        let mut buf = [0; 32];
        assert_eq!(fs.read(&mut file, &mut buf).unwrap(), 20);
        assert_eq!(&buf[..14], b"hello, sectors");
        assert_eq!(&buf[14..20], &[0; 6]);
    }

    #[test]
    fn test_create_twice_fails() {
        let mut fs = formatted();
        fs.create("/a", 10).unwrap();
        let before = fs.free_map().unwrap();
        assert!(matches!(fs.create("/a", 10), Err(FsError::AlreadyExists)));
        assert!(matches!(fs.create_subdir("/a"), Err(FsError::AlreadyExists)));
        assert_eq!(fs.free_map().unwrap(), before);

        fs.create_subdir("/d").unwrap();
        assert!(matches!(fs.create("/d", 10), Err(FsError::AlreadyExists)));
        assert!(matches!(fs.create_subdir("/d"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn test_root_is_not_a_leaf() {
        let mut fs = formatted();
        assert!(matches!(fs.create("/", 10), Err(FsError::InvalidPath(_))));
        assert!(matches!(fs.remove_dir("/"), Err(FsError::InvalidPath(_))));
        assert!(matches!(fs.recursive_remove("/"), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn test_open_directory_fails() {
        let mut fs = formatted();
        fs.create_subdir("/d").unwrap();
        assert!(matches!(fs.open("/d"), Err(FsError::IsDirectory)));
        assert!(matches!(fs.open("/missing"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_remove_dir_requires_empty() {
        let mut fs = formatted();
        fs.create_subdir("/d").unwrap();
        fs.create("/d/f", 10).unwrap();
        assert!(matches!(fs.remove_dir("/d"), Err(FsError::NotEmpty)));
        fs.remove("/d/f").unwrap();
        fs.remove_dir("/d").unwrap();
        assert_eq!(fs.list("/").unwrap().names(), Vec::<&str>::new());
    }

    #[test]
    fn test_header_size() {
        let mut fs = formatted();
        fs.create("/small", 100).unwrap();
        fs.create("/big", 10_000).unwrap();
        assert_eq!(fs.header_size("/small").unwrap(), (100, SECTOR_SIZE));
        // root header plus three level-one children
        assert_eq!(fs.header_size("/big").unwrap(), (10_000, 4 * SECTOR_SIZE));
    }

    #[test]
    fn test_dump_mentions_entries() {
        let mut fs = formatted();
        fs.create("/a", 10).unwrap();
        let dump = fs.dump().unwrap().to_string();
        assert!(dump.contains("Name: a, Sector: 11"));
        assert!(dump.contains("Bit map file header: File size: 128."));
        assert!(dump.contains("Sectors in use:\n0 1 2 3 4 5 6 7 8 9 10 11 12\n"));
    }
}
