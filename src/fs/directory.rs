//! Directories are fixed-size tables of named entries, stored
//! as the contents of an ordinary file. An entry names either
//! a file or another directory by the sector of its header.
//!
//! A table is fetched for the duration of one operation,
//! changed in memory, and written back (or dropped).

use std::fmt;

use packed_struct::prelude::*;

use super::openfile::OpenFile;
use super::path::{check_name, FILE_NAME_MAX_LEN};
use super::storage::{BlockIO, Storage};
use super::{FsError, Result};

pub const NUM_DIR_ENTRIES: usize = 64;

#[derive(PackedStruct, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct DirectoryEntry {
    pub in_use: u8,
    pub is_dir: u8,
    /// Sector of the entry's file header
    pub sector: u32,
    /// NUL padded, at most `FILE_NAME_MAX_LEN` bytes
    pub name: [u8; 10],
}

impl DirectoryEntry {
    pub const SIZE: usize = 16;

    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(FILE_NAME_MAX_LEN);
        &self.name[..end.min(FILE_NAME_MAX_LEN)]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    fn matches(&self, name: &str) -> bool {
        self.in_use() && self.name_bytes() == name.as_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    table: Vec<DirectoryEntry>,
}

impl Directory {
    /// Bytes of the file backing a directory.
    pub const FILE_SIZE: usize = NUM_DIR_ENTRIES * DirectoryEntry::SIZE;

    pub fn new(size: usize) -> Self {
        Self {
            table: vec![DirectoryEntry::default(); size],
        }
    }

    pub fn fetch_from<D: BlockIO>(storage: &mut Storage<D>, file: &OpenFile) -> Result<Self> {
        let mut bytes = vec![0; Self::FILE_SIZE];
        file.read_at(storage, &mut bytes, 0)?;
        let table = bytes
            .chunks_exact(DirectoryEntry::SIZE)
            .map(DirectoryEntry::unpack_from_slice)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { table })
    }

    pub fn write_back<D: BlockIO>(&self, storage: &mut Storage<D>, file: &OpenFile) -> Result<()> {
        let mut bytes = Vec::with_capacity(self.table.len() * DirectoryEntry::SIZE);
        for entry in &self.table {
            bytes.extend_from_slice(&entry.pack()?);
        }
        file.write_at(storage, &bytes, 0)?;
        Ok(())
    }

    fn find_index(&self, name: &str) -> Option<usize> {
        self.table.iter().position(|entry| entry.matches(name))
    }

    /// Sector of the header for `name`, file or directory.
    pub fn find(&self, name: &str) -> Option<u32> {
        self.find_index(name).map(|index| self.table[index].sector)
    }

    /// Like `find`, but only matches directories.
    pub fn find_dir(&self, name: &str) -> Option<u32> {
        self.table
            .iter()
            .find(|entry| entry.matches(name) && entry.is_dir())
            .map(|entry| entry.sector)
    }

    pub fn add(&mut self, name: &str, sector: u32) -> Result<()> {
        self.insert(name, sector, false)
    }

    pub fn add_dir(&mut self, name: &str, sector: u32) -> Result<()> {
        self.insert(name, sector, true)
    }

    fn insert(&mut self, name: &str, sector: u32, is_dir: bool) -> Result<()> {
        check_name(name)?;
        if self.find_index(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = self
            .table
            .iter_mut()
            .find(|entry| !entry.in_use())
            .ok_or(FsError::DirectoryFull)?;
        let mut entry = DirectoryEntry {
            in_use: 1,
            is_dir: is_dir as u8,
            sector,
            name: [0; 10],
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        *slot = entry;
        Ok(())
    }

    /// Returns false when `name` is not in the table.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.find_index(name) {
            Some(index) => {
                self.table[index] = DirectoryEntry::default();
                true
            }
            None => false,
        }
    }

    /// Entries currently in use, in table order.
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> + '_ {
        self.table.iter().filter(|entry| entry.in_use())
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    pub fn list(&self) -> Listing {
        let mut listing = Listing::default();
        self.list_into(&mut listing, 0);
        listing
    }

    fn list_into(&self, listing: &mut Listing, depth: usize) {
        for entry in self.entries() {
            listing.0.push(ListingLine::Entry {
                depth,
                name: entry.name(),
                is_dir: entry.is_dir(),
            });
        }
        if self.is_empty() {
            listing.0.push(ListingLine::Empty { depth });
        }
    }

    /// Depth-first listing that descends into every sub-directory.
    pub fn recursive_list<D: BlockIO>(&self, storage: &mut Storage<D>, depth: usize) -> Result<Listing> {
        let mut listing = Listing::default();
        self.recursive_list_into(storage, &mut listing, depth)?;
        Ok(listing)
    }

    fn recursive_list_into<D: BlockIO>(
        &self,
        storage: &mut Storage<D>,
        listing: &mut Listing,
        depth: usize,
    ) -> Result<()> {
        if self.is_empty() {
            listing.0.push(ListingLine::Empty { depth });
        }
        for entry in self.entries() {
            listing.0.push(ListingLine::Entry {
                depth,
                name: entry.name(),
                is_dir: entry.is_dir(),
            });
            if entry.is_dir() {
                let file = OpenFile::open(storage, entry.sector)?;
                let child = Directory::fetch_from(storage, &file)?;
                child.recursive_list_into(storage, listing, depth + 1)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListingLine {
    Entry {
        depth: usize,
        name: String,
        is_dir: bool,
    },
    Empty {
        depth: usize,
    },
}

/// Output of `list` and `recursive_list`, one line per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing(Vec<ListingLine>);

impl Listing {
    /// Names of every entry, without indentation or tags.
    pub fn names(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|line| match line {
                ListingLine::Entry { name, .. } => Some(name.as_str()),
                ListingLine::Empty { .. } => None,
            })
            .collect()
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.0 {
            match line {
                ListingLine::Entry {
                    depth,
                    name,
                    is_dir,
                } => {
                    let tag = if *is_dir { "[D]" } else { "[F]" };
                    writeln!(f, "{}{} {}", "   ".repeat(*depth), tag, name)?;
                }
                ListingLine::Empty { depth } => {
                    writeln!(f, "{}the directory is empty", "   ".repeat(*depth))?;
                }
            }
        }
        Ok(())
    }
}

#[test]
fn test_entry_size() {
    let packed = DirectoryEntry::default().pack().unwrap();
    assert_eq!(packed.len(), DirectoryEntry::SIZE);
    assert_eq!(Directory::FILE_SIZE, 1024);
}

#[test]
fn test_add_find_remove() {
    let mut directory = Directory::new(NUM_DIR_ENTRIES);
    directory.add("notes", 12).unwrap();
    directory.add_dir("docs", 20).unwrap();
    assert_eq!(directory.find("notes"), Some(12));
    assert_eq!(directory.find("docs"), Some(20));
    assert_eq!(directory.find_dir("docs"), Some(20));
    assert_eq!(directory.find_dir("notes"), None);

    assert!(directory.remove("notes"));
    assert_eq!(directory.find("notes"), None);
    assert!(!directory.remove("notes"));
}

#[test]
fn test_duplicate_add_leaves_table_alone() {
    let mut directory = Directory::new(NUM_DIR_ENTRIES);
    directory.add("a", 5).unwrap();
    let before = directory.clone();
    assert!(matches!(directory.add("a", 6), Err(FsError::AlreadyExists)));
    assert!(matches!(directory.add_dir("a", 6), Err(FsError::AlreadyExists)));
    assert_eq!(directory, before);
    assert_eq!(directory.find("a"), Some(5));
}

#[test]
fn test_full_directory() {
    let mut directory = Directory::new(4);
    for (sector, name) in ["a", "b", "c", "d"].iter().enumerate() {
        directory.add(name, sector as u32 + 2).unwrap();
    }
    assert!(matches!(directory.add("e", 9), Err(FsError::DirectoryFull)));
    directory.remove("b");
    directory.add("e", 9).unwrap();
    assert_eq!(directory.find("e"), Some(9));
}

#[test]
fn test_names_are_bounded() {
    let mut directory = Directory::new(4);
    directory.add("ninechars", 2).unwrap();
    assert_eq!(directory.find("ninechars"), Some(2));
    assert!(matches!(
        directory.add("tenletters", 3),
        Err(FsError::InvalidPath(_))
    ));
}

#[test]
fn test_listing_format() {
    let mut directory = Directory::new(8);
    directory.add_dir("sub", 4).unwrap();
    directory.add("file", 5).unwrap();
    assert_eq!(directory.list().to_string(), "[D] sub\n[F] file\n");
    assert_eq!(
        Directory::new(8).list().to_string(),
        "the directory is empty\n"
    );
}
