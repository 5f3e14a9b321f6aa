//! A small hierarchical file system on a fixed size block
//! device. Files and directories are described by one-sector
//! headers whose indirection depth grows with the file size,
//! and free sectors are tracked by an on-disk bitmap.
//!
//! ```no_run
//! use sectorfs::{disk::MemoryDisk, FileSystem};
//!
//! let mut fs = FileSystem::format(MemoryDisk::new(1024))?;
//! fs.create_subdir("/docs")?;
//! fs.create("/docs/notes", 200)?;
//! let mut notes = fs.open("/docs/notes")?;
//! fs.write(&mut notes, b"hello")?;
//! print!("{}", fs.recursive_list("/")?);
//! # Ok::<(), sectorfs::fs::FsError>(())
//! ```

pub mod disk;
pub mod fs;
pub mod syscall;

pub use fs::{FileSystem, FsError};
