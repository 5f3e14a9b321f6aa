//! Path names and their resolution against the directory tree.
//!
//! Resolution walks slash separated components from the root,
//! descending while each component names a sub-directory. The
//! first component that is not a sub-directory becomes the leaf
//! the caller acts on, and anything after it is ignored: given
//! `/a/b/c` where `a` does not exist, the leaf is `a` in the
//! root directory.

use std::fmt;

use super::directory::Directory;
use super::openfile::OpenFile;
use super::storage::{BlockIO, Storage};
use super::{FsError, Result};
use tracing::debug;

pub const SEPARATOR: char = '/';
pub const MAX_PATH_LEN: usize = 255;
pub const FILE_NAME_MAX_LEN: usize = 9;

pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(SEPARATOR) || name.contains('\0') {
        return Err(FsError::InvalidPath(format!("bad file name {:?}", name)));
    }
    if name.len() > FILE_NAME_MAX_LEN {
        return Err(FsError::InvalidPath(format!(
            "file name {:?} is longer than {} bytes",
            name, FILE_NAME_MAX_LEN
        )));
    }
    Ok(())
}

/// A path name within the limits of the file system: each
/// component a valid file name, and at most `MAX_PATH_LEN`
/// bytes once spelled as `/a/b/c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsPath(String);

impl FsPath {
    pub fn new(path: &str) -> Result<Self> {
        let mut canonical = String::with_capacity(path.len().min(MAX_PATH_LEN) + 1);
        for name in path.split(SEPARATOR).filter(|name| !name.is_empty()) {
            check_name(name)?;
            canonical.push(SEPARATOR);
            canonical.push_str(name);
        }
        if canonical.is_empty() {
            canonical.push(SEPARATOR);
        }
        if canonical.len() > MAX_PATH_LEN {
            return Err(FsError::InvalidPath(format!(
                "path is longer than {} bytes",
                MAX_PATH_LEN
            )));
        }
        Ok(Self(canonical))
    }

    pub fn components(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.split(SEPARATOR).filter(|name| !name.is_empty())
    }

    /// `self/name`, still subject to the length limit.
    pub fn join(&self, name: &str) -> Result<Self> {
        Self::new(&format!("{}{}{}", self.0, SEPARATOR, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a path walk ended.
#[derive(Debug)]
pub(crate) struct Walk {
    /// Table of the last directory reached
    pub directory: Directory,
    /// File backing `directory`
    pub directory_file: OpenFile,
    /// File of the directory holding the entry for `directory`,
    /// the root when the walk never left it
    pub parent_file: OpenFile,
    /// Name of `directory` within its parent, `None` for the root
    pub last_dir: Option<String>,
    /// First component that was not a sub-directory
    pub leaf: Option<String>,
}

pub(crate) fn walk<D: BlockIO>(
    storage: &mut Storage<D>,
    root: &OpenFile,
    path: &FsPath,
) -> Result<Walk> {
    let mut directory_file = root.clone();
    let mut parent_file = root.clone();
    let mut directory = Directory::fetch_from(storage, &directory_file)?;
    let mut last_dir = None;
    let mut leaf = None;

    let mut components = path.components();
    for name in components.by_ref() {
        match directory.find_dir(name) {
            Some(sector) => {
                let next = OpenFile::open(storage, sector)?;
                directory = Directory::fetch_from(storage, &next)?;
                parent_file = std::mem::replace(&mut directory_file, next);
                last_dir = Some(name.to_owned());
            }
            None => {
                leaf = Some(name.to_owned());
                break;
            }
        }
    }
    let ignored: Vec<&str> = components.collect();
    if !ignored.is_empty() {
        debug!(
            "resolving {} stopped at {:?}, ignoring {:?}",
            path, leaf, ignored
        );
    }

    Ok(Walk {
        directory,
        directory_file,
        parent_file,
        last_dir,
        leaf,
    })
}

#[test]
fn test_components() {
    let path = FsPath::new("/a//bb/c/").unwrap();
    assert_eq!(path.components().collect::<Vec<_>>(), vec!["a", "bb", "c"]);
    assert_eq!(FsPath::new("/").unwrap().components().count(), 0);
}

#[test]
fn test_canonical_spelling() {
    assert_eq!(FsPath::new("//a///bb/c/").unwrap().as_str(), "/a/bb/c");
    assert_eq!(FsPath::new("a/b").unwrap().as_str(), "/a/b");
    assert_eq!(FsPath::new("").unwrap().as_str(), "/");

    // extra separators do not count against the limit
    let padded = format!("{}top", "/".repeat(240));
    let path = FsPath::new(&padded).unwrap();
    assert_eq!(path.as_str(), "/top");
    assert_eq!(path.join("child").unwrap().as_str(), "/top/child");
}

#[test]
fn test_rejects_bad_paths() {
    assert!(matches!(
        FsPath::new("/averylongname"),
        Err(FsError::InvalidPath(_))
    ));
    let long = "/abcdefgh".repeat(32);
    assert!(long.len() > MAX_PATH_LEN);
    assert!(matches!(FsPath::new(&long), Err(FsError::InvalidPath(_))));
}

#[test]
fn test_join_enforces_limit() {
    let base = FsPath::new("/dir").unwrap();
    assert_eq!(base.join("file").unwrap().as_str(), "/dir/file");
    assert_eq!(FsPath::new("/").unwrap().join("x").unwrap().as_str(), "/x");

    let deep = FsPath::new(&"/abcdefgh".repeat(28)).unwrap();
    assert_eq!(deep.as_str().len(), 252);
    assert!(matches!(deep.join("abcd"), Err(FsError::InvalidPath(_))));
    assert!(deep.join("ab").is_ok());
}
