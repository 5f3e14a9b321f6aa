//! The file system as user programs see it through system
//! calls: integer results, and a single current open file.
//!
//! Only one file is open at a time. Opening a file replaces
//! the current one, and read, write and close act on the
//! current file whatever id they are given. An id is the
//! sector of the file's header, 0 meaning failure.

use crate::fs::storage::BlockIO;
use crate::fs::{openfile::OpenFile, FileSystem};
use tracing::{debug, warn};

pub type OpenFileId = u32;

#[derive(Debug)]
pub struct FileSyscalls<Device: BlockIO> {
    fs: FileSystem<Device>,
    current: Option<OpenFile>,
}

impl<Device: BlockIO> FileSyscalls<Device> {
    pub fn new(fs: FileSystem<Device>) -> Self {
        Self { fs, current: None }
    }

    pub fn file_system(&mut self) -> &mut FileSystem<Device> {
        &mut self.fs
    }

    /// Returns 1 on success, 0 on failure.
    pub fn sys_create(&mut self, name: &str, size: i32) -> i32 {
        let Ok(size) = usize::try_from(size) else {
            return 0;
        };
        match self.fs.create(name, size) {
            Ok(()) => 1,
            Err(err) => {
                debug!("create {} failed: {}", name, err);
                0
            }
        }
    }

    pub fn sys_open(&mut self, name: &str) -> OpenFileId {
        match self.fs.open(name) {
            Ok(file) => {
                let id = file.sector();
                if let Some(old) = self.current.replace(file) {
                    warn!("open {} replaces open file {}", name, old.sector());
                }
                id
            }
            Err(err) => {
                debug!("open {} failed: {}", name, err);
                0
            }
        }
    }

    fn check_id(&self, id: OpenFileId) {
        if let Some(file) = &self.current {
            if file.sector() != id {
                debug!("id {} ignored, using open file {}", id, file.sector());
            }
        }
    }

    /// Bytes read into `buf`, at most `size`, or -1.
    pub fn sys_read(&mut self, buf: &mut [u8], size: i32, id: OpenFileId) -> i32 {
        self.check_id(id);
        let Some(file) = self.current.as_mut() else {
            return -1;
        };
        let size = usize::try_from(size).unwrap_or(0).min(buf.len());
        match self.fs.read(file, &mut buf[..size]) {
            Ok(read) => read as i32,
            Err(err) => {
                debug!("read failed: {}", err);
                -1
            }
        }
    }

    /// Bytes written from `buf`, at most `size`, or -1.
    pub fn sys_write(&mut self, buf: &[u8], size: i32, id: OpenFileId) -> i32 {
        self.check_id(id);
        let Some(file) = self.current.as_mut() else {
            return -1;
        };
        let size = usize::try_from(size).unwrap_or(0).min(buf.len());
        match self.fs.write(file, &buf[..size]) {
            Ok(written) => written as i32,
            Err(err) => {
                debug!("write failed: {}", err);
                -1
            }
        }
    }

    /// Returns 1 when a file was closed, 0 when none was open.
    pub fn sys_close(&mut self, id: OpenFileId) -> i32 {
        self.check_id(id);
        match self.current.take() {
            Some(_) => 1,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;

    fn syscalls() -> FileSyscalls<MemoryDisk> {
        FileSyscalls::new(FileSystem::format(MemoryDisk::new(1024)).unwrap())
    }

    #[test]
    fn test_create_open_write_read_close() {
        let mut sys = syscalls();
        assert_eq!(sys.sys_create("/f", 64), 1);
        assert_eq!(sys.sys_create("/f", 64), 0);
        assert_eq!(sys.sys_create("/neg", -1), 0);

        let id = sys.sys_open("/f");
        assert_ne!(id, 0);
        assert_eq!(sys.sys_write(b"abcdef", 6, id), 6);
        assert_eq!(sys.sys_close(id), 1);
        assert_eq!(sys.sys_close(id), 0);

        let id = sys.sys_open("/f");
        let mut buf = [0; 100];
        assert_eq!(sys.sys_read(&mut buf, 100, id), 64);
        assert_eq!(&buf[..6], b"abcdef");
        assert_eq!(sys.sys_read(&mut buf, 100, id), 0);
    }

    #[test]
    fn test_open_failure_and_no_current_file() {
        let mut sys = syscalls();
        assert_eq!(sys.sys_open("/missing"), 0);
        let mut buf = [0; 4];
        assert_eq!(sys.sys_read(&mut buf, 4, 12), -1);
        assert_eq!(sys.sys_write(&buf, 4, 12), -1);
        assert_eq!(sys.sys_close(12), 0);
    }

    #[test]
    fn test_second_open_replaces_current() {
        let mut sys = syscalls();
        sys.sys_create("/a", 10);
        sys.sys_create("/b", 10);
        let a = sys.sys_open("/a");
        let b = sys.sys_open("/b");
        assert_ne!(a, b);

        // the id of a is ignored, the write lands in b
        assert_eq!(sys.sys_write(b"to b", 4, a), 4);
        sys.sys_close(a);

        let fs = sys.file_system();
        let b_file = fs.open("/b").unwrap();
        let mut buf = [0; 4];
        fs.read_at(&b_file, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"to b");
        let a_file = fs.open("/a").unwrap();
        fs.read_at(&a_file, &mut buf, 0).unwrap();
        assert_eq!(buf, [0; 4]);
    }
}
