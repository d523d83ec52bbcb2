//! RAM Filesystem implementation.
//!
//! Files are stored by absolute path. Directories are implied by the
//! paths of the files below them; `/` always exists.

use super::{FileHandle, FileSystem, FsError, Metadata, NodeKind};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// A simple in-memory filesystem.
pub struct RamFs {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    open_handles: Mutex<BTreeMap<FileHandle, String>>,
    next_handle: AtomicU32,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        String::from("/")
    } else if trimmed.starts_with('/') {
        String::from(trimmed)
    } else {
        let mut out = String::from("/");
        out.push_str(trimmed);
        out
    }
}

impl RamFs {
    /// Create a new empty RAM filesystem.
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            open_handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    /// Add a file to the filesystem.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.files.lock().insert(normalize(path), content.to_vec());
    }

    /// Number of files.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Number of open handles.
    pub fn open_count(&self) -> usize {
        self.open_handles.lock().len()
    }

    fn is_dir(files: &BTreeMap<String, Vec<u8>>, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        let mut prefix = String::from(path);
        prefix.push('/');
        files
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(name, _)| name.starts_with(&prefix))
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFs {
    fn open(&self, path: &str) -> Result<FileHandle, FsError> {
        let path = normalize(path);
        let files = self.files.lock();
        if files.contains_key(&path) {
            let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
            self.open_handles.lock().insert(handle, path);
            Ok(handle)
        } else if Self::is_dir(&files, &path) {
            Err(FsError::IsDir)
        } else {
            Err(FsError::NotFound)
        }
    }

    fn read(&self, handle: FileHandle, buffer: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let handles = self.open_handles.lock();
        let path = handles.get(&handle).ok_or(FsError::InvalidHandle)?;
        let files = self.files.lock();
        let content = files.get(path).ok_or(FsError::NotFound)?;
        if offset >= content.len() {
            return Ok(0);
        }
        let end = core::cmp::min(offset + buffer.len(), content.len());
        let bytes_read = end - offset;
        buffer[..bytes_read].copy_from_slice(&content[offset..end]);
        Ok(bytes_read)
    }

    fn size(&self, handle: FileHandle) -> Result<usize, FsError> {
        let handles = self.open_handles.lock();
        let path = handles.get(&handle).ok_or(FsError::InvalidHandle)?;
        self.files
            .lock()
            .get(path)
            .map(|f| f.len())
            .ok_or(FsError::NotFound)
    }

    fn close(&self, handle: FileHandle) {
        self.open_handles.lock().remove(&handle);
    }

    fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        let path = normalize(path);
        let files = self.files.lock();
        if let Some(content) = files.get(&path) {
            return Ok(Metadata {
                kind: NodeKind::File,
                size: content.len() as u64,
            });
        }
        if Self::is_dir(&files, &path) {
            return Ok(Metadata {
                kind: NodeKind::Dir,
                size: 0,
            });
        }
        Err(FsError::NotFound)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = normalize(path);
        let files = self.files.lock();
        if files.contains_key(&path) {
            return Err(FsError::NotDir);
        }
        if !Self::is_dir(&files, &path) {
            return Err(FsError::NotFound);
        }
        let prefix = if path == "/" {
            path
        } else {
            let mut p = path;
            p.push('/');
            p
        };
        let names: BTreeSet<String> = files
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .filter_map(|(name, _)| name[prefix.len()..].split('/').next().map(String::from))
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::read_all;

    fn fs() -> RamFs {
        let fs = RamFs::new();
        fs.add_file("/bin/init", b"\x7fELF");
        fs.add_file("/bin/shell", b"sh");
        fs.add_file("/etc/motd", b"hello");
        fs
    }

    #[test]
    fn read_whole_file() {
        let fs = fs();
        assert_eq!(read_all(&fs, "/etc/motd").unwrap(), b"hello");
        assert_eq!(fs.open_count(), 0);
        assert_eq!(read_all(&fs, "/etc/none"), Err(FsError::NotFound));
    }

    #[test]
    fn directories_are_implied() {
        let fs = fs();
        assert_eq!(fs.stat("/bin").unwrap().kind, NodeKind::Dir);
        assert_eq!(fs.stat("/bin/").unwrap().kind, NodeKind::Dir);
        assert_eq!(fs.stat("/etc/motd").unwrap().size, 5);
        assert_eq!(fs.open("/bin"), Err(FsError::IsDir));
        assert_eq!(fs.list_dir("/").unwrap(), ["bin", "etc"]);
        assert_eq!(fs.list_dir("/bin").unwrap(), ["init", "shell"]);
        assert_eq!(fs.list_dir("/etc/motd"), Err(FsError::NotDir));
        assert_eq!(fs.list_dir("/nope"), Err(FsError::NotFound));
    }

    #[test]
    fn closed_handle_is_invalid() {
        let fs = fs();
        let h = fs.open("/bin/shell").unwrap();
        fs.close(h);
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(h, &mut buf, 0), Err(FsError::InvalidHandle));
    }
}
