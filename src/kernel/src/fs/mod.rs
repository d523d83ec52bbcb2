//! Filesystem interface used by the loader and the file syscalls.

use alloc::string::String;
use alloc::vec::Vec;

use kestrel_common::KernelError;

pub mod ramfs;

pub use ramfs::RamFs;

/// Error type for filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No such path.
    NotFound,
    /// The path names a file where a directory was expected.
    NotDir,
    /// The path names a directory where a file was expected.
    IsDir,
    /// The handle is not open.
    InvalidHandle,
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => KernelError::NotExists,
            FsError::NotDir => KernelError::NotDir,
            FsError::IsDir | FsError::InvalidHandle => KernelError::InvalidArg,
        }
    }
}

/// A handle to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileHandle(pub u32);

/// Kind of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum NodeKind {
    /// Regular file.
    File = 1,
    /// Directory.
    Dir = 2,
}

/// Result of [`FileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// File or directory.
    pub kind: NodeKind,
    /// Size in bytes, 0 for directories.
    pub size: u64,
}

impl Metadata {
    /// Size of the record copied out by `STAT`.
    pub const SIZE: usize = 16;

    /// Little-endian user layout: size, then kind.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&(self.kind as u64).to_le_bytes());
        out
    }
}

/// Trait for a filesystem.
pub trait FileSystem: Send + Sync {
    /// Open a file by path.
    fn open(&self, path: &str) -> Result<FileHandle, FsError>;

    /// Read from an open file.
    fn read(&self, handle: FileHandle, buffer: &mut [u8], offset: usize) -> Result<usize, FsError>;

    /// Get file size.
    fn size(&self, handle: FileHandle) -> Result<usize, FsError>;

    /// Close a file handle.
    fn close(&self, handle: FileHandle);

    /// Describe the node at `path`.
    fn stat(&self, path: &str) -> Result<Metadata, FsError>;

    /// Names of the direct children of the directory at `path`.
    fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError>;
}

/// Read a whole file into memory.
pub fn read_all(fs: &dyn FileSystem, path: &str) -> Result<Vec<u8>, FsError> {
    let handle = fs.open(path)?;
    let result = (|| {
        let mut data = alloc::vec![0u8; fs.size(handle)?];
        let mut done = 0;
        while done < data.len() {
            let n = fs.read(handle, &mut data[done..], done)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        data.truncate(done);
        Ok(data)
    })();
    fs.close(handle);
    result
}
