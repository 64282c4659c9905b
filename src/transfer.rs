//! Archive packing and extraction for moving bytes across the container boundary.
//!
//! The container engine only accepts and returns tar streams, so everything
//! the session sends (code, inputs) or fetches (outputs) passes through this
//! module. It knows nothing about tests or containers.
//!
//! # Example
//!
//! ```
//! use testjail::transfer::{extract, pack, Entry};
//!
//! let archive = pack([Entry::new("hello.txt", b"hi".to_vec())])?;
//! assert_eq!(extract(archive.as_slice(), "hello.txt")?, b"hi");
//! # Ok::<(), testjail::transfer::TransferError>(())
//! ```

use std::io::Read;

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors produced while packing or extracting archives.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The archive did not contain an entry with the requested name.
    #[error("Entry not found in archive: {0}")]
    EntryNotFound(String),

    /// The archive stream could not be read or written.
    #[error("Archive IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A named payload to place in an archive.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Path of the entry inside the archive (relative, `/`-separated).
    pub name: String,
    /// File contents.
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Incremental archive builder.
///
/// Entries are appended one at a time; [`finish`](Self::finish) writes the
/// trailer and consumes the packer, so an archive is finalized exactly once.
pub struct Packer {
    builder: tar::Builder<Vec<u8>>,
    mtime: u64,
    entries: usize,
}

impl Packer {
    pub fn new() -> Self {
        let mtime = chrono::Utc::now().timestamp().max(0) as u64;
        Self {
            builder: tar::Builder::new(Vec::new()),
            mtime,
            entries: 0,
        }
    }

    /// Appends a regular file entry.
    pub fn append(&mut self, name: &str, data: &[u8]) -> TransferResult<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(self.mtime);
        self.builder.append_data(&mut header, name, data)?;
        self.entries += 1;
        Ok(())
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Writes the archive trailer and returns the finished bytes.
    pub fn finish(self) -> TransferResult<Vec<u8>> {
        Ok(self.builder.into_inner()?)
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs the given entries, in order, into a single archive.
pub fn pack<I>(entries: I) -> TransferResult<Vec<u8>>
where
    I: IntoIterator<Item = Entry>,
{
    let mut packer = Packer::new();
    for entry in entries {
        packer.append(&entry.name, &entry.data)?;
    }
    packer.finish()
}

/// Returns the contents of the first entry whose path equals `name`.
pub fn extract<R: Read>(reader: R, name: &str) -> TransferResult<Vec<u8>> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let matches = {
            let path = entry.path()?;
            path.to_str() == Some(name)
        };
        if matches {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            return Ok(data);
        }
    }
    Err(TransferError::EntryNotFound(name.to_string()))
}

/// Lists the entry paths of an archive, in order.
pub fn entry_names<R: Read>(reader: R) -> TransferResult<Vec<String>> {
    let mut archive = tar::Archive::new(reader);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
