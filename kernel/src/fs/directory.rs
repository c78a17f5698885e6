//! Directory tables
//!
//! A directory is a fixed-size table of name-to-header-sector entries,
//! stored as the payload of an ordinary file. The in-memory copy here is
//! fetched from and written back to that file whole. Names longer than
//! [`FILE_NAME_MAX_LEN`] are truncated on insertion and lookups compare
//! the truncated bytes exactly.

use crate::error::FsError;
use crate::fs::open_file::{OpenFile, ReadAt};

/// Capacity of every directory table.
pub const NUM_DIR_ENTRIES: usize = 100;

/// Longest stored file name, in bytes.
pub const FILE_NAME_MAX_LEN: usize = 9;

/// Serialized entry: in-use word, name bytes (NUL padded), header
/// sector, directory flag.
const ENTRY_SIZE: usize = 4 + (FILE_NAME_MAX_LEN + 1) + 4 + 4;

/// Serialized size of a whole directory table.
pub const DIRECTORY_FILE_SIZE: usize = ENTRY_SIZE * NUM_DIR_ENTRIES;

#[derive(Clone)]
struct DirectoryEntry {
    in_use: bool,
    name: [u8; FILE_NAME_MAX_LEN + 1],
    sector: i32,
    is_directory: bool,
}

impl DirectoryEntry {
    fn empty() -> Self {
        Self {
            in_use: false,
            name: [0; FILE_NAME_MAX_LEN + 1],
            sector: 0,
            is_directory: false,
        }
    }

    fn name_len(&self) -> usize {
        self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len())
    }

    fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len()]
    }
}

/// In-memory copy of one directory file.
pub struct Directory {
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            entries: vec![DirectoryEntry::empty(); NUM_DIR_ENTRIES],
        }
    }

    /// Load the table from its directory file.
    pub fn fetch_from(&mut self, file: &OpenFile) {
        let mut raw = vec![0u8; DIRECTORY_FILE_SIZE];
        let got = file.read_at(&mut raw, 0);
        assert_eq!(got, DIRECTORY_FILE_SIZE, "short directory file");
        for (entry, chunk) in self.entries.iter_mut().zip(raw.chunks_exact(ENTRY_SIZE)) {
            entry.in_use = read_i32(chunk, 0) != 0;
            entry.name.copy_from_slice(&chunk[4..4 + FILE_NAME_MAX_LEN + 1]);
            entry.sector = read_i32(chunk, 4 + FILE_NAME_MAX_LEN + 1);
            entry.is_directory = read_i32(chunk, 4 + FILE_NAME_MAX_LEN + 1 + 4) != 0;
        }
    }

    /// Store the table into its directory file.
    pub fn write_back(&self, file: &OpenFile) {
        let mut raw = vec![0u8; DIRECTORY_FILE_SIZE];
        for (entry, chunk) in self.entries.iter().zip(raw.chunks_exact_mut(ENTRY_SIZE)) {
            chunk[0..4].copy_from_slice(&i32::from(entry.in_use).to_ne_bytes());
            chunk[4..4 + FILE_NAME_MAX_LEN + 1].copy_from_slice(&entry.name);
            let at = 4 + FILE_NAME_MAX_LEN + 1;
            chunk[at..at + 4].copy_from_slice(&entry.sector.to_ne_bytes());
            chunk[at + 4..at + 8].copy_from_slice(&i32::from(entry.is_directory).to_ne_bytes());
        }
        let wrote = file.write_at(&raw, 0);
        assert_eq!(wrote, DIRECTORY_FILE_SIZE, "short directory write");
    }

    /// Header sector of the in-use entry named `name`, if any.
    pub fn find(&self, name: &str) -> Option<usize> {
        let probe = truncate(name);
        self.entries
            .iter()
            .find(|entry| entry.in_use && entry.name_bytes() == probe)
            .map(|entry| entry.sector as usize)
    }

    /// Claim a free slot for `name`; returns the slot index.
    pub fn add(&mut self, name: &str, sector: usize) -> Result<usize, FsError> {
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = self
            .entries
            .iter()
            .position(|entry| !entry.in_use)
            .ok_or(FsError::DirectoryFull)?;
        let entry = &mut self.entries[slot];
        entry.in_use = true;
        entry.name = [0; FILE_NAME_MAX_LEN + 1];
        entry.name[..truncate(name).len()].copy_from_slice(truncate(name));
        entry.sector = sector as i32;
        entry.is_directory = false;
        Ok(slot)
    }

    /// Release the entry named `name`.
    pub fn remove(&mut self, name: &str) -> Result<(), FsError> {
        let probe = truncate(name);
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.in_use && entry.name_bytes() == probe)
            .ok_or(FsError::NotFound)?;
        entry.in_use = false;
        Ok(())
    }

    /// Flag the entry at `slot` as naming a directory.
    pub fn mark_directory(&mut self, slot: usize) {
        self.entries[slot].is_directory = true;
    }

    /// True when only the `.` and `..` links remain in use.
    pub fn is_empty(&self) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.in_use)
            .all(|entry| matches!(entry.name_bytes(), b"." | b".."))
    }

    /// Names of the in-use entries, in table order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.in_use)
            .map(|entry| String::from_utf8_lossy(entry.name_bytes()).into_owned())
            .collect()
    }

    /// Log the table's contents.
    pub fn print(&self) {
        for (slot, entry) in self.entries.iter().enumerate().filter(|(_, e)| e.in_use) {
            log::info!(
                target: "fs",
                "entry {}: {:?} sector {}{}",
                slot,
                String::from_utf8_lossy(entry.name_bytes()),
                entry.sector,
                if entry.is_directory { " (dir)" } else { "" }
            );
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    &bytes[..bytes.len().min(FILE_NAME_MAX_LEN)]
}

fn read_i32(raw: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}
