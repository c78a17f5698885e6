//! The disk filesystem
//!
//! A single-disk block store: a free-sector bitmap and a root directory,
//! each stored as an ordinary file whose header lives at a well-known
//! sector so the system can find them at boot. Directory hierarchy is
//! emulated with `.`/`..` symbolic-link headers rather than nested
//! records, and all name lookups are relative to a single mutable
//! current-directory cursor.
//!
//! Operations that modify the directory or the bitmap flush both back to
//! disk only when they succeed; on failure the in-memory copies are
//! simply discarded, leaving the disk untouched.

pub mod directory;
pub mod file_header;
pub mod open_file;

use std::sync::Arc;

use spin::Mutex;

use crate::error::{FsError, KernelResult};
use crate::machine::disk::NUM_SECTORS;
use crate::utils::bitmap::BitMap;
use crate::utils::div_round_up;

pub use directory::{Directory, DIRECTORY_FILE_SIZE, FILE_NAME_MAX_LEN, NUM_DIR_ENTRIES};
pub use file_header::{FileHeader, HeaderKind, MAX_FILE_SIZE, MAX_PER_SECTOR, NUM_DIRECT};
pub use open_file::{OpenFile, ReadAt, SynchDisk};

/// Sector of the free-map file's header.
pub const FREE_MAP_SECTOR: usize = 0;

/// Sector of the root directory file's header.
pub const DIRECTORY_SECTOR: usize = 1;

/// Serialized size of the free-sector map (whole words).
pub const FREE_MAP_FILE_SIZE: usize = div_round_up(NUM_SECTORS, 32) * 4;

/// The filesystem.
pub struct FileSystem {
    disk: Arc<SynchDisk>,
    free_map_file: OpenFile,
    /// The current-directory cursor all lookups are relative to.
    cursor: Mutex<OpenFile>,
}

impl FileSystem {
    /// Bring up the filesystem. With `format` the disk is assumed blank:
    /// the free map and root directory are laid down first, including the
    /// root's self-referential `.` and `..` links (the root is its own
    /// parent). Without it the two well-known files are simply opened.
    pub fn new(disk: Arc<SynchDisk>, format: bool) -> KernelResult<Self> {
        log::debug!(target: "fs", "initializing the file system (format: {})", format);
        if !format {
            return Ok(Self {
                free_map_file: OpenFile::new(FREE_MAP_SECTOR, Arc::clone(&disk)),
                cursor: Mutex::new(OpenFile::new(DIRECTORY_SECTOR, Arc::clone(&disk))),
                disk,
            });
        }

        let mut free_map = BitMap::new(NUM_SECTORS);
        let mut map_header = FileHeader::new(HeaderKind::Regular);
        let mut dir_header = FileHeader::new(HeaderKind::Directory);

        free_map.mark(FREE_MAP_SECTOR);
        free_map.mark(DIRECTORY_SECTOR);
        map_header.allocate(&mut free_map, &disk, FREE_MAP_FILE_SIZE)?;
        dir_header.allocate(&mut free_map, &disk, DIRECTORY_FILE_SIZE)?;

        // Headers must hit the disk before the files can be opened:
        // opening reads them back.
        map_header.write_back(&disk, FREE_MAP_SECTOR);
        dir_header.write_back(&disk, DIRECTORY_SECTOR);

        let fs = Self {
            free_map_file: OpenFile::new(FREE_MAP_SECTOR, Arc::clone(&disk)),
            cursor: Mutex::new(OpenFile::new(DIRECTORY_SECTOR, Arc::clone(&disk))),
            disk,
        };
        fs.flush_free_map(&free_map);
        Directory::new().write_back(&fs.cursor.lock());

        // The root is its own parent: both links resolve to it.
        fs.create(".", HeaderKind::SymLink, 0)?;
        fs.set_link_sector(".", DIRECTORY_SECTOR)?;
        fs.create("..", HeaderKind::SymLink, 0)?;
        fs.set_link_sector("..", DIRECTORY_SECTOR)?;
        Ok(fs)
    }

    /// Create `name` in the current directory: a header sector, data
    /// blocks for `initial_size` bytes, and a directory entry. SymLink
    /// headers allocate nothing; their link target is patched afterwards.
    pub fn create(&self, name: &str, kind: HeaderKind, initial_size: usize) -> KernelResult<()> {
        log::debug!(target: "fs", "creating {:?} ({:?}, {} bytes)", name, kind, initial_size);
        let cursor = self.cursor.lock().clone();
        let mut directory = Directory::new();
        directory.fetch_from(&cursor);
        if directory.find(name).is_some() {
            return Err(FsError::AlreadyExists.into());
        }
        let mut free_map = self.fetch_free_map();
        let sector = free_map.find().ok_or(FsError::DiskFull)?;
        let slot = directory.add(name, sector)?;

        let mut header = FileHeader::new(kind);
        match kind {
            HeaderKind::SymLink => {}
            HeaderKind::Regular | HeaderKind::Directory => {
                header.allocate(&mut free_map, &self.disk, initial_size)?;
            }
        }
        if kind == HeaderKind::Directory {
            directory.mark_directory(slot);
        }

        // Everything worked; flush all changes back to disk.
        header.write_back(&self.disk, sector);
        directory.write_back(&cursor);
        self.flush_free_map(&free_map);
        Ok(())
    }

    /// Open `name` from the current directory.
    pub fn open(&self, name: &str) -> Option<OpenFile> {
        log::debug!(target: "fs", "opening file {:?}", name);
        let cursor = self.cursor.lock().clone();
        let mut directory = Directory::new();
        directory.fetch_from(&cursor);
        directory
            .find(name)
            .map(|sector| OpenFile::new(sector, Arc::clone(&self.disk)))
    }

    /// Delete `name` from the current directory, releasing its data
    /// blocks and header sector. Does not recurse into directories.
    pub fn remove(&self, name: &str) -> KernelResult<()> {
        log::debug!(target: "fs", "removing {:?}", name);
        let cursor = self.cursor.lock().clone();
        let mut directory = Directory::new();
        directory.fetch_from(&cursor);
        let sector = directory.find(name).ok_or(FsError::NotFound)?;

        let mut header = FileHeader::fetch_from(&self.disk, sector);
        let mut free_map = self.fetch_free_map();
        match header.kind() {
            // A link owns no data; its first slot is a target pointer.
            HeaderKind::SymLink => {}
            HeaderKind::Regular | HeaderKind::Directory => {
                header.deallocate(&mut free_map, &self.disk, 0);
            }
        }
        free_map.clear(sector);
        directory.remove(name)?;

        self.flush_free_map(&free_map);
        directory.write_back(&cursor);
        Ok(())
    }

    /// Names in the current directory, in table order.
    pub fn list(&self) -> Vec<String> {
        let cursor = self.cursor.lock().clone();
        let mut directory = Directory::new();
        directory.fetch_from(&cursor);
        directory.names()
    }

    /// Log the free map and current directory contents.
    pub fn print(&self) {
        let free_map = self.fetch_free_map();
        log::info!(target: "fs", "free sectors: {}", free_map.num_clear());
        let cursor = self.cursor.lock().clone();
        let mut directory = Directory::new();
        directory.fetch_from(&cursor);
        directory.print();
    }

    /// Create a subdirectory: a DIRECTORY-typed file holding an empty
    /// table, then `.`/`..` links inside it pointing at the new and the
    /// current directory's headers.
    pub fn create_directory(&self, name: &str) -> KernelResult<()> {
        log::debug!(target: "fs", "creating directory {:?}", name);
        self.create(name, HeaderKind::Directory, DIRECTORY_FILE_SIZE)?;

        let parent_sector = self.cursor.lock().sector();
        let new_file = self.open(name).ok_or(FsError::NotFound)?;
        let new_sector = new_file.sector();
        Directory::new().write_back(&new_file);

        // Descend, lay the links, come back.
        let saved = self.cursor.lock().clone();
        *self.cursor.lock() = new_file;
        let result = (|| -> KernelResult<()> {
            self.create(".", HeaderKind::SymLink, 0)?;
            self.set_link_sector(".", new_sector)?;
            self.create("..", HeaderKind::SymLink, 0)?;
            self.set_link_sector("..", parent_sector)?;
            Ok(())
        })();
        *self.cursor.lock() = saved;
        result
    }

    /// Delete an empty subdirectory. Refuses while entries other than
    /// the `.`/`..` links are in use.
    pub fn delete_directory(&self, name: &str) -> KernelResult<()> {
        let cursor = self.cursor.lock().clone();
        let mut directory = Directory::new();
        directory.fetch_from(&cursor);
        let sector = directory.find(name).ok_or(FsError::NotFound)?;

        let header = FileHeader::fetch_from(&self.disk, sector);
        if header.kind() != HeaderKind::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let target_file = OpenFile::new(sector, Arc::clone(&self.disk));
        let mut target = Directory::new();
        target.fetch_from(&target_file);
        if !target.is_empty() {
            log::warn!(target: "fs", "cannot delete {:?}: directory not empty", name);
            return Err(FsError::DirectoryNotEmpty.into());
        }

        // Free the link headers the directory still holds, then the
        // directory file itself, as an ordinary remove.
        let mut free_map = self.fetch_free_map();
        let mut header = header;
        for link in [".", ".."] {
            if let Some(link_sector) = target.find(link) {
                free_map.clear(link_sector);
            }
        }
        header.deallocate(&mut free_map, &self.disk, 0);
        free_map.clear(sector);
        directory.remove(name)?;

        self.flush_free_map(&free_map);
        directory.write_back(&cursor);
        Ok(())
    }

    /// Move the current-directory cursor along a `/`-separated path.
    /// Absolute paths restart at the root header; `.` and `..` resolve
    /// through their link headers; every other component must name a
    /// DIRECTORY-typed entry. On failure the cursor is left where it was.
    pub fn change_directory(&self, path: &str) -> KernelResult<()> {
        log::debug!(target: "fs", "changing directory to {:?}", path);
        let mut cursor = if path.starts_with('/') {
            OpenFile::new(DIRECTORY_SECTOR, Arc::clone(&self.disk))
        } else {
            self.cursor.lock().clone()
        };

        for component in path.split('/').filter(|c| !c.is_empty()) {
            let mut directory = Directory::new();
            directory.fetch_from(&cursor);
            let sector = directory.find(component).ok_or(FsError::InvalidPath)?;
            let header = FileHeader::fetch_from(&self.disk, sector);
            let target = match (component, header.kind()) {
                ("." | "..", HeaderKind::SymLink) => header.link_sector(),
                (_, HeaderKind::Directory) => sector,
                _ => return Err(FsError::NotADirectory.into()),
            };
            cursor = OpenFile::new(target, Arc::clone(&self.disk));
        }

        *self.cursor.lock() = cursor;
        Ok(())
    }

    /// Header sector of the current directory (useful to observers and
    /// tests; the root is [`DIRECTORY_SECTOR`]).
    pub fn current_directory_sector(&self) -> usize {
        self.cursor.lock().sector()
    }

    fn set_link_sector(&self, name: &str, target: usize) -> KernelResult<()> {
        let cursor = self.cursor.lock().clone();
        let mut directory = Directory::new();
        directory.fetch_from(&cursor);
        let sector = directory.find(name).ok_or(FsError::NotFound)?;
        let mut header = FileHeader::fetch_from(&self.disk, sector);
        header.set_link_sector(target);
        header.write_back(&self.disk, sector);
        Ok(())
    }

    fn fetch_free_map(&self) -> BitMap {
        let mut raw = vec![0u8; FREE_MAP_FILE_SIZE];
        let got = self.free_map_file.read_at(&mut raw, 0);
        assert_eq!(got, FREE_MAP_FILE_SIZE, "short free map file");
        BitMap::from_bytes(&raw, NUM_SECTORS)
    }

    fn flush_free_map(&self, free_map: &BitMap) {
        let wrote = self.free_map_file.write_at(&free_map.as_bytes(), 0);
        assert_eq!(wrote, FREE_MAP_FILE_SIZE, "short free map write");
    }

    /// Number of free sectors (observability for tests and tools).
    pub fn free_sectors(&self) -> usize {
        self.fetch_free_map().num_clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::sched::Scheduler;

    fn fresh_fs() -> FileSystem {
        let machine = Arc::new(Machine::new());
        let sched = Scheduler::new(machine);
        let disk = SynchDisk::new(&sched);
        FileSystem::new(disk, true).expect("format")
    }

    #[test]
    fn test_format_lays_down_root_links() {
        let fs = fresh_fs();
        let names = fs.list();
        assert_eq!(names, vec![".".to_owned(), "..".to_owned()]);
        assert_eq!(fs.current_directory_sector(), DIRECTORY_SECTOR);
    }

    #[test]
    fn test_create_open_remove_round_trip() {
        let fs = fresh_fs();
        let free_before = fs.free_sectors();
        fs.create("a", HeaderKind::Regular, 0).expect("create");
        assert!(fs.list().contains(&"a".to_owned()));
        let file = fs.open("a").expect("open");
        assert_eq!(file.length(), 0);
        assert_eq!(file.header().kind(), HeaderKind::Regular);
        fs.remove("a").expect("remove");
        assert!(!fs.list().contains(&"a".to_owned()));
        assert!(fs.open("a").is_none());
        assert_eq!(fs.free_sectors(), free_before);
    }

    #[test]
    fn test_create_duplicate_fails() {
        let fs = fresh_fs();
        fs.create("dup", HeaderKind::Regular, 10).expect("create");
        assert!(matches!(
            fs.create("dup", HeaderKind::Regular, 0),
            Err(crate::error::KernelError::Fs(FsError::AlreadyExists))
        ));
    }

    #[test]
    fn test_file_content_round_trip() {
        let fs = fresh_fs();
        fs.create("data", HeaderKind::Regular, 1000).expect("create");
        let file = fs.open("data").expect("open");
        let payload: Vec<u8> = (0..1000u32).map(|n| (n % 251) as u8).collect();
        assert_eq!(file.write_at(&payload, 0), 1000);
        let mut back = vec![0u8; 1000];
        assert_eq!(file.read_at(&mut back, 0), 1000);
        assert_eq!(back, payload);
        // Unaligned interior rewrite.
        assert_eq!(file.write_at(b"hello", 123), 5);
        let mut tail = vec![0u8; 10];
        assert_eq!(file.read_at(&mut tail, 120), 10);
        assert_eq!(&tail[3..8], b"hello");
    }

    #[test]
    fn test_writes_do_not_grow_files() {
        let fs = fresh_fs();
        fs.create("short", HeaderKind::Regular, 10).expect("create");
        let file = fs.open("short").expect("open");
        assert_eq!(file.write_at(&[1u8; 64], 0), 10);
        assert_eq!(file.write_at(&[1u8; 4], 10), 0);
    }

    #[test]
    fn test_maximal_file_fills_disk() {
        let fs = fresh_fs();
        fs.create("big", HeaderKind::Regular, MAX_FILE_SIZE)
            .expect("maximal file");
        // The platter now cannot hold even a one-byte file.
        assert!(matches!(
            fs.create("tiny", HeaderKind::Regular, 1),
            Err(crate::error::KernelError::Fs(FsError::DiskFull))
        ));
        let free_before = fs.free_sectors();
        fs.remove("big").expect("remove");
        assert!(fs.free_sectors() > free_before);
        fs.create("tiny", HeaderKind::Regular, 1).expect("create");
    }

    #[test]
    fn test_oversized_file_rejected() {
        let fs = fresh_fs();
        assert!(matches!(
            fs.create("huge", HeaderKind::Regular, MAX_FILE_SIZE + 1),
            Err(crate::error::KernelError::Fs(FsError::FileTooLarge { .. }))
        ));
    }

    #[test]
    fn test_subdirectory_create_and_navigate() {
        let fs = fresh_fs();
        fs.create_directory("d").expect("mkdir");
        fs.change_directory("d").expect("cd");
        assert_eq!(fs.list(), vec![".".to_owned(), "..".to_owned()]);
        fs.create("f", HeaderKind::Regular, 0).expect("create");
        fs.change_directory("..").expect("cd ..");
        assert_eq!(fs.current_directory_sector(), DIRECTORY_SECTOR);
        assert!(fs.list().contains(&"d".to_owned()));
        // The file lives in d, not here.
        assert!(fs.open("f").is_none());
        fs.change_directory("d").expect("cd");
        assert!(fs.open("f").is_some());
    }

    #[test]
    fn test_delete_directory_refuses_nonempty() {
        let fs = fresh_fs();
        fs.create_directory("d").expect("mkdir");
        fs.change_directory("d").expect("cd");
        fs.create("f", HeaderKind::Regular, 0).expect("create");
        fs.change_directory("..").expect("cd ..");
        assert!(matches!(
            fs.delete_directory("d"),
            Err(crate::error::KernelError::Fs(FsError::DirectoryNotEmpty))
        ));
        // d and its content survive.
        fs.change_directory("d").expect("cd");
        assert!(fs.open("f").is_some());
        fs.change_directory("..").expect("cd ..");
        fs.change_directory("d").expect("cd again");
        fs.remove("f").expect("remove f");
        fs.change_directory("..").expect("cd ..");
        fs.delete_directory("d").expect("now deletable");
        assert!(!fs.list().contains(&"d".to_owned()));
    }

    #[test]
    fn test_delete_directory_restores_free_space() {
        let fs = fresh_fs();
        let free_before = fs.free_sectors();
        fs.create_directory("d").expect("mkdir");
        fs.delete_directory("d").expect("rmdir");
        assert_eq!(fs.free_sectors(), free_before);
    }

    #[test]
    fn test_change_directory_dotdot_from_root_stays_at_root() {
        let fs = fresh_fs();
        fs.change_directory("..").expect("cd ..");
        assert_eq!(fs.current_directory_sector(), DIRECTORY_SECTOR);
    }

    #[test]
    fn test_change_directory_paths() {
        let fs = fresh_fs();
        fs.create_directory("a").expect("mkdir a");
        fs.change_directory("a").expect("cd a");
        fs.create_directory("b").expect("mkdir b");
        fs.change_directory("/").expect("cd /");
        assert_eq!(fs.current_directory_sector(), DIRECTORY_SECTOR);
        fs.change_directory("a/b").expect("cd a/b");
        fs.change_directory("../..").expect("back to root");
        assert_eq!(fs.current_directory_sector(), DIRECTORY_SECTOR);
        // Trailing and duplicate slashes are harmless.
        fs.change_directory("a//b/").expect("cd a//b/");
        // Failed traversal leaves the cursor alone.
        let here = fs.current_directory_sector();
        assert!(fs.change_directory("/missing/x").is_err());
        assert_eq!(fs.current_directory_sector(), here);
    }

    #[test]
    fn test_change_directory_rejects_files() {
        let fs = fresh_fs();
        fs.create("plain", HeaderKind::Regular, 0).expect("create");
        assert!(matches!(
            fs.change_directory("plain"),
            Err(crate::error::KernelError::Fs(FsError::NotADirectory))
        ));
    }
}
