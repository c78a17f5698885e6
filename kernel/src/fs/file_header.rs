//! On-disk file headers
//!
//! The header is the filesystem's inode: sized to exactly one sector, it
//! records the file's length and a two-level map from file offset to
//! disk sector. Each entry of `data_sectors` names an *index sector*
//! whose content is an array of data-sector numbers, so capacity is
//! `NUM_DIRECT * MAX_PER_SECTOR` data sectors. Entry value 0 means
//! "unallocated" — sector 0 holds the free map's header and can never
//! belong to a file.
//!
//! Symbolic-link headers (the `.`/`..` machinery) reuse the first table
//! entry for the target directory's header sector and own no data or
//! index sectors at all.

use std::sync::Arc;

use crate::error::FsError;
use crate::fs::open_file::SynchDisk;
use crate::machine::disk::SECTOR_SIZE;
use crate::utils::bitmap::BitMap;
use crate::utils::div_round_up;

/// Index-sector slots in a header (fills the sector: 3 words of
/// metadata, the rest pointers).
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 3 * 4) / 4;

/// Data-sector pointers per index sector.
pub const MAX_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Largest file the two-level map can address.
pub const MAX_FILE_SIZE: usize = NUM_DIRECT * MAX_PER_SECTOR * SECTOR_SIZE;

/// What a header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Ordinary file data.
    Regular,
    /// A directory's serialized entry table.
    Directory,
    /// A `.`/`..` link; the first table slot is the target header sector.
    SymLink,
}

impl HeaderKind {
    fn to_i32(self) -> i32 {
        match self {
            HeaderKind::Regular => 0,
            HeaderKind::Directory => 1,
            HeaderKind::SymLink => 2,
        }
    }

    fn from_i32(value: i32) -> Self {
        match value {
            0 => HeaderKind::Regular,
            1 => HeaderKind::Directory,
            2 => HeaderKind::SymLink,
            other => panic!("corrupt header kind {}", other),
        }
    }
}

/// The on-disk header record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    num_bytes: usize,
    num_sectors: usize,
    kind: HeaderKind,
    data_sectors: [i32; NUM_DIRECT],
}

impl FileHeader {
    /// A fresh header describing an empty file of the given kind.
    pub fn new(kind: HeaderKind) -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            kind,
            data_sectors: [0; NUM_DIRECT],
        }
    }

    pub fn file_length(&self) -> usize {
        self.num_bytes
    }

    pub fn kind(&self) -> HeaderKind {
        self.kind
    }

    /// Link target of a [`HeaderKind::SymLink`] header.
    pub fn link_sector(&self) -> usize {
        self.data_sectors[0] as usize
    }

    pub fn set_link_sector(&mut self, sector: usize) {
        self.data_sectors[0] = sector as i32;
    }

    /// Grow the file by `size` bytes, claiming data sectors (and any
    /// index sectors the two-level map newly needs) from `free_map`.
    ///
    /// Fails without touching the header, the map or the disk when the
    /// result would exceed [`MAX_FILE_SIZE`] or the map cannot supply
    /// every needed sector. Growing by 0 succeeds and still claims the
    /// first index sector for a file that had none, so a newly created
    /// empty file is addressable.
    pub fn allocate(
        &mut self,
        free_map: &mut BitMap,
        disk: &Arc<SynchDisk>,
        size: usize,
    ) -> Result<(), FsError> {
        let new_bytes = self.num_bytes + size;
        if new_bytes > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge {
                requested: new_bytes,
                max: MAX_FILE_SIZE,
            });
        }
        let total_data = div_round_up(new_bytes, SECTOR_SIZE);
        let new_data = total_data - self.num_sectors;
        let held = self.held_index_sectors();
        let needed = div_round_up(total_data, MAX_PER_SECTOR).max(1);
        let new_indices = needed.saturating_sub(held);
        if free_map.num_clear() < new_data + new_indices {
            return Err(FsError::DiskFull);
        }

        // The map has room for everything below; `find` cannot fail.
        if held == 0 {
            let sector = free_map.find().expect("free map changed underfoot");
            self.data_sectors[0] = sector as i32;
            write_index_sector(disk, sector, &[0; MAX_PER_SECTOR]);
        }

        let mut current: Option<(usize, [i32; MAX_PER_SECTOR])> = None;
        for pos in self.num_sectors..total_data {
            let index = pos / MAX_PER_SECTOR;
            let needs_switch = match current {
                Some((loaded, _)) => loaded != index,
                None => true,
            };
            if needs_switch {
                if let Some((loaded, block)) = current.take() {
                    write_index_sector(disk, self.data_sectors[loaded] as usize, &block);
                }
                let block = if self.data_sectors[index] == 0 {
                    let sector = free_map.find().expect("free map changed underfoot");
                    self.data_sectors[index] = sector as i32;
                    [0; MAX_PER_SECTOR]
                } else {
                    read_index_sector(disk, self.data_sectors[index] as usize)
                };
                current = Some((index, block));
            }
            if let Some((_, ref mut block)) = current {
                let sector = free_map.find().expect("free map changed underfoot");
                block[pos % MAX_PER_SECTOR] = sector as i32;
            }
        }
        if let Some((loaded, block)) = current {
            write_index_sector(disk, self.data_sectors[loaded] as usize, &block);
        }

        self.num_sectors = total_data;
        self.num_bytes = new_bytes;
        Ok(())
    }

    /// Release every data sector holding bytes at or after
    /// `reserve_bytes`, plus each index sector left entirely unused
    /// (all of them when the file shrinks to nothing). The header's own
    /// sector is the caller's to release.
    pub fn deallocate(
        &mut self,
        free_map: &mut BitMap,
        disk: &Arc<SynchDisk>,
        reserve_bytes: usize,
    ) {
        let keep_sectors = div_round_up(reserve_bytes, SECTOR_SIZE);
        let mut current: Option<(usize, [i32; MAX_PER_SECTOR])> = None;
        for pos in keep_sectors..self.num_sectors {
            let index = pos / MAX_PER_SECTOR;
            let reload = !matches!(current, Some((loaded, _)) if loaded == index);
            if reload {
                current = Some((index, read_index_sector(disk, self.data_sectors[index] as usize)));
            }
            if let Some((_, ref block)) = current {
                free_map.clear(block[pos % MAX_PER_SECTOR] as usize);
            }
        }

        let keep_indices = if reserve_bytes == 0 {
            0
        } else {
            div_round_up(keep_sectors, MAX_PER_SECTOR).max(1)
        };
        for index in keep_indices..self.held_index_sectors() {
            free_map.clear(self.data_sectors[index] as usize);
            self.data_sectors[index] = 0;
        }

        self.num_sectors = keep_sectors;
        self.num_bytes = reserve_bytes;
    }

    /// The disk sector storing the byte at `offset`, or `None` past the
    /// file's data.
    pub fn byte_to_sector(&self, disk: &Arc<SynchDisk>, offset: usize) -> Option<usize> {
        if offset > self.num_bytes {
            return None;
        }
        let pos = offset / SECTOR_SIZE;
        if pos >= self.num_sectors {
            return None;
        }
        let block = read_index_sector(disk, self.data_sectors[pos / MAX_PER_SECTOR] as usize);
        Some(block[pos % MAX_PER_SECTOR] as usize)
    }

    /// Load a header from its sector.
    pub fn fetch_from(disk: &Arc<SynchDisk>, sector: usize) -> Self {
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(sector, &mut raw);
        let mut data_sectors = [0i32; NUM_DIRECT];
        for (slot, chunk) in data_sectors.iter_mut().zip(raw[12..].chunks_exact(4)) {
            *slot = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            num_bytes: read_i32(&raw, 0) as usize,
            num_sectors: read_i32(&raw, 4) as usize,
            kind: HeaderKind::from_i32(read_i32(&raw, 8)),
            data_sectors,
        }
    }

    /// Store the header to its sector.
    pub fn write_back(&self, disk: &Arc<SynchDisk>, sector: usize) {
        let mut raw = [0u8; SECTOR_SIZE];
        raw[0..4].copy_from_slice(&(self.num_bytes as i32).to_ne_bytes());
        raw[4..8].copy_from_slice(&(self.num_sectors as i32).to_ne_bytes());
        raw[8..12].copy_from_slice(&self.kind.to_i32().to_ne_bytes());
        for (slot, chunk) in self.data_sectors.iter().zip(raw[12..].chunks_exact_mut(4)) {
            chunk.copy_from_slice(&slot.to_ne_bytes());
        }
        disk.write_sector(sector, &raw);
    }

    /// Index sectors this header currently owns.
    fn held_index_sectors(&self) -> usize {
        if self.data_sectors[0] == 0 {
            0
        } else {
            div_round_up(self.num_sectors, MAX_PER_SECTOR).max(1)
        }
    }
}

fn read_i32(raw: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn read_index_sector(disk: &Arc<SynchDisk>, sector: usize) -> [i32; MAX_PER_SECTOR] {
    let mut raw = [0u8; SECTOR_SIZE];
    disk.read_sector(sector, &mut raw);
    let mut block = [0i32; MAX_PER_SECTOR];
    for (slot, chunk) in block.iter_mut().zip(raw.chunks_exact(4)) {
        *slot = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    block
}

fn write_index_sector(disk: &Arc<SynchDisk>, sector: usize, block: &[i32; MAX_PER_SECTOR]) {
    let mut raw = [0u8; SECTOR_SIZE];
    for (slot, chunk) in block.iter().zip(raw.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&slot.to_ne_bytes());
    }
    disk.write_sector(sector, &raw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::machine::NUM_SECTORS;
    use crate::sched::Scheduler;

    fn disk() -> Arc<SynchDisk> {
        let machine = Arc::new(Machine::new());
        let sched = Scheduler::new(machine);
        SynchDisk::new(&sched)
    }

    fn fresh_map() -> BitMap {
        let mut map = BitMap::new(NUM_SECTORS);
        // Sectors the filesystem always reserves.
        map.mark(0);
        map.mark(1);
        map
    }

    #[test]
    fn test_allocate_then_deallocate_restores_map() {
        let disk = disk();
        let mut map = fresh_map();
        let clear_before = map.num_clear();
        let mut header = FileHeader::new(HeaderKind::Regular);
        header.allocate(&mut map, &disk, 5000).expect("allocate");
        assert_eq!(header.file_length(), 5000);
        assert!(map.num_clear() < clear_before);
        header.deallocate(&mut map, &disk, 0);
        assert_eq!(map.num_clear(), clear_before);
        assert_eq!(header.file_length(), 0);
    }

    #[test]
    fn test_allocate_zero_claims_one_index_sector() {
        let disk = disk();
        let mut map = fresh_map();
        let clear_before = map.num_clear();
        let mut header = FileHeader::new(HeaderKind::Regular);
        header.allocate(&mut map, &disk, 0).expect("allocate");
        assert_eq!(map.num_clear(), clear_before - 1);
        assert_eq!(header.file_length(), 0);
        // Empty but addressable; a later deallocate releases the index.
        header.deallocate(&mut map, &disk, 0);
        assert_eq!(map.num_clear(), clear_before);
    }

    #[test]
    fn test_growth_reuses_partial_index_sector() {
        let disk = disk();
        let mut map = fresh_map();
        let mut header = FileHeader::new(HeaderKind::Regular);
        header.allocate(&mut map, &disk, SECTOR_SIZE * 3).expect("allocate");
        let mid = map.num_clear();
        header.allocate(&mut map, &disk, SECTOR_SIZE * 2).expect("grow");
        // Two more data sectors, same index sector.
        assert_eq!(map.num_clear(), mid - 2);
        assert_eq!(header.file_length(), SECTOR_SIZE * 5);
    }

    #[test]
    fn test_max_file_size_boundary() {
        let disk = disk();
        let mut map = fresh_map();
        let mut header = FileHeader::new(HeaderKind::Regular);
        assert_eq!(
            header.allocate(&mut map, &disk, MAX_FILE_SIZE + 1),
            Err(FsError::FileTooLarge {
                requested: MAX_FILE_SIZE + 1,
                max: MAX_FILE_SIZE,
            })
        );
        header.allocate(&mut map, &disk, MAX_FILE_SIZE).expect("maximal file");
        assert_eq!(header.file_length(), MAX_FILE_SIZE);
    }

    #[test]
    fn test_allocate_fails_cleanly_when_map_short() {
        let disk = disk();
        let mut map = BitMap::new(8);
        map.mark(0);
        map.mark(1);
        let mut header = FileHeader::new(HeaderKind::Regular);
        // 6 free; needs 8 data + 1 index.
        assert_eq!(
            header.allocate(&mut map, &disk, SECTOR_SIZE * 8),
            Err(FsError::DiskFull)
        );
        assert_eq!(map.num_clear(), 6);
        assert_eq!(header.file_length(), 0);
    }

    #[test]
    fn test_byte_to_sector_injective_and_bounded() {
        let disk = disk();
        let mut map = fresh_map();
        let mut header = FileHeader::new(HeaderKind::Regular);
        let bytes = SECTOR_SIZE * (MAX_PER_SECTOR + 3);
        header.allocate(&mut map, &disk, bytes).expect("allocate");
        let mut seen = std::collections::BTreeSet::new();
        for pos in 0..MAX_PER_SECTOR + 3 {
            let sector = header
                .byte_to_sector(&disk, pos * SECTOR_SIZE)
                .expect("mapped");
            assert!(seen.insert(sector), "sector {} mapped twice", sector);
        }
        assert_eq!(header.byte_to_sector(&disk, bytes + 1), None);
    }

    #[test]
    fn test_write_back_fetch_round_trip() {
        let disk = disk();
        let mut map = fresh_map();
        let mut header = FileHeader::new(HeaderKind::Directory);
        header.allocate(&mut map, &disk, 300).expect("allocate");
        header.write_back(&disk, 7);
        let copy = FileHeader::fetch_from(&disk, 7);
        assert_eq!(copy, header);
    }

    #[test]
    fn test_deallocate_keeps_reserved_prefix() {
        let disk = disk();
        let mut map = fresh_map();
        let mut header = FileHeader::new(HeaderKind::Regular);
        header.allocate(&mut map, &disk, SECTOR_SIZE * 6).expect("allocate");
        let first = header.byte_to_sector(&disk, 0).expect("mapped");
        header.deallocate(&mut map, &disk, SECTOR_SIZE * 2);
        assert_eq!(header.file_length(), SECTOR_SIZE * 2);
        assert_eq!(header.byte_to_sector(&disk, 0), Some(first));
        assert_eq!(header.byte_to_sector(&disk, SECTOR_SIZE * 3), None);
    }
}
