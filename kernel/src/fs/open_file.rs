//! Open files and synchronous disk access
//!
//! [`SynchDisk`] turns the raw device's request/completion protocol into
//! blocking sector reads and writes: one request outstanding at a time,
//! the caller parked on the completion semaphore until the device's
//! callback fires. [`OpenFile`] provides byte-granularity `read_at` /
//! `write_at` on top, translating offsets through the file's header.

use std::sync::Arc;

use crate::fs::file_header::FileHeader;
use crate::machine::disk::{Disk, SECTOR_SIZE};
use crate::sched::{Scheduler, Semaphore};

/// Positioned reads; the seam the program loader reads executables
/// through (disk files in the kernel proper, byte slices in tests).
pub trait ReadAt {
    /// Read into `buf` starting at `offset`; returns the bytes read.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;
}

impl ReadAt for &[u8] {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        if offset >= self.len() {
            return 0;
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        n
    }
}

/// Blocking, serialized access to the raw disk.
pub struct SynchDisk {
    disk: Disk,
    completion: Arc<Semaphore>,
    lock: Semaphore,
}

impl SynchDisk {
    /// A synchronous disk over a blank platter.
    pub fn new(sched: &Arc<Scheduler>) -> Arc<Self> {
        Self::build(sched, None)
    }

    /// A synchronous disk primed with a saved platter image.
    pub fn from_image(sched: &Arc<Scheduler>, image: Vec<u8>) -> Arc<Self> {
        Self::build(sched, Some(image))
    }

    fn build(sched: &Arc<Scheduler>, image: Option<Vec<u8>>) -> Arc<Self> {
        let completion = Arc::new(Semaphore::new("disk completion", Arc::clone(sched), 0));
        let signal = Arc::clone(&completion);
        let handler: Box<dyn Fn() + Send + Sync> = Box::new(move || signal.v());
        let disk = match image {
            Some(bytes) => Disk::from_image(bytes, handler),
            None => Disk::new(handler),
        };
        Arc::new(Self {
            disk,
            completion,
            lock: Semaphore::new("disk request", Arc::clone(sched), 1),
        })
    }

    /// Read one sector, blocking until the device completes.
    pub fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        self.lock.p();
        self.disk.read_request(sector, buf);
        self.completion.p();
        self.lock.v();
    }

    /// Write one sector, blocking until the device completes.
    pub fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        self.lock.p();
        self.disk.write_request(sector, buf);
        self.completion.p();
        self.lock.v();
    }

    /// Copy of the whole platter, for persisting across runs.
    pub fn snapshot(&self) -> Vec<u8> {
        self.disk.snapshot()
    }
}

/// A file opened by header sector.
#[derive(Clone)]
pub struct OpenFile {
    sector: usize,
    header: FileHeader,
    disk: Arc<SynchDisk>,
}

impl OpenFile {
    /// Open the file whose header lives at `sector`.
    pub fn new(sector: usize, disk: Arc<SynchDisk>) -> Self {
        let header = FileHeader::fetch_from(&disk, sector);
        Self {
            sector,
            header,
            disk,
        }
    }

    /// Sector holding this file's header.
    pub fn sector(&self) -> usize {
        self.sector
    }

    /// File length in bytes.
    pub fn length(&self) -> usize {
        self.header.file_length()
    }

    /// The in-memory copy of the file's header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Write `buf` at `offset`, stopping at end-of-file (files do not
    /// grow through writes). Partial edge sectors are read, modified and
    /// written back. Returns the bytes written.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let len = self.header.file_length();
        if offset >= len || buf.is_empty() {
            return 0;
        }
        let n = buf.len().min(len - offset);
        let first = offset / SECTOR_SIZE;
        let last = (offset + n - 1) / SECTOR_SIZE;
        let mut staging = vec![0u8; (last - first + 1) * SECTOR_SIZE];

        let first_aligned = offset % SECTOR_SIZE == 0;
        let last_aligned = (offset + n) % SECTOR_SIZE == 0;
        if !first_aligned {
            self.fetch_sector(first, &mut staging[..SECTOR_SIZE]);
        }
        if !last_aligned && last != first {
            let tail = (last - first) * SECTOR_SIZE;
            self.fetch_sector(last, &mut staging[tail..]);
        } else if !last_aligned && first_aligned {
            self.fetch_sector(first, &mut staging[..SECTOR_SIZE]);
        }

        let start = offset - first * SECTOR_SIZE;
        staging[start..start + n].copy_from_slice(&buf[..n]);

        for (chunk, file_sector) in staging.chunks_exact(SECTOR_SIZE).zip(first..=last) {
            let sector = self.map_sector(file_sector);
            let block: &[u8; SECTOR_SIZE] = chunk.try_into().expect("sector-sized chunk");
            self.disk.write_sector(sector, block);
        }
        n
    }

    fn fetch_sector(&self, file_sector: usize, into: &mut [u8]) {
        let sector = self.map_sector(file_sector);
        let mut block = [0u8; SECTOR_SIZE];
        self.disk.read_sector(sector, &mut block);
        into[..SECTOR_SIZE].copy_from_slice(&block);
    }

    fn map_sector(&self, file_sector: usize) -> usize {
        self.header
            .byte_to_sector(&self.disk, file_sector * SECTOR_SIZE)
            .expect("in-file offset has no mapped sector")
    }
}

impl ReadAt for OpenFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let len = self.header.file_length();
        if offset >= len || buf.is_empty() {
            return 0;
        }
        let n = buf.len().min(len - offset);
        let first = offset / SECTOR_SIZE;
        let last = (offset + n - 1) / SECTOR_SIZE;
        let mut staging = vec![0u8; (last - first + 1) * SECTOR_SIZE];
        for (chunk, file_sector) in staging.chunks_exact_mut(SECTOR_SIZE).zip(first..=last) {
            let sector = self.map_sector(file_sector);
            let block: &mut [u8; SECTOR_SIZE] = chunk.try_into().expect("sector-sized chunk");
            self.disk.read_sector(sector, block);
        }
        let start = offset - first * SECTOR_SIZE;
        buf[..n].copy_from_slice(&staging[start..start + n]);
        n
    }
}
