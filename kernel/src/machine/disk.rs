//! Simulated raw disk
//!
//! A single-platter device addressed by sector number. The simulation
//! keeps the whole platter as an in-memory image and completes every
//! request immediately, but requests still finish through the completion
//! handler so the synchronous layer above is written against the real
//! device contract (request, then wait for the interrupt).

use spin::Mutex;

/// Bytes per disk sector, the unit of disk I/O.
pub const SECTOR_SIZE: usize = 128;

/// Total sectors on the simulated disk. Sized so that a freshly
/// formatted filesystem holds exactly one maximal file (its data, index
/// and header sectors exhaust the free space).
pub const NUM_SECTORS: usize = 983;

/// Called when a pending request completes.
pub type CompletionHandler = Box<dyn Fn() + Send + Sync>;

/// The raw disk device.
pub struct Disk {
    image: Mutex<Box<[u8]>>,
    handler: CompletionHandler,
}

impl Disk {
    /// A blank (zero-filled) disk.
    pub fn new(handler: CompletionHandler) -> Self {
        Self {
            image: Mutex::new(vec![0u8; NUM_SECTORS * SECTOR_SIZE].into_boxed_slice()),
            handler,
        }
    }

    /// A disk primed with an existing image, e.g. one saved by
    /// [`Disk::snapshot`]. The image must be exactly platter-sized.
    pub fn from_image(image: Vec<u8>, handler: CompletionHandler) -> Self {
        assert_eq!(image.len(), NUM_SECTORS * SECTOR_SIZE, "bad disk image size");
        Self {
            image: Mutex::new(image.into_boxed_slice()),
            handler,
        }
    }

    /// Copy of the whole platter, for persisting across runs.
    pub fn snapshot(&self) -> Vec<u8> {
        self.image.lock().to_vec()
    }

    /// Schedule a sector read into `buf`; fires the completion handler.
    pub fn read_request(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < NUM_SECTORS, "sector {} out of range", sector);
        {
            let image = self.image.lock();
            let start = sector * SECTOR_SIZE;
            buf.copy_from_slice(&image[start..start + SECTOR_SIZE]);
        }
        log::trace!(target: "disk", "read sector {}", sector);
        (self.handler)();
    }

    /// Schedule a sector write from `buf`; fires the completion handler.
    pub fn write_request(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < NUM_SECTORS, "sector {} out of range", sector);
        {
            let mut image = self.image.lock();
            let start = sector * SECTOR_SIZE;
            image[start..start + SECTOR_SIZE].copy_from_slice(buf);
        }
        log::trace!(target: "disk", "write sector {}", sector);
        (self.handler)();
    }
}
