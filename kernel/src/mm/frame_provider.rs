//! Physical frame accounting
//!
//! Tracks which frames of the simulated RAM are free. Allocation and
//! release serialize on one lock; allocation hands out RAII guards so a
//! frame cannot outlive its owner by accident — dropping the guard is
//! the release.

use std::sync::Arc;

use spin::Mutex;

use crate::machine::NUM_PHYS_PAGES;
use crate::utils::bitmap::BitMap;

/// Allocator for physical page frames.
pub struct FrameProvider {
    map: Mutex<BitMap>,
}

impl FrameProvider {
    /// A provider covering all frames of the machine.
    pub fn new() -> Arc<Self> {
        Self::with_frames(NUM_PHYS_PAGES)
    }

    /// A provider covering `num_frames` frames.
    pub fn with_frames(num_frames: usize) -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(BitMap::new(num_frames)),
        })
    }

    /// Claim any free frame. Returns `None` when all frames are busy
    /// rather than blocking.
    pub fn get_empty_frame(self: &Arc<Self>) -> Option<FrameGuard> {
        let frame = self.map.lock().find()?;
        log::trace!(target: "addr", "frame {} allocated", frame);
        Some(FrameGuard {
            frame,
            provider: Arc::clone(self),
        })
    }

    /// Number of frames currently free.
    pub fn num_avail_frames(&self) -> usize {
        self.map.lock().num_clear()
    }

    fn release_frame(&self, frame: usize) {
        let mut map = self.map.lock();
        assert!(map.test(frame), "releasing frame {} that is not busy", frame);
        map.clear(frame);
        log::trace!(target: "addr", "frame {} released", frame);
    }
}

/// Owned claim on one physical frame; releases on drop.
pub struct FrameGuard {
    frame: usize,
    provider: Arc<FrameProvider>,
}

impl FrameGuard {
    /// The frame number this guard owns.
    pub fn frame(&self) -> usize {
        self.frame
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.provider.release_frame(self.frame);
    }
}
