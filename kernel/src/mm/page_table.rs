//! Page-table entries
//!
//! A linear table of virtual-to-physical mappings, shared between an
//! address space and the machine that has it installed. The machine's
//! translation path mutates the USE/DIRTY bits, so the table sits behind
//! a lock and is passed by reference-counted handle.

use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// Per-entry status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        /// The mapping is usable.
        const VALID = 1 << 0;
        /// The page has been referenced.
        const USE = 1 << 1;
        /// The page has been written.
        const DIRTY = 1 << 2;
        /// Writes through this mapping fault.
        const READ_ONLY = 1 << 3;
    }
}

/// One virtual-to-physical page mapping.
#[derive(Debug, Clone, Copy)]
pub struct TranslationEntry {
    pub virtual_page: usize,
    pub physical_page: usize,
    pub flags: PteFlags,
}

impl TranslationEntry {
    /// A fresh valid mapping with clear USE/DIRTY bits.
    pub fn new(virtual_page: usize, physical_page: usize) -> Self {
        Self {
            virtual_page,
            physical_page,
            flags: PteFlags::VALID,
        }
    }
}

/// Shared handle to a page table.
pub type PageTableRef = Arc<Mutex<Vec<TranslationEntry>>>;
