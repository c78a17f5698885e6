//! Simulated hardware
//!
//! Everything under this module stands in for the physical machine the
//! kernel would run on: a MIPS register file and paged memory, a raw
//! single-platter disk, and a character console. The kernel proper only
//! talks to these through the same contracts the real simulator exposes
//! (registers, word-wise memory access, completion callbacks), so the
//! instruction interpreter itself stays pluggable.

pub mod console;
pub mod disk;
pub mod mips;

pub use console::Console;
pub use disk::{Disk, NUM_SECTORS, SECTOR_SIZE};
pub use mips::{
    Machine, MachineContext, UserCode, MEMORY_SIZE, NEXT_PC_REG, NUM_PHYS_PAGES, NUM_TOTAL_REGS,
    PAGE_SIZE, PC_REG, PREV_PC_REG, STACK_REG,
};
