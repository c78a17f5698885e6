//! Memory management
//!
//! Physical frame accounting, page-table entries and address spaces for
//! user programs loaded into the simulated machine's paged memory.

pub mod addr_space;
pub mod frame_provider;
pub mod page_table;

pub use addr_space::{AddrSpace, MAX_USER_THREADS, NUM_THREAD_PAGES, USER_STACK_SIZE};
pub use frame_provider::{FrameGuard, FrameProvider};
pub use page_table::{PageTableRef, PteFlags, TranslationEntry};
