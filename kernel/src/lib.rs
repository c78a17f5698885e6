//! Coracle kernel
//!
//! The core of a small teaching operating system that manages user
//! programs on a simulated MIPS machine: address spaces over frame-
//! allocated simulated RAM, cooperative kernel threads with per-slot
//! join semantics, a trap-based system-call boundary, and a single-disk
//! filesystem with a free-sector bitmap and two-level indirect file
//! headers.
//!
//! Everything hangs off an explicit [`kernel::Kernel`] context; nothing
//! lives in free statics, so tests can boot several machines side by
//! side. The MIPS interpreter itself is external: the machine exposes a
//! [`machine::UserCode`] seam that scripted programs (or a real
//! instruction simulator) plug into.

pub mod drivers;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod logger;
pub mod machine;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod utils;

pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelOptions};
