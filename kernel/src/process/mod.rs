//! User program management
//!
//! The layer between the syscall boundary and the kernel primitives:
//! NOFF images, user threads within one address space, and launching
//! whole new process images.

pub mod exec;
pub mod noff;
pub mod user_thread;

pub use exec::fork_exec;
pub use user_thread::{do_user_thread_create, do_user_thread_exit, user_thread_join, UserThreads};
