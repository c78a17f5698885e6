//! Device wrappers giving kernel threads blocking I/O

pub mod console;

pub use console::{SynchConsole, EOF};
