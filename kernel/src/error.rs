//! Structured error types for the Coracle kernel
//!
//! Locally recoverable failures travel as `Result` values built from the
//! enums below; invariant violations (releasing a frame that is not busy,
//! clearing a clear bitmap bit, a bad executable magic) are assertions,
//! because they indicate a kernel bug rather than a condition the caller
//! can handle.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-management errors
    Mem(MemError),
    /// Filesystem errors
    Fs(FsError),
    /// Simulated-machine errors
    Machine(MachineError),
    /// Program-loading errors
    Exec(ExecError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Mem(e) => write!(f, "memory error: {}", e),
            KernelError::Fs(e) => write!(f, "filesystem error: {}", e),
            KernelError::Machine(e) => write!(f, "machine error: {}", e),
            KernelError::Exec(e) => write!(f, "exec error: {}", e),
        }
    }
}

/// Memory-management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Not enough free frames to build an address space
    OutOfFrames { requested: usize, available: usize },
    /// No contiguous stack slot block is available
    NoStackSlot,
    /// A stack slot index outside the stack map
    BadStackSlot { slot: usize },
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfFrames {
                requested,
                available,
            } => write!(f, "out of frames: need {}, have {}", requested, available),
            MemError::NoStackSlot => write!(f, "no free user stack slot"),
            MemError::BadStackSlot { slot } => write!(f, "invalid stack slot {}", slot),
        }
    }
}

/// Filesystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The name already exists in the current directory
    AlreadyExists,
    /// The name was not found in the current directory
    NotFound,
    /// The free-sector map cannot supply enough sectors
    DiskFull,
    /// No free slot in the directory table
    DirectoryFull,
    /// The requested size exceeds the indirection capacity
    FileTooLarge { requested: usize, max: usize },
    /// Directory deletion refused: entries other than `.`/`..` remain
    DirectoryNotEmpty,
    /// A path component did not name a directory
    NotADirectory,
    /// Path traversal failed (missing component)
    InvalidPath,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::AlreadyExists => write!(f, "file already exists"),
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::DiskFull => write!(f, "no free sectors on disk"),
            FsError::DirectoryFull => write!(f, "directory is full"),
            FsError::FileTooLarge { requested, max } => {
                write!(f, "file size {} exceeds maximum {}", requested, max)
            }
            FsError::DirectoryNotEmpty => write!(f, "directory not empty"),
            FsError::NotADirectory => write!(f, "not a directory"),
            FsError::InvalidPath => write!(f, "invalid path"),
        }
    }
}

/// Simulated-machine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    /// Virtual address outside the installed page table, or an invalid entry
    AddressError { addr: usize },
    /// Write through a read-only page
    ReadOnly { addr: usize },
    /// No page table is installed on the machine
    NoPageTable,
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::AddressError { addr } => write!(f, "bad virtual address {:#x}", addr),
            MachineError::ReadOnly { addr } => write!(f, "write to read-only page at {:#x}", addr),
            MachineError::NoPageTable => write!(f, "no page table installed"),
        }
    }
}

/// Program-loading errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Executable not found in the filesystem
    NotFound,
    /// Image is truncated or otherwise malformed
    Malformed,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::NotFound => write!(f, "executable not found"),
            ExecError::Malformed => write!(f, "malformed executable"),
        }
    }
}

impl From<MemError> for KernelError {
    fn from(err: MemError) -> Self {
        KernelError::Mem(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::Fs(err)
    }
}

impl From<MachineError> for KernelError {
    fn from(err: MachineError) -> Self {
        KernelError::Machine(err)
    }
}

impl From<ExecError> for KernelError {
    fn from(err: ExecError) -> Self {
        KernelError::Exec(err)
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = core::result::Result<T, KernelError>;
