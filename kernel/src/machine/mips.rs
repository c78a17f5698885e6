//! Simulated MIPS machine state
//!
//! Registers, simulated physical memory and the currently installed page
//! table. Address translation (`read_mem`/`write_mem`) is the boundary the
//! kernel uses to reach user memory; instruction decode is not simulated
//! here — [`Machine::run`] hands control to whatever [`UserCode`] executor
//! has been registered, which plays the role of the interpreter loop.

use std::sync::Arc;

use spin::Mutex;

use crate::{
    error::MachineError,
    kernel::Kernel,
    mm::page_table::{PageTableRef, PteFlags},
    syscall::{self, Syscall},
};

/// Bytes per virtual/physical page. Equal to the disk sector size so a
/// page can be read or written in one sector operation.
pub const PAGE_SIZE: usize = super::disk::SECTOR_SIZE;

/// Number of physical page frames of simulated RAM.
pub const NUM_PHYS_PAGES: usize = 128;

/// Total bytes of simulated RAM.
pub const MEMORY_SIZE: usize = NUM_PHYS_PAGES * PAGE_SIZE;

/// User stack pointer register.
pub const STACK_REG: usize = 29;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter (branch delay slot).
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter, for debugging faults.
pub const PREV_PC_REG: usize = 36;
/// Size of the register file.
pub const NUM_TOTAL_REGS: usize = 40;

/// Executor seam standing in for the MIPS interpreter.
///
/// `exec` is entered with the machine registers already set up for the
/// program (PC at `entry`, argument in r4, stack pointer placed); it
/// issues system calls through [`syscall::raise`] exactly as compiled
/// user code would through the `syscall` instruction. Returning from
/// `exec` models the C runtime falling off `main`, which exits.
pub trait UserCode: Send + Sync {
    fn exec(&self, kernel: &Arc<Kernel>, entry: i32);
}

/// Register file plus installed page table; saved and restored as a unit
/// on kernel thread context switches.
#[derive(Clone)]
pub struct MachineContext {
    pub registers: [i32; NUM_TOTAL_REGS],
    pub page_table: Option<PageTableRef>,
}

impl MachineContext {
    pub fn zeroed() -> Self {
        Self {
            registers: [0; NUM_TOTAL_REGS],
            page_table: None,
        }
    }
}

struct MachineState {
    registers: [i32; NUM_TOTAL_REGS],
    page_table: Option<PageTableRef>,
}

/// The simulated machine.
pub struct Machine {
    memory: Mutex<Box<[u8]>>,
    state: Mutex<MachineState>,
    executor: Mutex<Option<Arc<dyn UserCode>>>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            memory: Mutex::new(vec![0u8; MEMORY_SIZE].into_boxed_slice()),
            state: Mutex::new(MachineState {
                registers: [0; NUM_TOTAL_REGS],
                page_table: None,
            }),
            executor: Mutex::new(None),
        }
    }

    /// Register the instruction executor used by [`Machine::run`].
    pub fn set_executor(&self, executor: Arc<dyn UserCode>) {
        *self.executor.lock() = Some(executor);
    }

    pub fn read_register(&self, reg: usize) -> i32 {
        assert!(reg < NUM_TOTAL_REGS, "register {} out of range", reg);
        self.state.lock().registers[reg]
    }

    pub fn write_register(&self, reg: usize, value: i32) {
        assert!(reg < NUM_TOTAL_REGS, "register {} out of range", reg);
        self.state.lock().registers[reg] = value;
    }

    /// Install a page table for address translation.
    pub fn install_page_table(&self, table: PageTableRef) {
        self.state.lock().page_table = Some(table);
    }

    /// The page table currently installed, if any.
    pub fn installed_page_table(&self) -> Option<PageTableRef> {
        self.state.lock().page_table.clone()
    }

    /// Replace the installed page table, returning the previous one.
    /// Used by the loader to translate through a table it is still
    /// building, then put the caller's back.
    pub fn swap_page_table(&self, table: Option<PageTableRef>) -> Option<PageTableRef> {
        core::mem::replace(&mut self.state.lock().page_table, table)
    }

    /// Snapshot registers and page table for a context switch.
    pub fn save_context(&self) -> MachineContext {
        let st = self.state.lock();
        MachineContext {
            registers: st.registers,
            page_table: st.page_table.clone(),
        }
    }

    /// Reinstate a previously saved context.
    pub fn restore_context(&self, ctx: &MachineContext) {
        let mut st = self.state.lock();
        st.registers = ctx.registers;
        st.page_table = ctx.page_table.clone();
    }

    /// Translate a virtual address, updating the USE (and, when writing,
    /// DIRTY) bits of the page table entry.
    fn translate(&self, addr: usize, size: usize, writing: bool) -> Result<usize, MachineError> {
        // Natural alignment, as the real machine requires.
        if (size == 2 && addr & 0x1 != 0) || (size == 4 && addr & 0x3 != 0) {
            return Err(MachineError::AddressError { addr });
        }
        let table = {
            let st = self.state.lock();
            st.page_table.clone().ok_or(MachineError::NoPageTable)?
        };
        let vpn = addr / PAGE_SIZE;
        let offset = addr % PAGE_SIZE;
        let mut entries = table.lock();
        let entry = entries
            .get_mut(vpn)
            .ok_or(MachineError::AddressError { addr })?;
        if !entry.flags.contains(PteFlags::VALID) {
            return Err(MachineError::AddressError { addr });
        }
        if writing && entry.flags.contains(PteFlags::READ_ONLY) {
            return Err(MachineError::ReadOnly { addr });
        }
        entry.flags.insert(PteFlags::USE);
        if writing {
            entry.flags.insert(PteFlags::DIRTY);
        }
        let frame = entry.physical_page;
        assert!(frame < NUM_PHYS_PAGES, "page table maps bad frame {}", frame);
        Ok(frame * PAGE_SIZE + offset)
    }

    /// Read `size` bytes (1, 2 or 4) at virtual address `addr`,
    /// zero-extended into an `i32`.
    pub fn read_mem(&self, addr: usize, size: usize) -> Result<i32, MachineError> {
        let pa = self.translate(addr, size, false)?;
        let mem = self.memory.lock();
        let value = match size {
            1 => i32::from(mem[pa]),
            2 => i32::from(u16::from_ne_bytes([mem[pa], mem[pa + 1]])),
            4 => i32::from_ne_bytes([mem[pa], mem[pa + 1], mem[pa + 2], mem[pa + 3]]),
            _ => panic!("unsupported access size {}", size),
        };
        Ok(value)
    }

    /// Write the low `size` bytes (1, 2 or 4) of `value` at virtual
    /// address `addr`.
    pub fn write_mem(&self, addr: usize, size: usize, value: i32) -> Result<(), MachineError> {
        let pa = self.translate(addr, size, true)?;
        let mut mem = self.memory.lock();
        let bytes = value.to_ne_bytes();
        match size {
            1 => mem[pa] = bytes[0],
            2 => mem[pa..pa + 2].copy_from_slice(&bytes[..2]),
            4 => mem[pa..pa + 4].copy_from_slice(&bytes[..4]),
            _ => panic!("unsupported access size {}", size),
        }
        Ok(())
    }

    /// Run user instructions from the current PC on the calling kernel
    /// thread. Control comes back to the kernel only through the syscall
    /// boundary; an executor that returns is treated as the program
    /// running off the end of `main`, which exits with status 0.
    pub fn run(&self, kernel: &Arc<Kernel>) -> ! {
        let entry = self.read_register(PC_REG);
        let executor = self.executor.lock().clone();
        match executor {
            Some(code) => {
                log::trace!(target: "machine", "entering user code at {:#x}", entry);
                code.exec(kernel, entry);
                syscall::raise(kernel, Syscall::Exit, [0, 0, 0, 0]);
                unreachable!("Exit syscall returned");
            }
            None => {
                log::error!(target: "machine", "no user-code executor registered");
                kernel.halt()
            }
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
