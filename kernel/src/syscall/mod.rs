//! The system-call boundary
//!
//! Entry point into the kernel from simulated user mode. The register
//! convention is the machine's: syscall number in r2, arguments in
//! r4..r7, result back in r2. After every handled trap the simulated
//! program counters advance past the `syscall` instruction — except
//! when the call retires the thread or halts the machine, in which case
//! nothing returns to user mode at all.

pub mod usermem;

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::machine::{Machine, NEXT_PC_REG, PC_REG, PREV_PC_REG};
use crate::process;

/// Longest string marshalled across the user/kernel memory boundary.
pub const MAX_STRING_SIZE: usize = 256;

/// Exceptions that transfer control from user mode into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// Explicit request: the `syscall` instruction.
    Syscall,
    /// Reference to an unmapped or misaligned address.
    AddressError,
    /// Write through a read-only mapping.
    ReadOnly,
    /// Undecodable instruction.
    IllegalInstruction,
}

/// Recognized system calls.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt = 0,
    Exit = 1,
    PutChar = 11,
    PutInt = 12,
    GetInt = 13,
    GetChar = 14,
    PutString = 15,
    GetString = 16,
    UserThreadCreate = 17,
    UserThreadExit = 18,
    UserThreadJoin = 19,
    ForkExec = 20,
}

impl TryFrom<i32> for Syscall {
    type Error = i32;

    fn try_from(number: i32) -> Result<Self, i32> {
        Ok(match number {
            0 => Syscall::Halt,
            1 => Syscall::Exit,
            11 => Syscall::PutChar,
            12 => Syscall::PutInt,
            13 => Syscall::GetInt,
            14 => Syscall::GetChar,
            15 => Syscall::PutString,
            16 => Syscall::GetString,
            17 => Syscall::UserThreadCreate,
            18 => Syscall::UserThreadExit,
            19 => Syscall::UserThreadJoin,
            20 => Syscall::ForkExec,
            other => return Err(other),
        })
    }
}

/// Kernel entry from user mode. Dispatches the syscall in r2, then
/// advances the program counters.
pub fn exception_handler(kernel: &Arc<Kernel>, which: ExceptionType) {
    match which {
        ExceptionType::Syscall => {
            let number = kernel.machine.read_register(2);
            match Syscall::try_from(number) {
                Ok(syscall) => dispatch(kernel, syscall),
                Err(other) => panic!("unexpected syscall number {}", other),
            }
        }
        other => panic!("unexpected user mode exception {:?}", other),
    }
    update_pc(&kernel.machine);
}

/// Machine-side trap helper: set up the syscall registers the way the
/// `syscall` instruction does, enter the kernel, and return r2. This is
/// the seam scripted user programs issue their calls through.
pub fn raise(kernel: &Arc<Kernel>, syscall: Syscall, args: [i32; 4]) -> i32 {
    let machine = &kernel.machine;
    machine.write_register(2, syscall as i32);
    for (slot, value) in args.into_iter().enumerate() {
        machine.write_register(4 + slot, value);
    }
    exception_handler(kernel, ExceptionType::Syscall);
    machine.read_register(2)
}

fn dispatch(kernel: &Arc<Kernel>, syscall: Syscall) {
    let machine = &kernel.machine;
    log::trace!(target: "syscall", "{:?}", syscall);
    match syscall {
        Syscall::Exit => sys_exit(kernel),
        Syscall::Halt => sys_halt(kernel),
        Syscall::PutChar => {
            kernel.console.put_char(machine.read_register(4) as u8);
        }
        Syscall::GetChar => {
            let c = kernel.console.get_char();
            machine.write_register(2, c);
        }
        Syscall::PutString => {
            let from = machine.read_register(4) as usize;
            let text = usermem::copy_string_from_machine(machine, from, MAX_STRING_SIZE);
            kernel.console.put_string(&text);
        }
        Syscall::GetString => {
            let to = machine.read_register(4) as usize;
            let n = (machine.read_register(5) as usize).min(MAX_STRING_SIZE);
            let line = kernel.console.get_string(n);
            usermem::copy_string_to_machine(machine, &line, to, n);
        }
        Syscall::PutInt => {
            kernel.console.put_int(machine.read_register(4));
        }
        Syscall::GetInt => {
            let value = kernel.console.get_int();
            machine.write_register(2, value);
        }
        Syscall::UserThreadCreate => {
            let entry = machine.read_register(4);
            let arg = machine.read_register(5);
            let result = process::do_user_thread_create(kernel, entry, arg);
            machine.write_register(2, result);
        }
        Syscall::UserThreadExit => {
            process::do_user_thread_exit(kernel);
        }
        Syscall::UserThreadJoin => {
            let tid = machine.read_register(4);
            let result = process::user_thread_join(kernel, tid);
            machine.write_register(2, result);
        }
        Syscall::ForkExec => {
            let from = machine.read_register(4) as usize;
            let raw = usermem::copy_string_from_machine(machine, from, MAX_STRING_SIZE);
            let path = String::from_utf8_lossy(&raw).into_owned();
            let result = process::fork_exec(kernel, &path);
            machine.write_register(2, result);
        }
    }
}

/// Process exit: hold the space together until sibling user threads are
/// done, drop it, and either retire this kernel thread or, when this was
/// the last live process, stop the machine.
fn sys_exit(kernel: &Arc<Kernel>) -> ! {
    let status = kernel.machine.read_register(4);
    kernel.record_exit_status(status);
    log::debug!(target: "syscall", "process exit with status {}", status);
    if let Some(space) = kernel.scheduler.current_space() {
        space.wait_for_last_thread();
    }
    let remaining = kernel.process_exited();
    kernel.scheduler.clear_current_space();
    if remaining >= 0 {
        kernel.scheduler.finish_current()
    } else {
        kernel.halt()
    }
}

/// Immediate shutdown, once sibling user threads are done.
fn sys_halt(kernel: &Arc<Kernel>) -> ! {
    log::debug!(target: "syscall", "shutdown initiated by user program");
    if let Some(space) = kernel.scheduler.current_space() {
        space.wait_for_last_thread();
    }
    kernel.scheduler.clear_current_space();
    kernel.halt()
}

/// Advance past the trapping instruction: `PrevPC <- PC; PC <- NextPC;
/// NextPC += 4`. Skipping this would re-run the same syscall forever.
fn update_pc(machine: &Machine) {
    let pc = machine.read_register(PC_REG);
    machine.write_register(PREV_PC_REG, pc);
    let next = machine.read_register(NEXT_PC_REG);
    machine.write_register(PC_REG, next);
    machine.write_register(NEXT_PC_REG, next + 4);
}
