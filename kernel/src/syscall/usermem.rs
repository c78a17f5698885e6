//! User-memory string marshalling
//!
//! Strings cross the user/kernel boundary one byte at a time through the
//! machine's translation, because user addresses mean nothing to the
//! kernel without the current page table.

use crate::machine::Machine;

/// Copy a NUL-terminated string out of simulated memory, up to
/// `max - 1` bytes. Stops early at the NUL or at an untranslatable
/// address.
pub fn copy_string_from_machine(machine: &Machine, from: usize, max: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    for offset in 0..max.saturating_sub(1) {
        match machine.read_mem(from + offset, 1) {
            Ok(0) => break,
            Ok(value) => bytes.push(value as u8),
            Err(err) => {
                log::warn!(target: "syscall", "string copy from {:#x} faulted: {}", from, err);
                break;
            }
        }
    }
    bytes
}

/// Copy a string into simulated memory at `to`: the content (at most
/// `n - 1` bytes) followed by a NUL terminator.
pub fn copy_string_to_machine(machine: &Machine, bytes: &[u8], to: usize, n: usize) {
    if n == 0 {
        return;
    }
    let body = bytes.len().min(n - 1);
    for (offset, &byte) in bytes[..body].iter().enumerate() {
        if let Err(err) = machine.write_mem(to + offset, 1, i32::from(byte)) {
            log::warn!(target: "syscall", "string copy to {:#x} faulted: {}", to, err);
            return;
        }
    }
    let _ = machine.write_mem(to + body, 1, 0);
}
