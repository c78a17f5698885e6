//! Launching process images
//!
//! `fork_exec` loads a named executable from the filesystem into a fresh
//! address space carried by a new kernel thread. The live-process
//! counter tracks every image started this way; the exit path uses it to
//! decide between retiring one thread and halting the machine.

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::mm::AddrSpace;

/// Start a new process from the executable `filename` in the current
/// directory. Returns 0 on success, -1 when the file is missing or the
/// image cannot be given an address space.
pub fn fork_exec(kernel: &Arc<Kernel>, filename: &str) -> i32 {
    let Some(executable) = kernel.filesystem.open(filename) else {
        log::error!(target: "syscall", "unable to open file {}", filename);
        return -1;
    };

    kernel.process_started();
    let space = match AddrSpace::load(
        &executable,
        &kernel.machine,
        &kernel.frames,
        &kernel.scheduler,
    ) {
        Ok(space) => space,
        Err(err) => {
            log::error!(target: "syscall", "cannot start {}: {}", filename, err);
            kernel.process_abandoned();
            return -1;
        }
    };

    let child_kernel = Arc::clone(kernel);
    let tid = kernel.scheduler.fork("user process", move || {
        let space = child_kernel
            .scheduler
            .current_space()
            .expect("process thread without an address space");
        space.init_registers(&child_kernel.machine);
        space.restore_state(&child_kernel.machine);
        child_kernel.machine.run(&child_kernel);
    });
    kernel.scheduler.set_space(tid, Some(space));

    kernel.scheduler.yield_now();
    0
}
