//! User threads
//!
//! Several user threads can run inside one address space, each with its
//! own stack slot and join rendezvous. Creation is a handshake: the
//! parent forks a kernel thread and parks on `wait` until the child has
//! claimed its stack slot, so the id it returns to user code is always
//! joinable. The `exist` section serializes creation against join's
//! existence check.
//!
//! The creator's eager claim on the slot's join rendezvous pairs with
//! the exiting thread's signal; see [`crate::mm::addr_space::JoinSlot`].

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::machine::{NEXT_PC_REG, PC_REG, STACK_REG};
use crate::mm::MAX_USER_THREADS;
use crate::sched::{Scheduler, Semaphore};

/// Cross-thread handshake state for the user-thread layer.
pub struct UserThreads {
    /// Parent parks here until the child has its stack slot.
    wait: Semaphore,
    /// Serializes creation against join's existence checks.
    exist: Semaphore,
    /// Slot claimed by the child being created (`None`: claim failed).
    /// Valid only between the child's `wait` signal and the parent's
    /// read, both inside the `exist` section.
    created: spin::Mutex<Option<usize>>,
}

impl UserThreads {
    pub fn new(sched: &Arc<Scheduler>) -> Self {
        Self {
            wait: Semaphore::new("thread wait", Arc::clone(sched), 0),
            exist: Semaphore::new("thread existing", Arc::clone(sched), 1),
            created: spin::Mutex::new(None),
        }
    }
}

/// Create a user thread running `entry(arg)`. Returns the new thread's
/// slot id, or -1 when the address space has no room. The slot id is
/// also placed in r2 for the trapping program.
pub fn do_user_thread_create(kernel: &Arc<Kernel>, entry: i32, arg: i32) -> i32 {
    let sched = &kernel.scheduler;
    let Some(space) = sched.current_space() else {
        log::error!(target: "sched", "user thread create outside a user program");
        return -1;
    };
    if !space.is_stack_free() {
        log::warn!(target: "sched", "user thread stack map is full");
        return -1;
    }

    kernel.user_threads.exist.p();

    let child_kernel = Arc::clone(kernel);
    sched.fork("user thread", move || {
        start_user_thread(&child_kernel, entry, arg);
    });

    // Until the child signals, its slot is not known (nor allocated).
    // The slot comes through the handshake cell because a short-lived
    // child may already be gone from the thread table by now.
    kernel.user_threads.wait.p();
    let Some(slot) = kernel.user_threads.created.lock().take() else {
        // The child could not claim a contiguous block and bailed out.
        kernel.user_threads.exist.v();
        return -1;
    };

    // Claim the join rendezvous on behalf of a future joiner, so the
    // child's exit signal is what wakes it.
    space.join_slot(slot).arm();
    kernel.machine.write_register(2, slot as i32);

    kernel.user_threads.exist.v();
    sched.yield_now();
    slot as i32
}

/// Child-side entry: set up registers and stack, announce the slot,
/// then drop into user code.
fn start_user_thread(kernel: &Arc<Kernel>, entry: i32, arg: i32) {
    let sched = &kernel.scheduler;
    let machine = &kernel.machine;
    let space = sched
        .current_space()
        .expect("user thread forked without an address space");

    space.save_state(machine);
    space.init_registers(machine);
    machine.write_register(PC_REG, entry);
    machine.write_register(NEXT_PC_REG, entry + 4);
    machine.write_register(4, arg);

    match space.user_stack_allocate() {
        Ok(slot) => {
            machine.write_register(STACK_REG, space.stack_pointer_for(slot) as i32);
            sched.set_current_init_stack_reg(slot);
            *kernel.user_threads.created.lock() = Some(slot);
            kernel.user_threads.wait.v();
            machine.run(kernel)
        }
        Err(err) => {
            log::warn!(target: "sched", "unable to allocate a user stack: {}", err);
            *kernel.user_threads.created.lock() = None;
            kernel.user_threads.wait.v();
            sched.finish_current()
        }
    }
}

/// Exit the calling user thread: wake any joiner, give back the stack
/// slot, retire the kernel thread. The main thread (slot 0) exits
/// through the process exit path instead and returns immediately.
pub fn do_user_thread_exit(kernel: &Arc<Kernel>) -> i32 {
    let sched = &kernel.scheduler;
    let slot = sched.current_init_stack_reg();
    if slot == 0 {
        return 0;
    }
    let space = sched
        .current_space()
        .expect("user thread exit without an address space");

    space.join_slot(slot).signal_exit();

    // Symmetric release toward a thread this one was joined on.
    if let Some(dependent) = sched.current_dependent_tid() {
        space.join_slot(dependent).signal_exit();
    }

    space.revoke_stack(slot);
    sched.finish_current()
}

/// Block until the thread in `tid`'s slot has exited. Fails (-1, with a
/// diagnostic) on self-join, double join, the main slot, or a slot with
/// no live thread.
pub fn user_thread_join(kernel: &Arc<Kernel>, tid: i32) -> i32 {
    let sched = &kernel.scheduler;

    if sched.current_dependent_tid().is_some() {
        log::warn!(target: "sched", "join refused: caller is already joined on another thread");
        return -1;
    }
    let own_slot = sched.current_init_stack_reg();
    if tid <= 0 || tid as usize == own_slot || tid as usize >= MAX_USER_THREADS {
        log::warn!(target: "sched", "join refused: invalid target thread {}", tid);
        return -1;
    }
    let slot = tid as usize;
    let Some(space) = sched.current_space() else {
        log::error!(target: "sched", "join outside a user program");
        return -1;
    };

    kernel.user_threads.exist.p();
    let alive = space.slot_allocated(slot);
    kernel.user_threads.exist.v();
    if !alive {
        log::warn!(target: "sched", "join refused: no thread in slot {}", slot);
        return -1;
    }

    sched.set_current_dependent_tid(Some(slot));
    space.join_slot(slot).await_exit();
    sched.set_current_dependent_tid(None);
    0
}
