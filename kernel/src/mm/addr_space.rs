//! Address spaces
//!
//! An address space owns a linear page table over frames claimed from the
//! [`FrameProvider`], the stack-slot map that parcels the top of the
//! space out to user threads, and the per-slot join rendezvous those
//! threads synchronize exits through. Construction loads a NOFF image
//! through the machine's translation path; destruction is plain `Drop` —
//! the frame guards release exactly what was acquired.

use std::sync::Arc;

use spin::Mutex;

use crate::error::{ExecError, KernelResult, MemError};
use crate::fs::open_file::ReadAt;
use crate::machine::{Machine, NEXT_PC_REG, NUM_PHYS_PAGES, NUM_TOTAL_REGS, PAGE_SIZE, PC_REG, STACK_REG};
use crate::mm::frame_provider::{FrameGuard, FrameProvider};
use crate::mm::page_table::{PageTableRef, TranslationEntry};
use crate::process::noff::NoffHeader;
use crate::sched::{Scheduler, Semaphore};
use crate::utils::bitmap::BitMap;
use crate::utils::div_round_up;

/// Bytes of user stack reserved when sizing an address space.
pub const USER_STACK_SIZE: usize = 8192;

/// Pages in one user thread's stack region.
pub const NUM_THREAD_PAGES: usize = 4;

/// Bits in the stack-slot map (stack pages at the top of the space).
pub const MAX_USER_THREADS: usize = USER_STACK_SIZE / PAGE_SIZE;

/// Join rendezvous for one stack slot.
///
/// Wraps a count-1 semaphore. The creator arms the slot before handing
/// the thread id to user code, the exiting thread signals it, and a
/// joiner waits for that signal. The pairing of the initial count with
/// the creator's eager wait is deliberate; neither moves without the
/// other. A joiner re-credits the slot after observing the exit so the
/// slot stays balanced for reuse and for further joiners.
pub struct JoinSlot {
    sem: Semaphore,
}

impl JoinSlot {
    fn new(sched: &Arc<Scheduler>) -> Self {
        Self {
            sem: Semaphore::new("thread join", Arc::clone(sched), 1),
        }
    }

    /// Consume the slot's credit on behalf of a future joiner.
    pub fn arm(&self) {
        self.sem.p();
    }

    /// Signal that the slot's thread has exited.
    pub fn signal_exit(&self) {
        self.sem.v();
    }

    /// Block until the slot's thread has exited.
    pub fn await_exit(&self) {
        self.sem.p();
        self.sem.v();
    }
}

struct StackState {
    map: BitMap,
    num_threads: usize,
    is_ending: bool,
}

/// A user program's address space.
pub struct AddrSpace {
    page_table: Mutex<PageTableRef>,
    num_pages: usize,
    // Held for ownership; released on drop.
    _frames: Vec<FrameGuard>,
    stack: Mutex<StackState>,
    join_slots: Vec<JoinSlot>,
    block_final: Semaphore,
}

impl AddrSpace {
    /// Build an address space from a NOFF executable.
    ///
    /// Fails without acquiring anything when the image is malformed or
    /// the frame provider cannot cover the whole image (no partially
    /// constructed space ever exists). Panics if the image cannot fit in
    /// physical memory at all; that is a configuration bug, not a load
    /// error.
    pub fn load(
        executable: &dyn ReadAt,
        machine: &Machine,
        frames: &Arc<FrameProvider>,
        sched: &Arc<Scheduler>,
    ) -> KernelResult<Arc<Self>> {
        let mut header_bytes = [0u8; NoffHeader::SIZE];
        if executable.read_at(&mut header_bytes, 0) < NoffHeader::SIZE {
            return Err(ExecError::Malformed.into());
        }
        let noff = NoffHeader::parse(&header_bytes).map_err(crate::error::KernelError::Exec)?;
        let (code_size, init_size, uninit_size) = (
            usize::try_from(noff.code.size).map_err(|_| ExecError::Malformed)?,
            usize::try_from(noff.init_data.size).map_err(|_| ExecError::Malformed)?,
            usize::try_from(noff.uninit_data.size).map_err(|_| ExecError::Malformed)?,
        );

        let size = code_size + init_size + uninit_size + USER_STACK_SIZE;
        let num_pages = div_round_up(size, PAGE_SIZE);
        assert!(
            num_pages <= NUM_PHYS_PAGES,
            "image needs {} pages, machine has {}",
            num_pages,
            NUM_PHYS_PAGES
        );
        log::debug!(target: "addr", "initializing address space, {} pages, {} bytes", num_pages, num_pages * PAGE_SIZE);

        let available = frames.num_avail_frames();
        if available < num_pages {
            return Err(MemError::OutOfFrames {
                requested: num_pages,
                available,
            }
            .into());
        }

        let mut guards = Vec::with_capacity(num_pages);
        let mut entries = Vec::with_capacity(num_pages);
        for virtual_page in 0..num_pages {
            // Cannot fail: availability was checked and nothing yields
            // between the check and the claims.
            let guard = frames
                .get_empty_frame()
                .expect("frame count changed during allocation");
            entries.push(TranslationEntry::new(virtual_page, guard.frame()));
            guards.push(guard);
        }
        let table: PageTableRef = Arc::new(Mutex::new(entries));

        let join_slots = (0..MAX_USER_THREADS).map(|_| JoinSlot::new(sched)).collect();

        // Zero the whole space and copy the segments in through the new
        // table, then put the caller's table back.
        let previous = machine.swap_page_table(Some(Arc::clone(&table)));
        let load_result = (|| -> KernelResult<()> {
            for addr in (0..num_pages * PAGE_SIZE).step_by(4) {
                machine.write_mem(addr, 4, 0)?;
            }
            if code_size > 0 {
                log::debug!(target: "addr", "loading code segment at {:#x}, size {}", noff.code.virtual_addr, code_size);
                read_at_virtual(
                    executable,
                    machine,
                    noff.code.virtual_addr as usize,
                    code_size,
                    noff.code.in_file_addr as usize,
                )?;
            }
            if init_size > 0 {
                log::debug!(target: "addr", "loading data segment at {:#x}, size {}", noff.init_data.virtual_addr, init_size);
                read_at_virtual(
                    executable,
                    machine,
                    noff.init_data.virtual_addr as usize,
                    init_size,
                    noff.init_data.in_file_addr as usize,
                )?;
            }
            Ok(())
        })();
        machine.swap_page_table(previous);
        load_result?;

        let mut map = BitMap::new(MAX_USER_THREADS);
        for bit in 0..NUM_THREAD_PAGES {
            map.mark(bit);
        }

        Ok(Arc::new(Self {
            page_table: Mutex::new(table),
            num_pages,
            _frames: guards,
            stack: Mutex::new(StackState {
                map,
                num_threads: 0,
                is_ending: false,
            }),
            join_slots,
            block_final: Semaphore::new("final thread gate", Arc::clone(sched), 0),
        }))
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Handle to the page table, for installing on the machine.
    pub fn page_table_ref(&self) -> PageTableRef {
        Arc::clone(&self.page_table.lock())
    }

    /// Set up the register file to start execution at the beginning of
    /// the space, stack pointer at the top (minus a safety margin so the
    /// first pushes stay in bounds).
    pub fn init_registers(&self, machine: &Machine) {
        for reg in 0..NUM_TOTAL_REGS {
            machine.write_register(reg, 0);
        }
        machine.write_register(PC_REG, 0);
        machine.write_register(NEXT_PC_REG, 4);
        let sp = (self.num_pages * PAGE_SIZE - 16) as i32;
        machine.write_register(STACK_REG, sp);
        log::debug!(target: "addr", "stack register initialized to {}", sp);
    }

    /// Snapshot the machine's installed page table into this space (the
    /// running thread may have replaced it).
    pub fn save_state(&self, machine: &Machine) {
        if let Some(table) = machine.installed_page_table() {
            *self.page_table.lock() = table;
        }
    }

    /// Install this space's page table on the machine.
    pub fn restore_state(&self, machine: &Machine) {
        machine.install_page_table(self.page_table_ref());
    }

    // ----- per-thread stacks -------------------------------------------

    /// Cheap room check used before attempting thread creation.
    pub fn is_stack_free(&self) -> bool {
        self.stack.lock().map.num_clear() > 0
    }

    /// Claim the lowest contiguous block of stack pages for a new user
    /// thread; returns the slot id (the block's first bit).
    pub fn user_stack_allocate(&self) -> Result<usize, MemError> {
        let mut st = self.stack.lock();
        'scan: for base in 0..=MAX_USER_THREADS - NUM_THREAD_PAGES {
            for offset in 0..NUM_THREAD_PAGES {
                if st.map.test(base + offset) {
                    continue 'scan;
                }
            }
            for offset in 0..NUM_THREAD_PAGES {
                st.map.mark(base + offset);
            }
            st.num_threads += 1;
            log::debug!(target: "addr", "stack slot {} allocated ({} user threads)", base, st.num_threads);
            return Ok(base);
        }
        Err(MemError::NoStackSlot)
    }

    /// Return a thread's stack block. Signals the final-thread gate when
    /// the space is ending and this was the last user thread.
    pub fn revoke_stack(&self, slot: usize) {
        let signal = {
            let mut st = self.stack.lock();
            for offset in 0..NUM_THREAD_PAGES {
                assert!(
                    st.map.test(slot + offset),
                    "revoking stack slot {} that is not fully allocated",
                    slot
                );
                st.map.clear(slot + offset);
            }
            st.num_threads -= 1;
            log::debug!(target: "addr", "stack slot {} revoked ({} user threads)", slot, st.num_threads);
            st.is_ending && st.num_threads == 0
        };
        if signal {
            self.block_final.v();
        }
    }

    /// Virtual stack pointer for a slot: thread 0's stack sits at the top
    /// of the space, successive slots below it.
    pub fn stack_pointer_for(&self, slot: usize) -> usize {
        PAGE_SIZE * self.num_pages - slot * PAGE_SIZE
    }

    /// Whether a slot's first stack page is currently allocated.
    pub fn slot_allocated(&self, slot: usize) -> bool {
        slot < MAX_USER_THREADS && self.stack.lock().map.test(slot)
    }

    /// Number of live user threads (beyond the main thread).
    pub fn num_threads(&self) -> usize {
        self.stack.lock().num_threads
    }

    /// Block a process-exit path until every sibling user thread has
    /// exited, so the space is not torn down under them.
    pub fn wait_for_last_thread(&self) {
        let must_wait = {
            let mut st = self.stack.lock();
            if st.num_threads > 0 {
                st.is_ending = true;
                true
            } else {
                false
            }
        };
        if must_wait {
            self.block_final.p();
            self.stack.lock().is_ending = false;
        }
    }

    /// The join rendezvous for a stack slot.
    pub fn join_slot(&self, slot: usize) -> &JoinSlot {
        &self.join_slots[slot]
    }
}

/// Copy `num_bytes` at `position` in the executable to `virtual_addr`,
/// word by word through the machine's installed translation.
fn read_at_virtual(
    executable: &dyn ReadAt,
    machine: &Machine,
    virtual_addr: usize,
    num_bytes: usize,
    position: usize,
) -> KernelResult<()> {
    let mut data = vec![0u8; div_round_up(num_bytes, 4) * 4];
    if executable.read_at(&mut data[..num_bytes], position) < num_bytes {
        return Err(ExecError::Malformed.into());
    }
    for offset in (0..num_bytes).step_by(4) {
        let word = i32::from_ne_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        machine.write_mem(virtual_addr + offset, 4, word)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    fn harness() -> (Arc<Machine>, Arc<FrameProvider>, Arc<Scheduler>) {
        let machine = Arc::new(Machine::new());
        let frames = FrameProvider::new();
        let sched = Scheduler::new(Arc::clone(&machine));
        (machine, frames, sched)
    }

    fn image_with_code(code: &[u8]) -> Vec<u8> {
        let mut header = NoffHeader::empty();
        header.code.virtual_addr = 0;
        header.code.in_file_addr = NoffHeader::SIZE as i32;
        header.code.size = code.len() as i32;
        let mut image = header.to_bytes();
        image.extend_from_slice(code);
        image
    }

    #[test]
    fn test_load_releases_frames_on_drop() {
        let (machine, frames, sched) = harness();
        let before = frames.num_avail_frames();
        let image = image_with_code(&[0xaa; 64]);
        let space =
            AddrSpace::load(&image.as_slice(), &machine, &frames, &sched).expect("load");
        assert_eq!(
            frames.num_avail_frames(),
            before - space.num_pages(),
            "every page backed by a busy frame"
        );
        drop(space);
        assert_eq!(frames.num_avail_frames(), before);
    }

    #[test]
    fn test_load_rejects_when_frames_short() {
        let machine = Arc::new(Machine::new());
        let frames = FrameProvider::with_frames(8);
        let sched = Scheduler::new(Arc::clone(&machine));
        let image = image_with_code(&[0; 16]);
        let err = AddrSpace::load(&image.as_slice(), &machine, &frames, &sched)
            .err()
            .expect("must refuse");
        assert!(matches!(
            err,
            crate::error::KernelError::Mem(MemError::OutOfFrames { .. })
        ));
        // Nothing was acquired.
        assert_eq!(frames.num_avail_frames(), 8);
    }

    #[test]
    fn test_code_visible_through_translation() {
        let (machine, frames, sched) = harness();
        let code: Vec<u8> = (0u8..64).collect();
        let image = image_with_code(&code);
        let space =
            AddrSpace::load(&image.as_slice(), &machine, &frames, &sched).expect("load");
        space.restore_state(&machine);
        for offset in (0..64usize).step_by(4) {
            let word = machine.read_mem(offset, 4).expect("read");
            let expect = i32::from_ne_bytes([
                code[offset],
                code[offset + 1],
                code[offset + 2],
                code[offset + 3],
            ]);
            assert_eq!(word, expect, "word at {:#x}", offset);
        }
        // Past the segments everything was zeroed.
        let zero = machine.read_mem(64, 4).expect("read");
        assert_eq!(zero, 0);
    }

    #[test]
    fn test_stack_slots_allocate_contiguously() {
        let (machine, frames, sched) = harness();
        let image = image_with_code(&[0; 4]);
        let space =
            AddrSpace::load(&image.as_slice(), &machine, &frames, &sched).expect("load");
        // Main thread owns the first block.
        let a = space.user_stack_allocate().expect("slot");
        let b = space.user_stack_allocate().expect("slot");
        assert_eq!((a, b), (NUM_THREAD_PAGES, 2 * NUM_THREAD_PAGES));
        assert_eq!(space.num_threads(), 2);
        space.revoke_stack(a);
        assert_eq!(space.num_threads(), 1);
        // The freed block is reused lowest-first.
        let c = space.user_stack_allocate().expect("slot");
        assert_eq!(c, a);
        space.revoke_stack(b);
        space.revoke_stack(c);
        assert_eq!(space.num_threads(), 0);
    }

    #[test]
    fn test_stack_slots_exhaust() {
        let (machine, frames, sched) = harness();
        let image = image_with_code(&[0; 4]);
        let space =
            AddrSpace::load(&image.as_slice(), &machine, &frames, &sched).expect("load");
        let capacity = MAX_USER_THREADS / NUM_THREAD_PAGES - 1;
        let slots: Vec<_> = (0..capacity)
            .map(|_| space.user_stack_allocate().expect("slot"))
            .collect();
        assert!(space.user_stack_allocate().is_err());
        space.revoke_stack(slots[0]);
        assert_eq!(space.user_stack_allocate().expect("slot"), slots[0]);
    }

    #[test]
    fn test_join_observes_exit_order() {
        let (machine, frames, sched) = harness();
        sched.adopt_main("driver");
        let image = image_with_code(&[0; 4]);
        let space =
            AddrSpace::load(&image.as_slice(), &machine, &frames, &sched).expect("load");
        let slot = space.user_stack_allocate().expect("slot");
        space.join_slot(slot).arm();

        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let joiner_order = Arc::clone(&order);
        let joiner_space = Arc::clone(&space);
        sched.fork("joiner", move || {
            joiner_space.join_slot(slot).await_exit();
            joiner_order.lock().push("join returned");
        });

        sched.yield_now(); // joiner runs and blocks on the armed slot
        order.lock().push("exit signalled");
        space.join_slot(slot).signal_exit();
        sched.yield_now(); // joiner finishes
        assert_eq!(*order.lock(), vec!["exit signalled", "join returned"]);
        space.revoke_stack(slot);
    }

    #[test]
    fn test_stack_pointer_layout() {
        let (machine, frames, sched) = harness();
        let image = image_with_code(&[0; 4]);
        let space =
            AddrSpace::load(&image.as_slice(), &machine, &frames, &sched).expect("load");
        let top = space.num_pages() * PAGE_SIZE;
        let slot = space.user_stack_allocate().expect("slot");
        assert_eq!(space.stack_pointer_for(slot), top - slot * PAGE_SIZE);
        assert!(space.stack_pointer_for(slot) < top);
    }
}
