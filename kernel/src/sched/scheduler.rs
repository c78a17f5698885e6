//! The baton scheduler
//!
//! A thread table and a FIFO ready queue behind one spin lock. A context
//! switch saves the machine register file and installed page table into
//! the outgoing thread's entry and restores the incoming thread's before
//! handing over the baton, so user-visible machine state is per kernel
//! thread, the way the real hardware's state is per context.
//!
//! The table also carries the per-thread kernel bookkeeping the
//! user-thread layer needs: the owning address space, the thread's stack
//! slot, and the slot it is currently joined on.

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex as HostMutex, PoisonError};

use spin::Mutex;

use crate::machine::{Machine, MachineContext};
use crate::mm::addr_space::AddrSpace;

/// Kernel thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

thread_local! {
    static CURRENT_TID: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// One-permit parking spot for a host thread waiting for the baton.
struct Parker {
    permit: HostMutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            permit: HostMutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn park(&self) {
        let mut permit = self.permit.lock().unwrap_or_else(PoisonError::into_inner);
        while !*permit {
            permit = self.cv.wait(permit).unwrap_or_else(PoisonError::into_inner);
        }
        *permit = false;
    }

    fn unpark(&self) {
        *self.permit.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_one();
    }
}

struct ThreadEntry {
    name: String,
    parker: Arc<Parker>,
    context: MachineContext,
    space: Option<Arc<AddrSpace>>,
    /// Stack slot owned by this thread; 0 for a process main thread.
    init_stack_reg: usize,
    /// Stack slot this thread is currently joined on.
    dependent_tid: Option<usize>,
}

struct SchedState {
    threads: BTreeMap<ThreadId, ThreadEntry>,
    ready: VecDeque<ThreadId>,
    running: Option<ThreadId>,
    next_tid: u64,
}

/// The cooperative scheduler.
pub struct Scheduler {
    machine: Arc<Machine>,
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub fn new(machine: Arc<Machine>) -> Arc<Self> {
        Arc::new(Self {
            machine,
            state: Mutex::new(SchedState {
                threads: BTreeMap::new(),
                ready: VecDeque::new(),
                running: None,
                next_tid: 0,
            }),
        })
    }

    /// Adopt the calling host thread as a kernel thread holding the
    /// baton. Called once per kernel by the driving thread.
    pub fn adopt_main(&self, name: &str) -> ThreadId {
        let mut st = self.state.lock();
        let tid = ThreadId(st.next_tid);
        st.next_tid += 1;
        st.threads.insert(
            tid,
            ThreadEntry {
                name: name.to_owned(),
                parker: Arc::new(Parker::new()),
                context: MachineContext::zeroed(),
                space: None,
                init_stack_reg: 0,
                dependent_tid: None,
            },
        );
        assert!(st.running.is_none(), "adopt_main with a thread running");
        st.running = Some(tid);
        drop(st);
        CURRENT_TID.set(Some(tid));
        tid
    }

    /// The kernel thread the caller is running as. Panics off-thread:
    /// device callbacks have no thread identity.
    pub fn current_tid(&self) -> ThreadId {
        CURRENT_TID
            .get()
            .expect("not running on a kernel thread")
    }

    /// Create a kernel thread and put it on the ready queue. The new
    /// thread inherits the forker's address space (a process main thread
    /// gets its own installed explicitly before it first runs).
    pub fn fork(self: &Arc<Self>, name: &str, body: impl FnOnce() + Send + 'static) -> ThreadId {
        let parker = Arc::new(Parker::new());
        let mut st = self.state.lock();
        let tid = ThreadId(st.next_tid);
        st.next_tid += 1;
        let inherited = st
            .running
            .and_then(|cur| st.threads.get(&cur))
            .and_then(|entry| entry.space.clone());
        // The child's first restore must install the space's page table,
        // not an empty one.
        let mut context = MachineContext::zeroed();
        context.page_table = inherited.as_ref().map(|space| space.page_table_ref());
        st.threads.insert(
            tid,
            ThreadEntry {
                name: name.to_owned(),
                parker: Arc::clone(&parker),
                context,
                space: inherited,
                init_stack_reg: 0,
                dependent_tid: None,
            },
        );
        st.ready.push_back(tid);
        drop(st);

        let sched = Arc::clone(self);
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                CURRENT_TID.set(Some(tid));
                parker.park();
                body();
                sched.finish_current();
            })
            .expect("failed to spawn kernel thread");
        log::debug!(target: "sched", "forked thread {} ({})", tid, name);
        tid
    }

    /// Give the baton to the next ready thread, if any, and requeue the
    /// caller. With an empty ready queue the caller just keeps running.
    pub fn yield_now(&self) {
        let me = self.current_tid();
        let mut st = self.state.lock();
        let Some(next) = st.ready.pop_front() else {
            return;
        };
        if next == me {
            // A device wakeup readied the caller while it was running;
            // consuming it here keeps the baton where it is.
            return;
        }
        st.ready.push_back(me);
        self.pass_baton(&mut st, me, next);
        drop(st);
        self.wait_for_baton(me);
    }

    /// Suspend the caller without requeueing it (it is parked on some
    /// semaphore's wait list). With nothing ready the baton goes idle
    /// until a device completion wakes a waiter.
    pub fn sleep_current(&self) {
        let me = self.current_tid();
        let mut st = self.state.lock();
        match st.ready.pop_front() {
            // A device wakeup beat the sleep; the caller stays running
            // and re-checks whatever it was about to sleep for.
            Some(next) if next == me => {}
            Some(next) => {
                self.pass_baton(&mut st, me, next);
                drop(st);
                self.wait_for_baton(me);
            }
            None => {
                self.save_current(&mut st, me);
                st.running = None;
                log::trace!(target: "sched", "baton idle, {} sleeping", me);
                drop(st);
                self.wait_for_baton(me);
            }
        }
    }

    /// Make `tid` runnable again. From a kernel thread this queues it;
    /// from device context with an idle baton it is scheduled directly.
    pub fn wake(&self, tid: ThreadId) {
        let mut st = self.state.lock();
        if !st.threads.contains_key(&tid) {
            return;
        }
        if st.running.is_none() {
            debug_assert!(st.ready.is_empty(), "idle baton with ready threads");
            st.running = Some(tid);
            let entry = &st.threads[&tid];
            self.machine.restore_context(&entry.context);
            let parker = Arc::clone(&entry.parker);
            drop(st);
            parker.unpark();
        } else {
            st.ready.push_back(tid);
        }
    }

    /// Retire the calling thread. Its table entry (and with it the last
    /// per-thread reference to the address space) is dropped, the baton
    /// moves on, and the host thread parks forever.
    pub fn finish_current(&self) -> ! {
        let me = self.current_tid();
        let mut st = self.state.lock();
        let entry = st.threads.remove(&me).expect("finishing unknown thread");
        log::debug!(target: "sched", "thread {} ({}) finished", me, entry.name);
        drop(entry);
        // A stray device wakeup may have readied the caller itself.
        st.ready.retain(|&tid| tid != me);
        match st.ready.pop_front() {
            Some(next) => {
                st.running = Some(next);
                let next_entry = &st.threads[&next];
                self.machine.restore_context(&next_entry.context);
                let parker = Arc::clone(&next_entry.parker);
                drop(st);
                parker.unpark();
            }
            None => {
                st.running = None;
                drop(st);
            }
        }
        // The carrying host thread has nothing left to run.
        loop {
            std::thread::park();
        }
    }

    fn save_current(&self, st: &mut SchedState, me: ThreadId) {
        let ctx = self.machine.save_context();
        if let Some(entry) = st.threads.get_mut(&me) {
            entry.context = ctx;
        }
    }

    fn pass_baton(&self, st: &mut SchedState, me: ThreadId, next: ThreadId) {
        debug_assert_ne!(me, next, "switching to self");
        self.save_current(st, me);
        st.running = Some(next);
        let entry = &st.threads[&next];
        self.machine.restore_context(&entry.context);
        entry.parker.unpark();
    }

    fn wait_for_baton(&self, me: ThreadId) {
        let parker = {
            let st = self.state.lock();
            match st.threads.get(&me) {
                Some(entry) => Arc::clone(&entry.parker),
                None => return,
            }
        };
        parker.park();
    }

    // ----- per-thread kernel state -------------------------------------

    /// Address space of the calling thread.
    pub fn current_space(&self) -> Option<Arc<AddrSpace>> {
        let me = self.current_tid();
        self.state
            .lock()
            .threads
            .get(&me)
            .and_then(|e| e.space.clone())
    }

    /// Attach (or detach) an address space on a thread.
    pub fn set_space(&self, tid: ThreadId, space: Option<Arc<AddrSpace>>) {
        if let Some(entry) = self.state.lock().threads.get_mut(&tid) {
            entry.space = space;
        }
    }

    /// Drop the calling thread's reference to its address space.
    pub fn clear_current_space(&self) {
        let me = self.current_tid();
        let dropped = self
            .state
            .lock()
            .threads
            .get_mut(&me)
            .and_then(|e| e.space.take());
        drop(dropped);
    }

    pub fn init_stack_reg_of(&self, tid: ThreadId) -> usize {
        self.state
            .lock()
            .threads
            .get(&tid)
            .map_or(0, |e| e.init_stack_reg)
    }

    pub fn set_current_init_stack_reg(&self, slot: usize) {
        let me = self.current_tid();
        if let Some(entry) = self.state.lock().threads.get_mut(&me) {
            entry.init_stack_reg = slot;
        }
    }

    pub fn current_init_stack_reg(&self) -> usize {
        self.init_stack_reg_of(self.current_tid())
    }

    pub fn current_dependent_tid(&self) -> Option<usize> {
        let me = self.current_tid();
        self.state
            .lock()
            .threads
            .get(&me)
            .and_then(|e| e.dependent_tid)
    }

    pub fn set_current_dependent_tid(&self, slot: Option<usize>) {
        let me = self.current_tid();
        if let Some(entry) = self.state.lock().threads.get_mut(&me) {
            entry.dependent_tid = slot;
        }
    }
}
