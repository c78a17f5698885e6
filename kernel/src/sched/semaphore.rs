//! Counting semaphores
//!
//! Classic `p`/`v` with Mesa-style wakeups: `p` re-checks the count after
//! being woken, `v` increments and readies at most one waiter. Kernel
//! threads may call both; device completion callbacks may only call `v`
//! (they have no thread identity to sleep with).

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex;

use super::scheduler::{Scheduler, ThreadId};

struct SemState {
    value: usize,
    waiters: VecDeque<ThreadId>,
}

/// A counting semaphore bound to one scheduler.
pub struct Semaphore {
    name: &'static str,
    sched: Arc<Scheduler>,
    state: Mutex<SemState>,
}

impl Semaphore {
    pub fn new(name: &'static str, sched: Arc<Scheduler>, initial: usize) -> Self {
        Self {
            name,
            sched,
            state: Mutex::new(SemState {
                value: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Wait: decrement the count, sleeping while it is zero.
    pub fn p(&self) {
        loop {
            let mut st = self.state.lock();
            if st.value > 0 {
                st.value -= 1;
                return;
            }
            let me = self.sched.current_tid();
            st.waiters.push_back(me);
            drop(st);
            log::trace!(target: "sched", "{} blocks on {}", me, self.name);
            self.sched.sleep_current();
        }
    }

    /// Signal: increment the count and ready one waiter, if any.
    pub fn v(&self) {
        let waiter = {
            let mut st = self.state.lock();
            st.value += 1;
            st.waiters.pop_front()
        };
        if let Some(tid) = waiter {
            log::trace!(target: "sched", "{} wakes {}", self.name, tid);
            self.sched.wake(tid);
        }
    }
}
