//! The kernel context
//!
//! One `Kernel` value owns every subsystem — machine, scheduler, frame
//! provider, disk, filesystem, console — and is threaded explicitly
//! through call paths instead of living in free statics, so several
//! kernels (with separate simulated hardware) can coexist in one host
//! process. The thread calling [`Kernel::boot`] becomes the first kernel
//! thread and keeps driving the simulation.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::drivers::SynchConsole;
use crate::error::{ExecError, KernelResult};
use crate::fs::{FileSystem, SynchDisk};
use crate::machine::Machine;
use crate::mm::{AddrSpace, FrameProvider};
use crate::process::UserThreads;
use crate::sched::{Scheduler, Semaphore, ThreadId};

/// What to wire the kernel's simulated hardware to.
pub struct KernelOptions {
    /// Console input; `None` means the console sees immediate EOF.
    pub console_input: Option<Box<dyn Read + Send>>,
    /// Console output sink.
    pub console_output: Box<dyn Write + Send>,
    /// Lay down a fresh filesystem instead of reopening one.
    pub format_disk: bool,
    /// Prime the disk with a saved platter image.
    pub disk_image: Option<Vec<u8>>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            console_input: None,
            console_output: Box::new(std::io::stdout()),
            format_disk: true,
            disk_image: None,
        }
    }
}

/// The kernel.
pub struct Kernel {
    pub machine: Arc<Machine>,
    pub scheduler: Arc<Scheduler>,
    pub frames: Arc<FrameProvider>,
    pub disk: Arc<SynchDisk>,
    pub filesystem: FileSystem,
    pub console: SynchConsole,
    pub user_threads: UserThreads,
    /// Processes started by `fork_exec` that have not exited.
    nb_proc: AtomicI32,
    halted: AtomicBool,
    halt_event: Semaphore,
    exit_status: Mutex<Option<i32>>,
}

impl Kernel {
    /// Bring the machine up. The calling thread is adopted as the first
    /// kernel thread.
    pub fn boot(options: KernelOptions) -> KernelResult<Arc<Self>> {
        crate::logger::init();
        let machine = Arc::new(Machine::new());
        let scheduler = Scheduler::new(Arc::clone(&machine));
        scheduler.adopt_main("main");

        let disk = match options.disk_image {
            Some(image) => SynchDisk::from_image(&scheduler, image),
            None => SynchDisk::new(&scheduler),
        };
        let filesystem = FileSystem::new(Arc::clone(&disk), options.format_disk)?;
        let console = SynchConsole::new(
            options.console_input,
            options.console_output,
            &scheduler,
        );

        Ok(Arc::new(Self {
            frames: FrameProvider::new(),
            user_threads: UserThreads::new(&scheduler),
            halt_event: Semaphore::new("halt event", Arc::clone(&scheduler), 0),
            machine,
            scheduler,
            disk,
            filesystem,
            console,
            nb_proc: AtomicI32::new(0),
            halted: AtomicBool::new(false),
            exit_status: Mutex::new(None),
        }))
    }

    /// Load an executable image and fork a kernel thread that runs it as
    /// a user program (the driver stays in control; pair with
    /// [`Kernel::run_until_halt`]).
    pub fn launch(self: &Arc<Self>, name: &str, executable: &dyn crate::fs::ReadAt) -> KernelResult<ThreadId> {
        let space = AddrSpace::load(executable, &self.machine, &self.frames, &self.scheduler)?;
        let kernel = Arc::clone(self);
        let tid = self.scheduler.fork(name, move || {
            let space = kernel
                .scheduler
                .current_space()
                .expect("launched thread without an address space");
            space.init_registers(&kernel.machine);
            space.restore_state(&kernel.machine);
            kernel.machine.run(&kernel);
        });
        self.scheduler.set_space(tid, Some(space));
        Ok(tid)
    }

    /// Open `name` in the filesystem and run it as the initial user
    /// program.
    pub fn start_user_program(self: &Arc<Self>, name: &str) -> KernelResult<ThreadId> {
        let executable = self
            .filesystem
            .open(name)
            .ok_or(crate::error::KernelError::Exec(ExecError::NotFound))?;
        self.launch(name, &executable)
    }

    /// Park the driving thread until a user program halts the machine.
    pub fn run_until_halt(&self) {
        self.halt_event.p();
    }

    /// Stop the machine: release the driver and retire the calling
    /// kernel thread.
    pub fn halt(&self) -> ! {
        log::info!(target: "sched", "machine halting");
        self.halted.store(true, Ordering::SeqCst);
        self.halt_event.v();
        self.scheduler.finish_current()
    }

    pub fn has_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Exit status of the most recent `Exit` syscall.
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    pub(crate) fn record_exit_status(&self, status: i32) {
        *self.exit_status.lock() = Some(status);
    }

    // ----- live-process accounting -------------------------------------

    pub(crate) fn process_started(&self) {
        self.nb_proc.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn process_abandoned(&self) {
        self.nb_proc.fetch_sub(1, Ordering::SeqCst);
    }

    /// Decrement for an exiting process; the result decides between
    /// retiring one thread (>= 0) and halting the machine.
    pub(crate) fn process_exited(&self) -> i32 {
        self.nb_proc.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Processes started with `fork_exec` still running.
    pub fn live_processes(&self) -> i32 {
        self.nb_proc.load(Ordering::SeqCst)
    }
}
