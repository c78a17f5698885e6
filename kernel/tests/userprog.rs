//! End-to-end user-program scenarios: scripted programs running over the
//! real syscall boundary, threads, joins and process launches.

mod common;

use std::sync::mpsc;
use std::sync::Arc;

use common::{empty_image, ChannelReader, ScriptSet, Sink};
use coracle_kernel::fs::HeaderKind;
use coracle_kernel::mm::AddrSpace;
use coracle_kernel::process;
use coracle_kernel::syscall::{raise, Syscall};
use coracle_kernel::{Kernel, KernelOptions};

const MAIN_PC: i32 = 0;
const THREAD_A_PC: i32 = 0x40;
const THREAD_B_PC: i32 = 0x80;
const THREAD_C_PC: i32 = 0xc0;

fn boot_with(input: Option<Box<dyn std::io::Read + Send>>) -> (Arc<Kernel>, Sink) {
    let sink = Sink::default();
    let kernel = Kernel::boot(KernelOptions {
        console_input: input,
        console_output: Box::new(sink.clone()),
        format_disk: true,
        disk_image: None,
    })
    .expect("boot");
    (kernel, sink)
}

fn put_tag(kernel: &Arc<Kernel>, tag: &[u8]) {
    for &byte in tag {
        raise(kernel, Syscall::PutChar, [i32::from(byte), 0, 0, 0]);
    }
}

#[test]
fn test_three_threads_print_tags_and_exit() {
    let (kernel, sink) = boot_with(None);

    ScriptSet::new()
        .at(MAIN_PC, |k| {
            let mut tids = Vec::new();
            for entry in [THREAD_A_PC, THREAD_B_PC, THREAD_C_PC] {
                let tid = raise(k, Syscall::UserThreadCreate, [entry, 0, 0, 0]);
                assert_ne!(tid, -1, "thread creation failed");
                tids.push(tid);
            }
            for tid in tids {
                // The join target may already have exited; either way
                // join returns no earlier than that exit.
                raise(k, Syscall::UserThreadJoin, [tid, 0, 0, 0]);
            }
            raise(k, Syscall::Exit, [0, 0, 0, 0]);
        })
        .at(THREAD_A_PC, |k| {
            put_tag(k, b"ALPHA");
            raise(k, Syscall::UserThreadExit, [0, 0, 0, 0]);
        })
        .at(THREAD_B_PC, |k| {
            put_tag(k, b"BRAVO");
            raise(k, Syscall::UserThreadExit, [0, 0, 0, 0]);
        })
        .at(THREAD_C_PC, |k| {
            put_tag(k, b"DELTA");
            raise(k, Syscall::UserThreadExit, [0, 0, 0, 0]);
        })
        .install(&kernel);

    kernel.launch("tags", &empty_image().as_slice()).expect("launch");
    kernel.run_until_halt();

    let text = sink.text();
    for tag in ["ALPHA", "BRAVO", "DELTA"] {
        assert_eq!(text.matches(tag).count(), 1, "tag {} in {:?}", tag, text);
    }
    assert!(kernel.has_halted());
    assert_eq!(kernel.exit_status(), Some(0));
}

#[test]
fn test_fork_exec_twice_runs_both_to_completion() {
    let (kernel, sink) = boot_with(None);

    ScriptSet::new()
        .at(MAIN_PC, |k| {
            raise(k, Syscall::PutChar, [i32::from(b'P'), 0, 0, 0]);
            raise(k, Syscall::Exit, [0, 0, 0, 0]);
        })
        .install(&kernel);

    // Place the executable in the filesystem, as ForkExec loads by name.
    let image = empty_image();
    kernel
        .filesystem
        .create("prog", HeaderKind::Regular, image.len())
        .expect("create prog");
    let file = kernel.filesystem.open("prog").expect("open prog");
    assert_eq!(file.write_at(&image, 0), image.len());

    assert_eq!(process::fork_exec(&kernel, "prog"), 0);
    assert_eq!(process::fork_exec(&kernel, "prog"), 0);

    // Both images ran to completion and the counter drained.
    assert_eq!(sink.text(), "PP");
    assert_eq!(kernel.live_processes(), 0);
    assert!(!kernel.has_halted());
}

#[test]
fn test_start_user_program_from_filesystem() {
    let (kernel, sink) = boot_with(None);

    ScriptSet::new()
        .at(MAIN_PC, |k| {
            put_tag(k, b"BOOT\n");
            raise(k, Syscall::Exit, [7, 0, 0, 0]);
        })
        .install(&kernel);

    let image = empty_image();
    kernel
        .filesystem
        .create("init", HeaderKind::Regular, image.len())
        .expect("create init");
    let file = kernel.filesystem.open("init").expect("open init");
    assert_eq!(file.write_at(&image, 0), image.len());

    kernel.start_user_program("init").expect("start");
    kernel.run_until_halt();

    assert_eq!(sink.text(), "BOOT\n");
    assert_eq!(kernel.exit_status(), Some(7));
}

#[test]
fn test_fork_exec_missing_file_fails() {
    let (kernel, _sink) = boot_with(None);
    assert_eq!(process::fork_exec(&kernel, "nothere"), -1);
    assert_eq!(kernel.live_processes(), 0);
}

#[test]
fn test_join_on_self_fails_and_thread_continues() {
    let (kernel, sink) = boot_with(None);

    ScriptSet::new()
        .at(MAIN_PC, |k| {
            let tid = raise(k, Syscall::UserThreadCreate, [THREAD_A_PC, 0, 0, 0]);
            assert_ne!(tid, -1);
            raise(k, Syscall::Exit, [0, 0, 0, 0]);
        })
        .at(THREAD_A_PC, |k| {
            // First user thread always lands in slot 4.
            let self_join = raise(k, Syscall::UserThreadJoin, [4, 0, 0, 0]);
            if self_join == -1 {
                raise(k, Syscall::PutChar, [i32::from(b'S'), 0, 0, 0]);
            }
            let main_join = raise(k, Syscall::UserThreadJoin, [0, 0, 0, 0]);
            if main_join == -1 {
                raise(k, Syscall::PutChar, [i32::from(b'Z'), 0, 0, 0]);
            }
            raise(k, Syscall::UserThreadExit, [0, 0, 0, 0]);
        })
        .install(&kernel);

    kernel.launch("selfjoin", &empty_image().as_slice()).expect("launch");
    kernel.run_until_halt();

    assert_eq!(sink.text(), "SZ");
    assert_eq!(kernel.exit_status(), Some(0));
}

#[test]
fn test_join_returns_after_target_exit() {
    // One byte of input, sent ahead: the worker blocks on GetChar (or
    // finds the byte already there), prints, exits; only then can the
    // main thread's join return and print.
    let (tx, rx) = mpsc::channel();
    tx.send(b'\n').expect("send");
    let (kernel, sink) = boot_with(Some(Box::new(ChannelReader(rx))));

    ScriptSet::new()
        .at(MAIN_PC, |k| {
            let tid = raise(k, Syscall::UserThreadCreate, [THREAD_A_PC, 0, 0, 0]);
            assert_ne!(tid, -1);
            raise(k, Syscall::UserThreadJoin, [tid, 0, 0, 0]);
            raise(k, Syscall::PutChar, [i32::from(b'M'), 0, 0, 0]);
            raise(k, Syscall::Exit, [0, 0, 0, 0]);
        })
        .at(THREAD_A_PC, |k| {
            raise(k, Syscall::GetChar, [0, 0, 0, 0]);
            raise(k, Syscall::PutChar, [i32::from(b'X'), 0, 0, 0]);
            raise(k, Syscall::UserThreadExit, [0, 0, 0, 0]);
        })
        .install(&kernel);

    kernel.launch("joinwait", &empty_image().as_slice()).expect("launch");
    kernel.run_until_halt();

    assert_eq!(sink.text(), "XM");
    assert_eq!(kernel.exit_status(), Some(0));
}

#[test]
fn test_thread_capacity_and_release() {
    // Children block on console input, so slots stay claimed until the
    // driver feeds bytes.
    let (tx, rx) = mpsc::channel();
    let (kernel, _sink) = boot_with(Some(Box::new(ChannelReader(rx))));

    ScriptSet::new()
        .at(THREAD_A_PC, |k| {
            raise(k, Syscall::GetChar, [0, 0, 0, 0]);
            raise(k, Syscall::UserThreadExit, [0, 0, 0, 0]);
        })
        .install(&kernel);

    // The driver acts as the process main thread.
    let image = empty_image();
    let space = AddrSpace::load(
        &image.as_slice(),
        &kernel.machine,
        &kernel.frames,
        &kernel.scheduler,
    )
    .expect("load");
    let driver = kernel.scheduler.current_tid();
    kernel.scheduler.set_space(driver, Some(Arc::clone(&space)));

    let capacity = coracle_kernel::mm::MAX_USER_THREADS / coracle_kernel::mm::NUM_THREAD_PAGES - 1;
    for n in 0..capacity {
        let slot = process::do_user_thread_create(&kernel, THREAD_A_PC, n as i32);
        assert_ne!(slot, -1, "creation {} failed", n);
    }
    assert_eq!(space.num_threads(), capacity);

    // The stack map is full now.
    assert_eq!(process::do_user_thread_create(&kernel, THREAD_A_PC, 0), -1);

    // Release one thread; its slot becomes available again.
    tx.send(b'\n').expect("send");
    while space.num_threads() == capacity {
        kernel.scheduler.yield_now();
    }
    assert_ne!(process::do_user_thread_create(&kernel, THREAD_A_PC, 0), -1);

    // Drain the rest so every thread exits cleanly.
    for _ in 0..capacity {
        tx.send(b'\n').expect("send");
    }
    while space.num_threads() > 0 {
        kernel.scheduler.yield_now();
    }
}
