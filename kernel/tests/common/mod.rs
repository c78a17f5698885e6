//! Shared helpers for the end-to-end tests: inspectable console sinks,
//! channel-fed console input, NOFF image builders and scripted user
//! programs for the machine's executor seam.

// Each test binary links its own copy; not all of them use every helper.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use coracle_kernel::machine::UserCode;
use coracle_kernel::process::noff::{NoffHeader, Segment};
use coracle_kernel::Kernel;

/// Console output sink the test can read back.
#[derive(Clone, Default)]
pub struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().expect("sink lock").clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("sink lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Console input fed byte-by-byte from an mpsc channel; reads block
/// until the test sends a byte, and end-of-input is the sender hanging
/// up.
pub struct ChannelReader(pub Receiver<u8>);

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.0.recv() {
            Ok(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            Err(_) => Ok(0),
        }
    }
}

/// A NOFF image with `code` bytes loaded at virtual address 0.
pub fn image_with_code(code: &[u8]) -> Vec<u8> {
    let mut header = NoffHeader::empty();
    header.code = Segment {
        virtual_addr: 0,
        in_file_addr: NoffHeader::SIZE as i32,
        size: code.len() as i32,
    };
    let mut image = header.to_bytes();
    image.extend_from_slice(code);
    image
}

/// A minimal valid NOFF image (stack only).
pub fn empty_image() -> Vec<u8> {
    image_with_code(&[0; 16])
}

pub type UserFn = Arc<dyn Fn(&Arc<Kernel>) + Send + Sync>;

/// Scripted user programs, one per entry PC, standing in for the MIPS
/// interpreter.
#[derive(Default)]
pub struct ScriptSet {
    programs: BTreeMap<i32, UserFn>,
}

impl ScriptSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, entry: i32, body: impl Fn(&Arc<Kernel>) + Send + Sync + 'static) -> Self {
        self.programs.insert(entry, Arc::new(body));
        self
    }

    pub fn install(self, kernel: &Kernel) {
        kernel.machine.set_executor(Arc::new(self));
    }
}

impl UserCode for ScriptSet {
    fn exec(&self, kernel: &Arc<Kernel>, entry: i32) {
        match self.programs.get(&entry) {
            Some(body) => body(kernel),
            None => panic!("no scripted program at pc {:#x}", entry),
        }
    }
}
