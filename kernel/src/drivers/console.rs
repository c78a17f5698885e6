//! Synchronous console
//!
//! Wraps the raw character device behind blocking, mutually exclusive
//! calls. Two counting semaphores, signalled by the device's completion
//! callbacks, park the caller until a byte has gone out or come in; one
//! mutex semaphore serializes writers. The read path takes the mutex
//! only around multi-character reads, so single-character reads preserve
//! plain device order.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::machine::Console;
use crate::sched::{Scheduler, Semaphore};

/// End-of-input sentinel returned by [`SynchConsole::get_char`].
pub const EOF: i32 = -1;

/// Longest console line bufferable by the string calls.
pub const CONSOLE_LINE_MAX: usize = 256;

/// The blocking console.
pub struct SynchConsole {
    console: Console,
    read_avail: Arc<Semaphore>,
    write_done: Arc<Semaphore>,
    mutex: Semaphore,
}

impl SynchConsole {
    /// Wrap a console device over the given input and output streams.
    pub fn new(
        input: Option<Box<dyn Read + Send>>,
        output: Box<dyn Write + Send>,
        sched: &Arc<Scheduler>,
    ) -> Self {
        let read_avail = Arc::new(Semaphore::new("read avail", Arc::clone(sched), 0));
        let write_done = Arc::new(Semaphore::new("write done", Arc::clone(sched), 0));
        let on_read = Arc::clone(&read_avail);
        let on_write = Arc::clone(&write_done);
        let console = Console::new(
            input,
            output,
            Box::new(move || on_read.v()),
            Box::new(move || on_write.v()),
        );
        Self {
            console,
            read_avail,
            write_done,
            mutex: Semaphore::new("console mutex", Arc::clone(sched), 1),
        }
    }

    /// Write one byte, blocking until the device acknowledges it.
    pub fn put_char(&self, byte: u8) {
        self.mutex.p();
        self.console.put_char(byte);
        self.write_done.p();
        self.mutex.v();
    }

    /// Read one byte, blocking until the device has one; [`EOF`] at end
    /// of input. End-of-input is sticky: later reads also see it.
    pub fn get_char(&self) -> i32 {
        self.read_avail.p();
        match self.console.get_char() {
            Some(byte) => i32::from(byte),
            None => {
                // Keep the EOF signal available for the next reader.
                self.read_avail.v();
                EOF
            }
        }
    }

    /// Write bytes up to (not including) a NUL, one acknowledged
    /// character at a time.
    pub fn put_string(&self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == 0 {
                break;
            }
            self.put_char(byte);
        }
    }

    /// Read up to `n - 1` bytes, stopping after a newline (which is
    /// kept) or at end of input. The console mutex is held for the whole
    /// line so concurrent readers cannot interleave.
    pub fn get_string(&self, n: usize) -> Vec<u8> {
        let mut line = Vec::new();
        if n < 2 {
            return line;
        }
        self.mutex.p();
        while line.len() < n - 1 {
            let c = self.get_char();
            if c == EOF {
                break;
            }
            line.push(c as u8);
            if c == i32::from(b'\n') {
                break;
            }
        }
        self.mutex.v();
        line
    }

    /// Write a decimal integer.
    pub fn put_int(&self, value: i32) {
        let digits = value.to_string();
        self.put_string(digits.as_bytes());
    }

    /// Read a line and parse a leading decimal integer; unparseable text
    /// yields 0. An empty line can only mean end of input, which the
    /// integer calls cannot represent.
    pub fn get_int(&self) -> i32 {
        let line = self.get_string(CONSOLE_LINE_MAX);
        assert!(!line.is_empty(), "console input ended before an integer");
        parse_leading_int(&line)
    }
}

fn parse_leading_int(line: &[u8]) -> i32 {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_start();
    let negative = trimmed.starts_with('-');
    let digits: String = trimmed
        .chars()
        .skip(usize::from(negative))
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return 0;
    }
    let magnitude: i64 = digits.parse().unwrap_or(i64::from(i32::MAX));
    let signed = if negative { -magnitude } else { magnitude };
    signed.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use std::sync::Mutex as HostMutex;

    /// Shared byte sink the tests can inspect.
    #[derive(Clone, Default)]
    struct Sink(Arc<HostMutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("sink").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn console_over(input: &'static [u8]) -> (SynchConsole, Sink) {
        let machine = Arc::new(Machine::new());
        let sched = Scheduler::new(machine);
        sched.adopt_main("test");
        let sink = Sink::default();
        let console = SynchConsole::new(
            Some(Box::new(input)),
            Box::new(sink.clone()),
            &sched,
        );
        (console, sink)
    }

    #[test]
    fn test_put_string_stops_at_nul() {
        let (console, sink) = console_over(b"");
        console.put_string(b"ok\0junk");
        assert_eq!(*sink.0.lock().expect("sink"), b"ok");
    }

    #[test]
    fn test_get_string_keeps_newline() {
        let (console, _sink) = console_over(b"one\ntwo\n");
        assert_eq!(console.get_string(64), b"one\n");
        assert_eq!(console.get_string(64), b"two\n");
    }

    #[test]
    fn test_get_string_bounded() {
        let (console, _sink) = console_over(b"abcdefgh");
        assert_eq!(console.get_string(4), b"abc");
    }

    #[test]
    fn test_eof_is_sticky() {
        let (console, _sink) = console_over(b"x");
        assert_eq!(console.get_char(), i32::from(b'x'));
        assert_eq!(console.get_char(), EOF);
        assert_eq!(console.get_char(), EOF);
    }

    #[test]
    fn test_put_int_formats_negative() {
        let (console, sink) = console_over(b"");
        console.put_int(-512);
        assert_eq!(*sink.0.lock().expect("sink"), b"-512");
    }

    #[test]
    fn test_get_int_parses_leading_decimal() {
        let (console, _sink) = console_over(b"  42abc\n-7\nxyz\n");
        assert_eq!(console.get_int(), 42);
        assert_eq!(console.get_int(), -7);
        assert_eq!(console.get_int(), 0);
    }
}
