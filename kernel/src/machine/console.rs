//! Simulated console device
//!
//! Character-at-a-time input and output with completion callbacks. Input
//! arrives through a pump thread that reads one byte from the backing
//! reader, parks it in a single-byte device buffer and fires the
//! read-available handler; it fetches the next byte only after the kernel
//! consumed the previous one, so device order is preserved. Output is
//! written through immediately and acknowledged with the write-done
//! handler, one byte per call.

use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Device completion callback (signals a kernel semaphore).
pub type IoHandler = Box<dyn Fn() + Send + Sync>;

struct InputBuffer {
    pending: Option<u8>,
    eof: bool,
}

/// The raw console device.
pub struct Console {
    output: spin::Mutex<Box<dyn Write + Send>>,
    write_done: IoHandler,
    input: Arc<(Mutex<InputBuffer>, Condvar)>,
}

impl Console {
    /// Build the device. `input` of `None` models a console with no
    /// attached input (reads see immediate end-of-file).
    pub fn new(
        input: Option<Box<dyn Read + Send>>,
        output: Box<dyn Write + Send>,
        read_avail: IoHandler,
        write_done: IoHandler,
    ) -> Self {
        let buffer = Arc::new((
            Mutex::new(InputBuffer {
                pending: None,
                eof: input.is_none(),
            }),
            Condvar::new(),
        ));
        match input {
            Some(reader) => spawn_pump(reader, Arc::clone(&buffer), read_avail),
            None => read_avail(),
        }
        Self {
            output: spin::Mutex::new(output),
            write_done,
            input: buffer,
        }
    }

    /// Write one byte and acknowledge through the write-done handler.
    pub fn put_char(&self, byte: u8) {
        {
            let mut out = self.output.lock();
            let _ = out.write_all(&[byte]);
            let _ = out.flush();
        }
        (self.write_done)();
    }

    /// Take the buffered input byte. `None` means end-of-file; the
    /// caller must only call this after the read-available handler fired.
    pub fn get_char(&self) -> Option<u8> {
        let (lock, cv) = &*self.input;
        let mut buf = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let byte = buf.pending.take();
        if byte.is_some() {
            // Let the pump fetch the next byte.
            cv.notify_one();
        }
        byte
    }
}

fn spawn_pump(
    mut reader: Box<dyn Read + Send>,
    buffer: Arc<(Mutex<InputBuffer>, Condvar)>,
    read_avail: IoHandler,
) {
    std::thread::Builder::new()
        .name("console-input".into())
        .spawn(move || {
            let (lock, cv) = &*buffer;
            loop {
                let mut byte = [0u8; 1];
                match reader.read(&mut byte) {
                    Ok(0) | Err(_) => {
                        lock.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .eof = true;
                        read_avail();
                        return;
                    }
                    Ok(_) => {
                        let mut buf = lock.lock().unwrap_or_else(PoisonError::into_inner);
                        buf.pending = Some(byte[0]);
                        drop(buf);
                        read_avail();
                        let mut buf = lock.lock().unwrap_or_else(PoisonError::into_inner);
                        while buf.pending.is_some() {
                            buf = cv.wait(buf).unwrap_or_else(PoisonError::into_inner);
                        }
                    }
                }
            }
        })
        .expect("failed to spawn console pump thread");
}
