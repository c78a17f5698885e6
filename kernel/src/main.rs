//! Demo driver
//!
//! Boots a kernel over a freshly formatted disk and exercises the
//! filesystem from the console: creates a few files and a directory,
//! navigates it, and prints listings. Running MIPS binaries needs an
//! instruction simulator plugged into the `UserCode` seam, which this
//! demo does not carry.

use coracle_kernel::fs::HeaderKind;
use coracle_kernel::{Kernel, KernelOptions};

fn main() {
    coracle_kernel::logger::init();
    let kernel = match Kernel::boot(KernelOptions::default()) {
        Ok(kernel) => kernel,
        Err(err) => {
            eprintln!("boot failed: {}", err);
            std::process::exit(1);
        }
    };

    let fs = &kernel.filesystem;
    println!("formatted disk, {} sectors free", fs.free_sectors());

    if let Err(err) = fs.create("hello", HeaderKind::Regular, 64) {
        eprintln!("create failed: {}", err);
        std::process::exit(1);
    }
    if let Some(file) = fs.open("hello") {
        file.write_at(b"coracle was here", 0);
    }
    if let Err(err) = fs.create_directory("docs") {
        eprintln!("mkdir failed: {}", err);
        std::process::exit(1);
    }

    println!("/: {}", fs.list().join(" "));
    if fs.change_directory("docs").is_ok() {
        println!("/docs: {}", fs.list().join(" "));
        let _ = fs.change_directory("..");
    }

    println!("{} sectors free", fs.free_sectors());
}
