//! # Monsoon
//!
//! An OpenXR-style runtime server. One long-running process owns
//! the head mounted display, the tracked devices and the Vulkan
//! compositor, and multiplexes client applications onto them over
//! a Unix socket:
//!
//! * `monsoon` - the server core: lifecycle, shared catalogue,
//!   client session and the compositor driver loop.
//! * `squall` - a Vulkan toolkit for compositing layer stacks.
//! * `utils` - logging, fd watching, geometry helpers.

#[macro_use]
extern crate bitflags;

extern crate squall;
extern crate utils;

mod monsoon;
use monsoon::Monsoon;

use std::process::ExitCode;
use std::time::SystemTime;

fn main() -> ExitCode {
    let mut storm = match Monsoon::spin() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("monsoon failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Begin compositor loop...");
    let start = SystemTime::now();
    storm.run_forever();
    let end = SystemTime::now();

    println!(
        "uptime: {}",
        end.duration_since(start).unwrap().as_secs_f32()
    );
    ExitCode::SUCCESS
}
