//! Test mode: one scan of a synthetic capture, results on stdout.
//!
//! Exercises the whole capture-scan-detect pipeline without hardware, a
//! GPS fix or a database.

use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harrier_core::events::{self, Event};
use harrier_core::settings::Settings;

use crate::receive::Receive;
use crate::sdr::TestSdr;

pub fn run(settings: Settings) -> ExitCode {
    println!("Test mode");

    let freq_mhz = settings.freq;
    let (post, queue) = events::channel();
    let settings = Arc::new(Mutex::new(settings));
    let receive = Receive::start(settings, post.clone(), TestSdr::factory());

    println!("Scanning...");
    receive.receive();

    let code = loop {
        match queue.recv_timeout(Duration::from_secs(120)) {
            Ok(Event::ScanDone { collars, .. }) => {
                println!("Signals:");
                if collars.is_empty() {
                    println!("\tNo signals found");
                } else {
                    for collar in &collars {
                        println!(
                            "\t{:7.3}MHz {:2} {:4.1}PPM, {:4.1}",
                            collar.frequency / 1e6,
                            collar.modulation.description(),
                            collar.rate,
                            collar.level,
                        );
                    }
                }
                break ExitCode::SUCCESS;
            }
            Ok(Event::Warning(message)) => println!("Warning: {message}"),
            Ok(Event::Error(message)) => {
                eprintln!("{message}");
                break ExitCode::from(3);
            }
            Ok(_) => {}
            Err(_) => {
                eprintln!("Test scan timed out (expected a result for {freq_mhz}MHz)");
                break ExitCode::from(3);
            }
        }
    };

    receive.stop();
    code
}
