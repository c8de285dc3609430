//! Capture worker: drives the SDR, fills the sample buffer and runs the
//! scan and detect stages over each capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;

use harrier_core::events::{Event, Post};
use harrier_core::settings::Settings;
use harrier_core::status::{unix_now, ScanState};
use harrier_dsp::constants::SAMPLE_RATE;
use harrier_dsp::detect::Detect;
use harrier_dsp::sample_buffer::CaptureBuffer;
use harrier_dsp::scan::Scan;

use crate::sdr::{DriverFactory, SdrDriver, SdrTuning};

/// Handle onto the capture worker thread.
///
/// The worker idles until [`Receive::receive`] is called, then runs one
/// capture-scan-detect cycle and posts `ScanDone`. A request arriving while
/// a cycle is in flight is discarded; a gap in coverage is preferred over a
/// queue.
pub struct Receive {
    flags: Arc<Flags>,
    thread: Option<thread::JoinHandle<()>>,
}

struct Flags {
    receive: AtomicBool,
    cancel: AtomicBool,
}

impl Receive {
    pub fn start(settings: Arc<Mutex<Settings>>, post: Post, factory: DriverFactory) -> Self {
        let flags = Arc::new(Flags {
            receive: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        });

        let thread = thread::Builder::new()
            .name("receive".to_string())
            .spawn({
                let flags = flags.clone();
                move || {
                    let mut worker = Worker {
                        settings,
                        post,
                        factory,
                        flags,
                        buffer: CaptureBuffer::new(),
                        driver: None,
                    };
                    worker.run();
                }
            })
            .expect("spawning the capture worker cannot fail");

        Self {
            flags,
            thread: Some(thread),
        }
    }

    /// Requests a capture. Ignored while one is already in flight.
    pub fn receive(&self) {
        self.flags.receive.store(true, Ordering::SeqCst);
    }

    /// Cancels whatever is in flight and stops the worker.
    pub fn stop(mut self) {
        self.flags.cancel.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Worker {
    settings: Arc<Mutex<Settings>>,
    post: Post,
    factory: DriverFactory,
    flags: Arc<Flags>,
    buffer: CaptureBuffer,
    driver: Option<Box<dyn SdrDriver>>,
}

impl Worker {
    fn run(&mut self) {
        while !self.cancelled() {
            if self.flags.receive.swap(false, Ordering::SeqCst) {
                self.capture();
                // A request that arrived mid-cycle is stale; drop it
                self.flags.receive.store(false, Ordering::SeqCst);
            } else {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.flags.cancel.load(Ordering::SeqCst)
    }

    fn capture(&mut self) {
        self.post.send(Event::Status(ScanState::Capture));

        let (freq_mhz, tuning) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.freq,
                SdrTuning {
                    sample_rate: SAMPLE_RATE as u32,
                    centre_freq: (settings.freq * 1e6) as u32,
                    gain: settings.gain,
                    index: settings.recv_index,
                },
            )
        };

        if self.driver.is_none() {
            match (self.factory)(&tuning) {
                Ok(driver) => self.driver = Some(driver),
                Err(e) => {
                    self.post.send(Event::Error(format!("Capture failed: {e}")));
                    return;
                }
            }
        }

        let timestamp = unix_now();

        // Stream the capture into the buffer, one ring position per chunk
        self.buffer.reset();
        let chunk_bytes = self.buffer.block_bytes();
        let result = {
            let buffer = &mut self.buffer;
            let flags = &self.flags;
            let Some(driver) = self.driver.as_mut() else {
                return;
            };
            driver.read_async(chunk_bytes, &mut |chunk| {
                if flags.cancel.load(Ordering::SeqCst) {
                    return false;
                }
                !buffer.write_block(chunk)
            })
        };
        if let Err(e) = result {
            self.post.send(Event::Error(format!("Capture failed: {e}")));
            return;
        }
        if self.cancelled() {
            return;
        }

        self.post.send(Event::Status(ScanState::Process));

        let iq = self.buffer.to_complex();
        if self.cancelled() {
            return;
        }

        let peaks = match Scan::new(SAMPLE_RATE as f64, &iq).search() {
            Ok(peaks) => peaks,
            Err(e) => {
                self.post.send(Event::Error(format!("Capture failed: {e}")));
                return;
            }
        };
        debug!("scan found {} peaks", peaks.len());
        if self.cancelled() {
            return;
        }

        let frequencies: Vec<f32> = peaks.iter().map(|p| p.frequency).collect();
        let mut detect = Detect::new(SAMPLE_RATE as f64, &iq, frequencies);
        let collars = match detect.search(freq_mhz * 1e6) {
            Ok(collars) => collars,
            Err(e) => {
                self.post.send(Event::Error(format!("Capture failed: {e}")));
                return;
            }
        };

        self.post.send(Event::Status(ScanState::Idle));
        self.post.send(Event::ScanDone { collars, timestamp });
    }
}
