//! GPS serial reader thread.
//!
//! Reads `\r`-terminated NMEA sentences and posts fixes and satellite
//! views. Any I/O failure posts `GpsError` and ends the thread; the
//! orchestrator reopens after a delay.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serialport::{DataBits, Parity, StopBits};

use harrier_core::events::{Event, Post};
use harrier_core::nmea::{NmeaParser, Update};
use harrier_core::settings::GpsConfig;

/// Serial read timeout; a silent port is treated as an error.
const TIMEOUT: Duration = Duration::from_secs(2);

pub struct Gps {
    cancel: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Gps {
    pub fn start(config: GpsConfig, post: Post) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new()
            .name("gps".to_string())
            .spawn({
                let cancel = cancel.clone();
                move || {
                    let mut port = match open(&config) {
                        Ok(port) => port,
                        Err(e) => {
                            post.send(Event::GpsError(e.to_string()));
                            return;
                        }
                    };
                    read(port.as_mut(), &post, &cancel);
                }
            })
            .expect("spawning the gps reader cannot fail");

        Self {
            cancel,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open(config: &GpsConfig) -> serialport::Result<Box<dyn serialport::SerialPort>> {
    serialport::new(&config.port, config.baud)
        .data_bits(data_bits(config.bits))
        .parity(parity(&config.parity))
        .stop_bits(stop_bits(config.stops))
        .timeout(TIMEOUT)
        .open()
}

fn read(port: &mut dyn serialport::SerialPort, post: &Post, cancel: &AtomicBool) {
    let mut parser = NmeaParser::new();
    let mut pending = Vec::new();
    let mut buffer = [0u8; 256];

    while !cancel.load(Ordering::SeqCst) {
        let length = match port.read(&mut buffer) {
            Ok(0) => {
                post.send(Event::GpsError("GPS timed out".to_string()));
                return;
            }
            Ok(length) => length,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                post.send(Event::GpsError("GPS timed out".to_string()));
                return;
            }
            Err(e) => {
                post.send(Event::GpsError(e.to_string()));
                return;
            }
        };

        pending.extend_from_slice(&buffer[..length]);
        while let Some(end) = pending.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            handle_line(&mut parser, line.trim(), post);
        }
    }
}

fn handle_line(parser: &mut NmeaParser, line: &str, post: &Post) {
    match parser.feed_line(line) {
        Ok(Update::Location { lon, lat }) => post.send(Event::GpsLocation { lon, lat }),
        Ok(Update::Satellites(sats)) => post.send(Event::GpsSatellites(sats)),
        Ok(Update::None) => {}
        // A corrupt line is dropped, not fatal
        Err(e) => post.send(Event::Warning(e.to_string())),
    }
}

fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn parity(name: &str) -> Parity {
    match name {
        "E" => Parity::Even,
        "O" => Parity::Odd,
        _ => Parity::None,
    }
}

fn stop_bits(stops: f32) -> StopBits {
    if stops == 2.0 {
        StopBits::Two
    } else {
        StopBits::One
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_handling_posts_the_right_events() {
        let (post, rx) = harrier_core::events::channel();
        let mut parser = NmeaParser::new();

        handle_line(
            &mut parser,
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47",
            &post,
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::GpsLocation { .. }
        ));

        handle_line(
            &mut parser,
            "$GPGGA,123519,4808.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47",
            &post,
        );
        assert!(matches!(rx.try_recv().unwrap(), Event::Warning(_)));
    }
}
