use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use harrier_dsp::collar::Collar;

use crate::nmea::SatelliteView;
use crate::status::ScanState;

/// Events consumed by the orchestrator loop.
///
/// Every thread in the receiver publishes by posting one of these onto the
/// single queue; the orchestrator is the only consumer.
#[derive(Debug)]
pub enum Event {
    /// Request a capture. Gated on a recent GPS fix.
    ScanStart,
    /// A capture finished processing. `timestamp` is the capture start time
    /// in unix seconds.
    ScanDone {
        collars: Vec<Collar>,
        timestamp: i64,
    },
    /// (Re)open the GPS serial port.
    GpsOpen,
    GpsLocation {
        lon: f64,
        lat: f64,
    },
    GpsSatellites(SatelliteView),
    GpsError(String),
    /// The capture worker moved to a new state.
    Status(ScanState),
    /// Remote command: automatic scan delay in seconds, None disables.
    SetDelay(Option<f64>),
    /// Remote command: centre frequency in MHz.
    SetFrequency(f64),
    /// Remote command: GPS serial port for the next open.
    SetGpsPort(String),
    Info(String),
    Warning(String),
    /// Fatal; the orchestrator logs it and shuts down.
    Error(String),
}

/// Posts events onto the orchestrator queue, immediately or after a delay.
#[derive(Clone)]
pub struct Post {
    tx: Sender<Event>,
}

impl Post {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }

    /// Sends are infallible from the producer's point of view; a closed
    /// queue means the receiver is shutting down and the event is moot.
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Posts the event after `delay` from a one-shot timer thread.
    pub fn send_delayed(&self, event: Event, delay: Duration) {
        let tx = self.tx.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = tx.send(event);
        });
    }
}

/// Creates the orchestrator queue and a poster for it.
pub fn channel() -> (Post, Receiver<Event>) {
    let (tx, rx) = mpsc::channel();
    (Post::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_post_arrives_after_immediate() {
        let (post, rx) = channel();
        post.send_delayed(Event::ScanStart, Duration::from_millis(50));
        post.send(Event::GpsOpen);

        assert!(matches!(rx.recv().unwrap(), Event::GpsOpen));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Event::ScanStart
        ));
    }
}
