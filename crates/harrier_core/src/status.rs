use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::nmea::SatelliteView;

/// Receiver activity states shown on the console and sent to the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    /// Waiting for a recent GPS fix before a scan can start.
    Wait,
    Capture,
    Process,
}

impl ScanState {
    pub fn description(self) -> &'static str {
        match self {
            ScanState::Idle => "Idle",
            ScanState::Wait => "Locate",
            ScanState::Capture => "Capture",
            ScanState::Process => "Process",
        }
    }

    pub fn as_index(self) -> u8 {
        match self {
            ScanState::Idle => 0,
            ScanState::Wait => 1,
            ScanState::Capture => 2,
            ScanState::Process => 3,
        }
    }
}

/// Latest GPS fix with the wall-clock time it arrived.
#[derive(Debug, Clone, Copy)]
pub struct Fix {
    pub lon: f64,
    pub lat: f64,
    /// Unix seconds at arrival.
    pub time: i64,
}

/// Aggregate of everything the console line and the remote viewer see.
///
/// Mutated by the orchestrator and the GPS event path; callers wrap it in a
/// mutex and never hold the lock across I/O.
#[derive(Debug)]
pub struct Status {
    state: ScanState,
    signals: usize,
    fix: Option<Fix>,
    sats: SatelliteView,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            signals: 0,
            fix: None,
            sats: SatelliteView::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn set_state(&mut self, state: ScanState) {
        self.state = state;
    }

    pub fn set_signals(&mut self, signals: usize) {
        self.signals = signals;
    }

    pub fn set_location(&mut self, lon: f64, lat: f64, time: i64) {
        self.fix = Some(Fix { lon, lat, time });
    }

    pub fn set_satellites(&mut self, sats: SatelliteView) {
        self.sats = sats;
    }

    /// Forgets the fix and the satellite view after a GPS error.
    pub fn clear_gps(&mut self) {
        self.fix = None;
        self.sats.clear();
    }

    pub fn fix(&self) -> Option<Fix> {
        self.fix
    }

    /// A fix older than `max_age` seconds no longer gates a scan.
    pub fn fix_valid(&self, max_age: u64) -> bool {
        match self.fix {
            Some(fix) => unix_now() - fix.time <= max_age as i64,
            None => false,
        }
    }

    pub fn satellites(&self) -> &SatelliteView {
        &self.sats
    }

    /// The single console status line, carriage-return prefixed so it
    /// overwrites itself in place.
    pub fn console_line(&self) -> String {
        let mut lon = "        --".to_string();
        let mut lat = "        --".to_string();
        let mut sats = "   --".to_string();
        let mut fix = "      --".to_string();

        if let Some(location) = self.fix {
            lon = format!("{:10.5}", location.lon);
            lat = format!("{:9.5}", location.lat);
            if let Some(time) = Local.timestamp_opt(location.time, 0).single() {
                fix = time.format("%H:%M:%S").to_string();
            }
        }

        if !self.sats.is_empty() {
            let used = self.sats.values().filter(|s| s.used).count();
            sats = format!("{:2}/{:2}", used, self.sats.len());
        }

        format!(
            "\r{:7}  Lon {:11}  Lat {:10}  Sats {:5}  Fix {:8}  Signals {:2}",
            self.state.description(),
            lon,
            lat,
            sats,
            fix,
            self.signals,
        )
    }

    /// The payload for the remote viewer's `Status` push.
    pub fn payload(&self, db_size: u64) -> StatusPayload {
        StatusPayload {
            status: self.state.as_index(),
            signals: self.signals,
            lon: self.fix.map(|f| f.lon),
            lat: self.fix.map(|f| f.lat),
            fix: self.fix.map(|f| f.time),
            size: db_size,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusPayload {
    pub status: u8,
    pub signals: usize,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub fix: Option<i64>,
    pub size: u64,
}

/// Wall clock in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_fix_is_valid() {
        let mut status = Status::new();
        assert!(!status.fix_valid(5));
        status.set_location(11.5, 48.1, unix_now());
        assert!(status.fix_valid(5));
    }

    #[test]
    fn stale_fix_is_invalid() {
        let mut status = Status::new();
        status.set_location(11.5, 48.1, unix_now() - 10);
        assert!(!status.fix_valid(5));
    }

    #[test]
    fn gps_error_clears_the_fix() {
        let mut status = Status::new();
        status.set_location(11.5, 48.1, unix_now());
        status.clear_gps();
        assert!(status.fix().is_none());
        assert!(!status.fix_valid(5));
    }

    #[test]
    fn payload_without_fix_has_empty_coordinates() {
        let payload = Status::new().payload(1024);
        assert_eq!(payload.status, 0);
        assert!(payload.lon.is_none());
        assert_eq!(payload.size, 1024);
    }
}
