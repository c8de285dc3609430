use serde::Serialize;

/// Modulation classes a collar can transmit.
///
/// CW collars key the carrier itself on and off; AM collars pulse a tone
/// (typically 260 Hz) that amplitude-modulates a continuous carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Modulation {
    Cw,
    Am,
}

impl Modulation {
    /// Integer stored in the `Mod` database column.
    pub fn as_index(self) -> i64 {
        match self {
            Modulation::Cw => 0,
            Modulation::Am => 1,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Modulation::Cw => "CW",
            Modulation::Am => "AM",
        }
    }
}

/// Characteristics of one detected collar.
#[derive(Debug, Clone)]
pub struct Collar {
    /// Index of the demodulated lane where it was found. Only meaningful
    /// within the capture that produced it.
    pub signal_index: usize,
    /// Modulation type.
    pub modulation: Modulation,
    /// Carrier frequency (Hz), snapped to the nearest channel.
    pub frequency: f64,
    /// Number of pulses seen in the capture.
    pub count: usize,
    /// Pulse rate (pulses per minute).
    pub rate: f64,
    /// Mean level across the high portions of the matched pulses.
    pub level: f32,
    /// Matched pulse width (ms).
    pub width: f64,
    /// Longitude of the fix current when the scan completed.
    pub lon: Option<f64>,
    /// Latitude of the fix current when the scan completed.
    pub lat: Option<f64>,
}

impl Collar {
    pub fn description(&self) -> String {
        format!(
            "Freq: {:.3}MHz Type: {}\nCount: {} Rate: {:.2}PPM\nLevel: {:.3} Width: {:.1}ms",
            self.frequency / 1e6,
            self.modulation.description(),
            self.count,
            self.rate,
            self.level,
            self.width,
        )
    }
}
