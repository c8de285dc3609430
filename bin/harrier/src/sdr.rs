//! The capture contract an SDR front end has to satisfy, and the drivers
//! that satisfy it.

use std::io;

/// Tuning handed to a driver when it is opened.
#[derive(Debug, Clone, Copy)]
pub struct SdrTuning {
    /// Sample rate (Hz).
    pub sample_rate: u32,
    /// Centre frequency (Hz).
    pub centre_freq: u32,
    /// Tuner gain (dB); None leaves the tuner in automatic.
    pub gain: Option<f64>,
    /// Device index.
    pub index: u32,
}

/// Asynchronous block capture.
///
/// A driver delivers `chunk_bytes`-sized chunks of interleaved IQ bytes to
/// the handler until the handler returns false. The capture worker owns the
/// placement of each chunk; the driver only streams.
pub trait SdrDriver: Send {
    fn read_async(
        &mut self,
        chunk_bytes: usize,
        handler: &mut dyn FnMut(&[u8]) -> bool,
    ) -> io::Result<()>;
}

/// Opens a driver for the given tuning.
pub type DriverFactory = Box<dyn Fn(&SdrTuning) -> io::Result<Box<dyn SdrDriver>> + Send>;

/// Synthetic driver producing a single CW collar: 25 ms pulses at 60 PPM,
/// 150 kHz above the tuned centre. Used by `--test` and by the tests.
pub struct TestSdr {
    sample: u64,
    amplitude: f32,
    offset: f64,
    noise: u64,
}

impl TestSdr {
    const PULSE_PERIOD: f64 = 1.0;
    const PULSE_WIDTH: f64 = 25e-3;

    pub fn new() -> Self {
        Self {
            sample: 0,
            amplitude: 0.8,
            offset: 150_000.0,
            noise: 0x853c49e6748fea9b,
        }
    }

    fn noise_sample(&mut self) -> f32 {
        self.noise = self
            .noise
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.noise >> 33) as f32 / (1u64 << 30) as f32 - 1.0) * 0.01
    }

    pub fn factory() -> DriverFactory {
        Box::new(|_tuning| Ok(Box::new(TestSdr::new()) as Box<dyn SdrDriver>))
    }
}

impl SdrDriver for TestSdr {
    fn read_async(
        &mut self,
        chunk_bytes: usize,
        handler: &mut dyn FnMut(&[u8]) -> bool,
    ) -> io::Result<()> {
        use harrier_dsp::constants::SAMPLE_RATE;

        let fs = SAMPLE_RATE as f64;
        let mut chunk = vec![0u8; chunk_bytes];

        loop {
            for pair in chunk.chunks_exact_mut(2) {
                let t = self.sample as f64 / fs;
                let offset_from_pulse = (t + Self::PULSE_PERIOD / 2.0) % Self::PULSE_PERIOD;
                let keyed = offset_from_pulse < Self::PULSE_WIDTH;

                let (mut re, mut im) = (0.0f32, 0.0f32);
                if keyed {
                    let phase = 2.0
                        * std::f64::consts::PI
                        * (self.sample as f64 * self.offset / fs).fract();
                    re = self.amplitude * phase.cos() as f32;
                    im = self.amplitude * phase.sin() as f32;
                }
                // A deterministic noise floor keeps window leakage buried,
                // as a real front end would
                re += self.noise_sample();
                im += self.noise_sample();

                pair[0] = (re * 127.5 + 127.5).round().clamp(0.0, 255.0) as u8;
                pair[1] = (im * 127.5 + 127.5).round().clamp(0.0, 255.0) as u8;
                self.sample += 1;
            }
            if !handler(&chunk) {
                return Ok(());
            }
        }
    }
}

impl Default for TestSdr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "rtlsdr")]
pub mod rtl {
    //! RTL2832U front end behind the capture contract.

    use std::io;

    use super::{DriverFactory, SdrDriver, SdrTuning};

    pub struct RtlSdr {
        device: rtlsdr::RTLSDRDevice,
    }

    impl RtlSdr {
        pub fn open(tuning: &SdrTuning) -> io::Result<Self> {
            let mut device = rtlsdr::open(tuning.index as i32).map_err(to_io)?;
            device
                .set_sample_rate(tuning.sample_rate)
                .map_err(to_io)?;
            device
                .set_center_freq(tuning.centre_freq)
                .map_err(to_io)?;
            match tuning.gain {
                // The tuner wants tenths of a dB
                Some(gain) => device
                    .set_tuner_gain((gain * 10.0) as i32)
                    .map_err(to_io)?,
                None => device.set_tuner_gain_mode(false).map_err(to_io)?,
            }
            device.reset_buffer().map_err(to_io)?;
            Ok(Self { device })
        }

        pub fn factory() -> DriverFactory {
            Box::new(|tuning| Ok(Box::new(RtlSdr::open(tuning)?) as Box<dyn SdrDriver>))
        }
    }

    impl SdrDriver for RtlSdr {
        fn read_async(
            &mut self,
            chunk_bytes: usize,
            handler: &mut dyn FnMut(&[u8]) -> bool,
        ) -> io::Result<()> {
            loop {
                let chunk = self.device.read_sync(chunk_bytes).map_err(to_io)?;
                if !handler(&chunk) {
                    return Ok(());
                }
            }
        }
    }

    fn to_io(error: rtlsdr::RTLSDRError) -> io::Error {
        io::Error::new(io::ErrorKind::Other, error.to_string())
    }
}

/// The factory for normal operation: real hardware when compiled in.
#[cfg(feature = "rtlsdr")]
pub fn hardware_factory() -> DriverFactory {
    rtl::RtlSdr::factory()
}

/// Without a hardware backend every open fails; `--test` still works.
#[cfg(not(feature = "rtlsdr"))]
pub fn hardware_factory() -> DriverFactory {
    Box::new(|_tuning| {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no SDR backend compiled in; rebuild with --features rtlsdr",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_stops_when_told() {
        let mut driver = TestSdr::new();
        let mut delivered = 0;
        driver
            .read_async(4096, &mut |chunk| {
                assert_eq!(chunk.len(), 4096);
                delivered += 1;
                delivered < 3
            })
            .unwrap();
        assert_eq!(delivered, 3);
    }
}
