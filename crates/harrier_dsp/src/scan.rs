use num::complex::Complex32;

use crate::psd::psd;
use crate::DspError;

/// FFT bins used to search.
pub const SCAN_BINS: usize = 4096;
/// Peak level change (dB).
pub const SCAN_CHANGE: f32 = 2.0;

/// A candidate carrier found by the scan stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Offset from the tuned baseband (Hz).
    pub frequency: f32,
    /// Peak level (dB).
    pub level: f32,
}

/// Searches a capture for spectral peaks worth demodulating.
///
/// A peak must differ by [`SCAN_CHANGE`] from the running extremum on both
/// sides, so a flat noise floor produces no candidates.
pub struct Scan<'a> {
    fs: f64,
    samples: &'a [Complex32],
}

impl<'a> Scan<'a> {
    pub fn new(fs: f64, samples: &'a [Complex32]) -> Self {
        Self { fs, samples }
    }

    /// Returns the frequency offsets of all peaks. An empty list is a valid
    /// result; a capture shorter than one FFT is not.
    pub fn search(&self) -> Result<Vec<Peak>, DspError> {
        if self.samples.len() < SCAN_BINS {
            return Err(DspError::SampleTooShort {
                got: self.samples.len(),
                need: SCAN_BINS,
            });
        }

        let (frequencies, levels) = psd(self.samples, SCAN_BINS, self.fs);
        let decibels: Vec<f32> = levels.iter().map(|l| 10.0 * l.log10()).collect();

        let peaks = peak_detect(&decibels)
            .into_iter()
            .map(|i| Peak {
                frequency: frequencies[i],
                level: decibels[i],
            })
            .collect();

        Ok(peaks)
    }
}

/// One-pass peak detector with symmetric hysteresis.
///
/// Walks the spectrum keeping the running extremum since the last emission.
/// A peak is emitted once the level has fallen [`SCAN_CHANGE`] below the
/// running maximum; the walker then waits for a rise of the same delta above
/// the running minimum before arming again.
fn peak_detect(spectrum: &[f32]) -> Vec<usize> {
    let mut indices = Vec::new();

    let mut index_peak = 0;
    let mut level_min = f32::INFINITY;
    let mut level_max = f32::NEG_INFINITY;
    let mut find_peak = true;

    for (i, &level) in spectrum.iter().enumerate() {
        if level > level_max {
            level_max = level;
            index_peak = i;
        }
        if level < level_min {
            level_min = level;
        }

        if find_peak {
            if level <= level_max - SCAN_CHANGE {
                indices.push(index_peak);
                level_min = level;
                find_peak = false;
            }
        } else if level >= level_min + SCAN_CHANGE {
            level_max = level;
            index_peak = i;
            find_peak = true;
        }
    }

    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_spectrum_has_no_peaks() {
        assert!(peak_detect(&[0.0; 64]).is_empty());
    }

    #[test]
    fn single_peak() {
        let mut spectrum = vec![0.0f32; 16];
        spectrum[8] = 10.0;
        assert_eq!(peak_detect(&spectrum), vec![8]);
    }

    #[test]
    fn small_ripple_is_ignored() {
        // 1 dB ripple stays below the 2 dB hysteresis
        let spectrum: Vec<f32> = (0..64).map(|i| if i % 2 == 0 { 0.0 } else { 1.0 }).collect();
        assert!(peak_detect(&spectrum).is_empty());
    }

    #[test]
    fn two_separated_peaks() {
        let mut spectrum = vec![0.0f32; 32];
        spectrum[8] = 8.0;
        spectrum[24] = 6.0;
        assert_eq!(peak_detect(&spectrum), vec![8, 24]);
    }

    #[test]
    fn short_capture_is_rejected() {
        let samples = vec![Complex32::default(); SCAN_BINS - 1];
        let error = Scan::new(2_400_000.0, &samples).search().unwrap_err();
        assert_eq!(
            error,
            DspError::SampleTooShort {
                got: SCAN_BINS - 1,
                need: SCAN_BINS
            }
        );
    }
}
