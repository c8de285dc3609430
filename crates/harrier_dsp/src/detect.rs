use std::cmp::Ordering;
use std::collections::HashSet;

use itertools::Itertools;
use num::complex::Complex32;
use rustfft::FftPlanner;

use crate::collar::{Collar, Modulation};
use crate::constants::{CHANNEL_SPACE, SAMPLE_TIME};
use crate::DspError;

/// Size of each block to analyse.
pub const DEMOD_BINS: usize = 4096;
/// Valid pulse widths (s).
const PULSE_WIDTHS: [f64; 3] = [10e-3, 25e-3, 64e-3];
/// Pulse width tolerance (+/- %).
const PULSE_WIDTH_TOL: f64 = 75.0;
/// Maximum pulse rate deviation (%).
const PULSE_RATE_DEVIATION: f64 = 15.0;
/// Valid pulse rates (pulses per minute).
const PULSE_RATES: [f64; 3] = [40.0, 60.0, 80.0];
/// Pulse rate tolerance (+/- pulses per minute).
const PULSE_RATE_TOL: f64 = 10.0;
/// Valid AM tones (Hz).
const TONES: [f64; 1] = [260.0];
/// Tolerance of AM tones (%).
const TONE_TOL: f64 = 10.0;
/// Rate tolerance when grouping ghosts (PPM).
const GHOST_RATE_TOL: f64 = 5.0;
/// Correlation above which the weaker of two signals is a ghost.
const GHOST_CORR: f32 = 0.33;
/// Boxcar length used to smooth the demodulated envelopes.
const SMOOTH_LEN: usize = 4;

/// A pulse train matched against the canonical widths and rates.
#[derive(Debug, Clone, Copy)]
struct PulseFit {
    count: usize,
    rate: f64,
    level: f32,
    width: f64,
}

/// Demodulates candidate carriers and classifies their envelopes.
///
/// Each candidate frequency becomes one envelope lane sampled per
/// [`DEMOD_BINS`] chunk. Lanes failing any classification stage are dropped
/// silently; the search result is the surviving collars after ghost
/// suppression.
pub struct Detect<'a> {
    fs: f64,
    samples: &'a [Complex32],
    frequencies: Vec<f32>,
    signals: Vec<Vec<f32>>,
}

impl<'a> Detect<'a> {
    pub fn new(fs: f64, samples: &'a [Complex32], frequencies: Vec<f32>) -> Self {
        Self {
            fs,
            samples,
            frequencies,
            signals: Vec::new(),
        }
    }

    /// Searches the capture and returns all confirmed collars.
    /// `baseband` is the tuned centre frequency in Hz.
    pub fn search(&mut self, baseband: f64) -> Result<Vec<Collar>, DspError> {
        if self.frequencies.is_empty() {
            return Ok(Vec::new());
        }

        let signals = self.demod()?;
        let mut detected = self.classify(&signals, baseband);
        remove_ghosts(&signals, &mut detected);
        self.signals = signals;

        Ok(detected)
    }

    /// Demodulated envelope lanes of the last search, one per candidate.
    pub fn envelopes(&self) -> &[Vec<f32>] {
        &self.signals
    }

    /// Produces one envelope sample per chunk per candidate by taking the
    /// FFT magnitude of the bin nearest each candidate frequency.
    fn demod(&self) -> Result<Vec<Vec<f32>>, DspError> {
        let chunks = self.samples.len() / DEMOD_BINS;
        if chunks == 0 {
            return Err(DspError::SampleTooShort {
                got: self.samples.len(),
                need: DEMOD_BINS,
            });
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(DEMOD_BINS);

        // Candidate offsets resolved once to FFT bins
        let bins: Vec<usize> = self
            .frequencies
            .iter()
            .map(|&f| frequency_bin(f, DEMOD_BINS, self.fs))
            .collect();

        let mut lanes = vec![vec![0.0f32; chunks]; self.frequencies.len()];
        let mut buffer = vec![Complex32::default(); DEMOD_BINS];

        for chunk in 0..chunks {
            let start = chunk * DEMOD_BINS;
            buffer.copy_from_slice(&self.samples[start..start + DEMOD_BINS]);
            fft.process(&mut buffer);

            for (lane, &bin) in lanes.iter_mut().zip(&bins) {
                lane[chunk] = buffer[bin].norm() / DEMOD_BINS as f32;
            }
        }

        for lane in &mut lanes {
            smooth(lane, SMOOTH_LEN);
        }

        Ok(lanes)
    }

    /// Runs edge extraction and the CW and AM fits over every lane.
    fn classify(&self, signals: &[Vec<f32>], baseband: f64) -> Vec<Collar> {
        let mut collars = Vec::new();

        // Valid pulse widths in envelope samples, with tolerance
        let envelope_rate = signals[0].len() as f64 / SAMPLE_TIME as f64;
        let widths: Vec<f64> = PULSE_WIDTHS
            .iter()
            .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .map(|w| w * envelope_rate)
            .collect();
        let width_bands = calc_tolerances(&widths, PULSE_WIDTH_TOL);

        for (signal_index, signal) in signals.iter().enumerate() {
            let Some((pos_indices, neg_indices)) = find_edges(signal, &width_bands) else {
                continue;
            };

            let mut modulation = Modulation::Cw;
            let mut fit = find_pulses(signal, &neg_indices, &pos_indices, &width_bands);

            if fit.is_none() {
                if let Some((am, am_pos, am_neg)) = find_am(signal, &pos_indices, &neg_indices) {
                    fit = find_pulses(&am, &am_neg, &am_pos, &width_bands);
                    modulation = Modulation::Am;
                }
            }

            if let Some(pulse) = fit {
                let frequency = snap_to_channel(self.frequencies[signal_index] as f64 + baseband);
                collars.push(Collar {
                    signal_index,
                    modulation,
                    frequency,
                    count: pulse.count,
                    rate: pulse.rate,
                    level: pulse.level,
                    width: pulse.width,
                    lon: None,
                    lat: None,
                });
            }
        }

        collars
    }
}

/// Snaps a carrier to the nearest channel. A carrier exactly halfway
/// between two channels takes the lower one.
fn snap_to_channel(frequency: f64) -> f64 {
    (frequency / CHANNEL_SPACE - 0.5).ceil() * CHANNEL_SPACE
}

/// Index of the FFT bin holding the given frequency offset. Bins are
/// resolved against the centred spectrum and mapped back to FFT order.
fn frequency_bin(frequency: f32, nfft: usize, fs: f64) -> usize {
    let half = nfft / 2;
    // First centred bin at or above the candidate
    let position = (frequency as f64 * nfft as f64 / fs).ceil() + half as f64;
    let centred = (position.max(0.0) as usize).min(nfft - 1);
    (centred + half) % nfft
}

/// Same-length boxcar convolution followed by mean removal.
fn smooth(signal: &mut [f32], box_len: usize) {
    let length = signal.len();
    if length == 0 {
        return;
    }
    let source = signal.to_vec();
    let centre = (box_len - 1) / 2;

    for i in 0..length {
        let full_index = i + centre;
        let lo = full_index.saturating_sub(box_len - 1);
        let hi = usize::min(full_index, length - 1);
        let sum: f32 = source[lo..=hi].iter().sum();
        signal[i] = sum / box_len as f32;
    }

    let mean = signal.iter().sum::<f32>() / length as f32;
    for value in signal.iter_mut() {
        *value -= mean;
    }
}

/// Extracts pulse edges from an envelope.
///
/// Thresholds come from percentiles of the envelope: the high threshold sits
/// just under the level only the shortest admissible pulse train would
/// exceed, the low threshold a third of the gap below it. Samples between
/// the thresholds carry the previous state, which rejects chatter on slow
/// transitions. Returns (positive, negative) edge indices, or None when the
/// edge counts differ by more than one.
fn find_edges(signal: &[f32], width_bands: &[(f64, f64)]) -> Option<(Vec<usize>, Vec<usize>)> {
    let min_rate = PULSE_RATES.iter().cloned().fold(f64::INFINITY, f64::min);
    let min_pulses = SAMPLE_TIME as f64 * min_rate / 60.0;
    let min_width = width_bands
        .first()
        .map(|&(_, lower)| lower)
        .unwrap_or_default();
    let min_high = min_pulses * min_width / 1e3;
    let threshold = (1.0 - min_high / SAMPLE_TIME as f64) * 100.0;

    let t1 = percentile(signal, threshold);
    let t2 = percentile(signal, threshold - 5.0);
    let offset = (t1 - t2) / 3.0;
    let thresh_high = t1 - offset;
    let thresh_low = t2 + offset;

    // Two-state stream: high = 1, low = 0, in-between carries the previous state
    let mut state = false;
    let mut seen = false;
    let mut previous = false;
    let mut pos_indices = Vec::new();
    let mut neg_indices = Vec::new();

    for (i, &level) in signal.iter().enumerate() {
        if level >= thresh_high {
            state = true;
            seen = true;
        } else if level <= thresh_low {
            state = false;
            seen = true;
        }
        let current = seen && state;
        if i > 0 && current != previous {
            if current {
                pos_indices.push(i - 1);
            } else {
                neg_indices.push(i - 1);
            }
        }
        previous = current;
    }

    if pos_indices.len().abs_diff(neg_indices.len()) > 1 {
        return None;
    }
    let matched = usize::min(pos_indices.len(), neg_indices.len());
    pos_indices.truncate(matched);
    neg_indices.truncate(matched);

    Some((pos_indices, neg_indices))
}

/// Matches the edge pairs against the canonical pulse widths and rates.
fn find_pulses(
    signal: &[f32],
    neg_indices: &[usize],
    pos_indices: &[usize],
    width_bands: &[(f64, f64)],
) -> Option<PulseFit> {
    let length = signal.len();
    // Signed: a reconstructed series can lead with a negative edge, and the
    // resulting negative width must simply fail the band check
    let widths: Vec<i64> = neg_indices
        .iter()
        .zip(pos_indices)
        .map(|(&neg, &pos)| neg as i64 - pos as i64)
        .collect();

    for &(w_max, w_min) in width_bands {
        // Every observed width must fit the band, and one pulse is never a train
        let all_valid = widths
            .iter()
            .all(|&w| (w as f64) > w_min && (w as f64) < w_max);
        if widths.len() < 2 || !all_valid {
            continue;
        }

        let periods: Vec<f64> = pos_indices
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) as f64)
            .collect();
        let period_avg = mean(&periods);
        let max_deviation = period_avg * PULSE_RATE_DEVIATION / 100.0;
        if std_dev(&periods) >= max_deviation {
            continue;
        }

        let pulse_hz = length as f64 / (period_avg * SAMPLE_TIME as f64);
        let rate = pulse_hz * 60.0;
        let closest = PULSE_RATES
            .iter()
            .cloned()
            .min_by(|a, b| {
                (a - rate)
                    .abs()
                    .partial_cmp(&(b - rate).abs())
                    .unwrap_or(Ordering::Equal)
            })
            .unwrap_or_default();
        if (closest - rate).abs() >= PULSE_RATE_TOL {
            continue;
        }

        let mut level = 0.0f32;
        let mut width = 0i64;
        for (&pos, &w) in pos_indices.iter().zip(&widths) {
            let end = usize::min(pos + (w - 1).max(0) as usize, length);
            if end > pos {
                level += mean_f32(&signal[pos..end]);
            }
            width = w;
        }
        level /= pos_indices.len() as f32;

        return Some(PulseFit {
            count: widths.len(),
            rate,
            level,
            width: width as f64 * SAMPLE_TIME as f64 * 1000.0 / length as f64,
        });
    }

    None
}

/// Finds the tone period matched by the greatest number of edge intervals
/// and reconstructs a tone-on/tone-off series from the envelope.
fn find_tone(signal: &[f32], indices: &[usize], tones: &[f64]) -> Option<(f64, Vec<f32>)> {
    if indices.is_empty() {
        return None;
    }

    let sample_rate = signal.len() as f64 / SAMPLE_TIME as f64;
    let periods: Vec<f64> = tones.iter().map(|tone| sample_rate / tone).collect();
    let bands = calc_tolerances(&periods, TONE_TOL);

    let mut edges: Vec<usize> = indices.to_vec();
    if edges[0] != 0 {
        edges.insert(0, 0);
    }
    let widths: Vec<usize> = edges.windows(2).map(|pair| pair[1] - pair[0]).collect();

    // Count matching intervals per candidate period
    let counts: Vec<usize> = bands
        .iter()
        .map(|&(max, min)| {
            widths
                .iter()
                .filter(|&&w| (w as f64) > min && (w as f64) < max)
                .count()
        })
        .collect();
    let (best, &best_count) = counts
        .iter()
        .enumerate()
        .max_by_key(|&(_, count)| *count)?;
    if best_count == 0 {
        return None;
    }

    let (band_max, band_min) = bands[best];
    let valid: Vec<bool> = widths
        .iter()
        .map(|&w| (w as f64) > band_min && (w as f64) < band_max)
        .collect();
    let matched: Vec<f64> = widths
        .iter()
        .zip(&valid)
        .filter(|&(_, &v)| v)
        .map(|(&w, _)| w as f64)
        .collect();
    let frequency = sample_rate / mean(&matched);

    // Reconstruct: each interval is tone-on at its mean envelope level
    // when its width matches the period, silent otherwise
    let mut pulse = vec![0.0f32; signal.len()];
    let mut position = 0;
    for (i, &width) in widths.iter().enumerate() {
        let start = edges[i];
        let end = usize::min(start + width, signal.len());
        let level = mean_f32(&signal[start..end]).abs();
        let value = if valid[i] { level } else { 0.0 };
        pulse[position..position + width].fill(value);
        position += width;
    }

    Some((frequency, pulse))
}

/// Reconstructs the pulsed AM tone from both edge polarities.
///
/// Both polarities must agree on the tone period; the reconstructions are
/// averaged and the edges of the averaged series are what the pulse fit
/// runs on.
fn find_am(
    signal: &[f32],
    pos_indices: &[usize],
    neg_indices: &[usize],
) -> Option<(Vec<f32>, Vec<usize>, Vec<usize>)> {
    let (frequency, am_pos) = find_tone(signal, pos_indices, &TONES)?;
    let (_, am_neg) = find_tone(signal, neg_indices, &[frequency])?;

    let am: Vec<f32> = am_pos
        .iter()
        .zip(&am_neg)
        .map(|(a, b)| (a + b) / 2.0)
        .collect();

    let mut am_pos_indices = Vec::new();
    let mut am_neg_indices = Vec::new();
    for i in 0..am.len().saturating_sub(1) {
        if am[i + 1] != 0.0 && am[i] == 0.0 {
            am_pos_indices.push(i);
        }
        if am[i + 1] == 0.0 && am[i] != 0.0 {
            am_neg_indices.push(i);
        }
    }
    let matched = usize::min(am_pos_indices.len(), am_neg_indices.len());
    am_pos_indices.truncate(matched);
    am_neg_indices.truncate(matched);

    Some((am, am_pos_indices, am_neg_indices))
}

/// Removes intermodulation ghosts.
///
/// Collars are grouped by pulse rate; within a group, any pair whose
/// envelopes correlate above [`GHOST_CORR`] loses its weaker member.
fn remove_ghosts(signals: &[Vec<f32>], detected: &mut Vec<Collar>) {
    if detected.len() < 2 {
        return;
    }

    // Cluster rates separated by more than the tolerance
    let mut rates: Vec<f64> = detected.iter().map(|c| c.rate).collect();
    rates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mut groups: Vec<(f64, f64)> = Vec::new();
    let mut start = rates[0];
    let mut last = rates[0];
    for &rate in &rates[1..] {
        if rate - last > GHOST_RATE_TOL {
            groups.push((start, last));
            start = rate;
        }
        last = rate;
    }
    groups.push((start, last));

    let mut to_remove: HashSet<usize> = HashSet::new();
    for (lo, hi) in groups {
        let members: Vec<usize> = detected
            .iter()
            .enumerate()
            .filter(|(_, c)| c.rate >= lo && c.rate <= hi)
            .map(|(i, _)| i)
            .sorted_by(|&a, &b| {
                detected[b]
                    .level
                    .partial_cmp(&detected[a].level)
                    .unwrap_or(Ordering::Equal)
            })
            .collect();

        for pair in members.iter().combinations(2) {
            let (&strong, &weak) = (pair[0], pair[1]);
            let a = &signals[detected[strong].signal_index];
            let v = &signals[detected[weak].signal_index];
            if correlate(a, v) {
                to_remove.insert(weak);
            }
        }
    }

    let mut index = 0;
    detected.retain(|_| {
        let keep = !to_remove.contains(&index);
        index += 1;
        keep
    });
}

/// Zero-lag cross-correlation of two normalised envelopes.
///
/// The first operand is additionally divided by its length; the asymmetry
/// is inherited behaviour and the 0.33 threshold is empirical against it.
fn correlate(a: &[f32], v: &[f32]) -> bool {
    let mean_a = mean_f32(a);
    let mean_v = mean_f32(v);
    let norm_a = std_dev_f32(a) * a.len() as f32;
    let norm_v = std_dev_f32(v);

    let corr: f32 = a
        .iter()
        .zip(v)
        .map(|(&x, &y)| ((x - mean_a) / norm_a) * ((y - mean_v) / norm_v))
        .sum();

    corr > GHOST_CORR
}

/// Returns (max, min) bands for each value at +/- `tolerance` percent.
fn calc_tolerances(values: &[f64], tolerance: f64) -> Vec<(f64, f64)> {
    values
        .iter()
        .map(|v| {
            (
                v * (100.0 + tolerance) / 100.0,
                v * (100.0 - tolerance) / 100.0,
            )
        })
        .collect()
}

/// Percentile with linear interpolation between order statistics.
fn percentile(data: &[f32], pct: f64) -> f32 {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = (rank - lower as f64) as f32;

    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn std_dev(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean(data);
    (data.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / data.len() as f64).sqrt()
}

fn mean_f32(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f32>() / data.len() as f32
}

fn std_dev_f32(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean_f32(data);
    (data.iter().map(|x| (x - m) * (x - m)).sum::<f32>() / data.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CAPTURE_SAMPLES, SAMPLE_RATE};
    use crate::scan::Scan;

    /// Envelope with `count` rectangular pulses of `width` samples starting
    /// every `period` samples.
    fn pulse_envelope(length: usize, period: usize, width: usize, count: usize) -> Vec<f32> {
        let mut signal = vec![0.0f32; length];
        for pulse in 0..count {
            let start = period / 2 + pulse * period;
            for value in signal.iter_mut().skip(start).take(width) {
                *value = 1.0;
            }
        }
        let mean = signal.iter().sum::<f32>() / length as f32;
        for value in signal.iter_mut() {
            *value -= mean;
        }
        signal
    }

    /// IQ capture with an on/off keyed carrier at `offset` Hz: `width_s`
    /// pulses, one per `period_s`, at the given amplitude.
    fn keyed_carrier(offset: f64, period_s: f64, width_s: f64, amplitude: f32) -> Vec<Complex32> {
        let fs = SAMPLE_RATE as f64;
        (0..CAPTURE_SAMPLES)
            .map(|n| {
                let t = n as f64 / fs;
                let keyed = (t + period_s / 2.0) % period_s < width_s;
                if !keyed {
                    return Complex32::default();
                }
                let phase = 2.0 * std::f64::consts::PI * (n as f64 * offset / fs).fract();
                Complex32::new(
                    amplitude * phase.cos() as f32,
                    amplitude * phase.sin() as f32,
                )
            })
            .collect()
    }

    /// Adds a deterministic noise floor so window leakage stays below it,
    /// as it would in a real capture.
    fn add_noise(samples: &mut [Complex32], amplitude: f32) {
        let mut state = 0x853c49e6748fea9bu64;
        let mut uniform = || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (1u64 << 30) as f32 - 1.0) * amplitude
        };
        for sample in samples.iter_mut() {
            sample.re += uniform();
            sample.im += uniform();
        }
    }

    fn add(a: &mut [Complex32], b: &[Complex32]) {
        for (x, y) in a.iter_mut().zip(b) {
            *x += y;
        }
    }

    #[test]
    fn edges_of_a_clean_pulse_train() {
        let envelope = pulse_envelope(2048, 512, 16, 4);
        let widths = calc_tolerances(&[8.0, 16.0, 32.0], PULSE_WIDTH_TOL);
        let (pos, neg) = find_edges(&envelope, &widths).unwrap();
        assert_eq!(pos.len(), 4);
        assert_eq!(neg.len(), 4);
        for (&p, &n) in pos.iter().zip(&neg) {
            assert_eq!(n - p, 16);
        }
    }

    #[test]
    fn pulse_fit_measures_rate_and_width() {
        // 2343 envelope samples over 4 s, one pulse per second
        let length = 2343;
        let period = 586;
        let envelope = pulse_envelope(length, period, 15, 4);
        let envelope_rate = length as f64 / SAMPLE_TIME as f64;
        let widths: Vec<f64> = PULSE_WIDTHS.iter().map(|w| w * envelope_rate).collect();
        let bands = calc_tolerances(&widths, PULSE_WIDTH_TOL);

        let (pos, neg) = find_edges(&envelope, &bands).unwrap();
        let fit = find_pulses(&envelope, &neg, &pos, &bands).unwrap();
        assert_eq!(fit.count, 4);
        assert!((fit.rate - 60.0).abs() < PULSE_RATE_TOL);
        assert!(fit.level > 0.5);
    }

    #[test]
    fn irregular_pulse_train_is_rejected() {
        let length = 2343;
        let mut envelope = vec![0.0f32; length];
        // Three pulses with wildly different periods
        for &start in &[100usize, 400, 1900] {
            for value in envelope.iter_mut().skip(start).take(15) {
                *value = 1.0;
            }
        }
        let envelope_rate = length as f64 / SAMPLE_TIME as f64;
        let widths: Vec<f64> = PULSE_WIDTHS.iter().map(|w| w * envelope_rate).collect();
        let bands = calc_tolerances(&widths, PULSE_WIDTH_TOL);

        if let Some((pos, neg)) = find_edges(&envelope, &bands) {
            assert!(find_pulses(&envelope, &neg, &pos, &bands).is_none());
        }
    }

    #[test]
    fn tone_period_matched_by_count() {
        // Edges every 4 samples match a tone of envelope_rate / 4
        let length = 400;
        let signal = vec![0.5f32; length];
        let indices: Vec<usize> = (0..100).map(|i| i * 4).collect();
        let sample_rate = length as f64 / SAMPLE_TIME as f64;
        let tone = sample_rate / 4.0;

        let (frequency, pulse) = find_tone(&signal, &indices, &[tone]).unwrap();
        assert!((frequency - tone).abs() < tone * TONE_TOL / 100.0);
        assert!(pulse.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn correlated_envelopes_are_ghosts() {
        let a = pulse_envelope(1000, 250, 20, 4);
        let weaker: Vec<f32> = a.iter().map(|v| v * 0.3).collect();
        assert!(correlate(&a, &weaker));

        let unrelated = pulse_envelope(1000, 333, 20, 3);
        assert!(!correlate(&a, &unrelated));
    }

    #[test]
    fn half_channel_tie_snaps_to_the_lower_channel() {
        // 151,150,000 / 20,000 is exactly representable, so this input is
        // a true tie between 151.14 and 151.16 MHz
        assert_eq!(snap_to_channel(151_150_000.0), 151_140_000.0);
        assert_eq!(snap_to_channel(151_149_000.0), 151_140_000.0);
        assert_eq!(snap_to_channel(151_151_000.0), 151_160_000.0);
        assert_eq!(snap_to_channel(151_140_000.0), 151_140_000.0);
    }

    #[test]
    fn detects_cw_collar_in_synthetic_capture() {
        // 25 ms pulses at 60 PPM, +150 kHz from a 151 MHz baseband. The
        // offset lands on an exact PSD bin, so the carrier sits exactly
        // halfway between two channels and snaps to the lower one
        let baseband = 151_000_000.0;
        let mut samples = keyed_carrier(150_000.0, 1.0, 25e-3, 0.8);
        add_noise(&mut samples, 0.01);

        let peaks = Scan::new(SAMPLE_RATE as f64, &samples).search().unwrap();
        assert!(!peaks.is_empty());
        let frequencies: Vec<f32> = peaks.iter().map(|p| p.frequency).collect();

        let mut detect = Detect::new(SAMPLE_RATE as f64, &samples, frequencies);
        let collars = detect.search(baseband).unwrap();

        assert_eq!(collars.len(), 1);
        let collar = &collars[0];
        assert_eq!(collar.modulation, Modulation::Cw);
        assert_eq!(collar.frequency, 151_140_000.0);
        assert_eq!(collar.frequency % CHANNEL_SPACE, 0.0);
        assert_eq!(collar.count, 4);
        assert!((collar.rate - 60.0).abs() < PULSE_RATE_TOL);
    }

    #[test]
    fn ghost_collar_is_suppressed() {
        // The same keying 10 dB down and 40 kHz away is an intermodulation
        // product, not a second collar
        let baseband = 151_000_000.0;
        let mut samples = keyed_carrier(150_000.0, 1.0, 25e-3, 0.8);
        let ghost = keyed_carrier(190_000.0, 1.0, 25e-3, 0.253);
        add(&mut samples, &ghost);
        add_noise(&mut samples, 0.01);

        let peaks = Scan::new(SAMPLE_RATE as f64, &samples).search().unwrap();
        let frequencies: Vec<f32> = peaks.iter().map(|p| p.frequency).collect();
        assert!(frequencies.len() >= 2);

        let mut detect = Detect::new(SAMPLE_RATE as f64, &samples, frequencies);
        let collars = detect.search(baseband).unwrap();

        assert_eq!(collars.len(), 1);
        assert_eq!(collars[0].frequency, 151_140_000.0);
    }

    #[test]
    fn empty_candidate_list_is_valid() {
        let samples = vec![Complex32::default(); DEMOD_BINS];
        let mut detect = Detect::new(SAMPLE_RATE as f64, &samples, Vec::new());
        assert!(detect.search(151e6).unwrap().is_empty());
    }

    #[test]
    fn short_capture_is_rejected() {
        let samples = vec![Complex32::default(); DEMOD_BINS - 1];
        let mut detect = Detect::new(SAMPLE_RATE as f64, &samples, vec![0.0]);
        assert_eq!(
            detect.search(151e6).unwrap_err(),
            DspError::SampleTooShort {
                got: DEMOD_BINS - 1,
                need: DEMOD_BINS
            }
        );
    }
}
