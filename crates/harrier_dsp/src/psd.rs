use num::complex::Complex32;
use rustfft::FftPlanner;

/// Gap between the starts of consecutive Welch segments, on top of the
/// segment length itself. Only a fraction of the capture is analysed; the
/// spectrum is stable enough and the scan stage stays fast.
const SEGMENT_GAP: usize = 64 * 1024;

/// Welch power spectral density estimate.
///
/// Splits the capture into Hann-windowed segments of `nfft` samples,
/// averages their squared FFT magnitudes and centres the spectrum so the
/// middle bin maps to DC. Returns `(frequencies, power)` where frequencies
/// are offsets from the tuned centre in Hz.
pub fn psd(samples: &[Complex32], nfft: usize, fs: f64) -> (Vec<f32>, Vec<f32>) {
    let window = hann_window(nfft);
    let step = nfft + SEGMENT_GAP;

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(nfft);

    let mut power = vec![0.0f32; nfft];
    let mut segment = vec![Complex32::default(); nfft];
    let mut total_segments = 0usize;

    let mut index = 0;
    while index + nfft <= samples.len() {
        for (out, (x, w)) in segment
            .iter_mut()
            .zip(samples[index..index + nfft].iter().zip(&window))
        {
            *out = *x * *w;
        }
        fft.process(&mut segment);
        for (acc, x) in power.iter_mut().zip(&segment) {
            *acc += x.norm_sqr();
        }
        total_segments += 1;
        index += step;
    }

    let scale = 1.0 / usize::max(total_segments, 1) as f32;
    let half = nfft / 2;

    let mut levels = vec![0.0f32; nfft];
    let mut frequencies = vec![0.0f32; nfft];
    for i in 0..nfft {
        levels[i] = power[(i + half) % nfft] * scale;
        frequencies[i] = ((i as f64 - half as f64) * fs / nfft as f64) as f32;
    }

    (frequencies, levels)
}

fn hann_window(length: usize) -> Vec<f32> {
    use std::f64::consts::PI;
    (0..length)
        .map(|n| (0.5 - 0.5 * (2.0 * PI * n as f64 / (length - 1) as f64).cos()) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frequency: f64, fs: f64, length: usize) -> Vec<Complex32> {
        (0..length)
            .map(|n| {
                let phase = 2.0 * std::f64::consts::PI * frequency * n as f64 / fs;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn tone_lands_in_its_bin() {
        let fs = 2_400_000.0;
        let nfft = 4096;
        // One full segment is enough for a spectrum
        let samples = tone(150_000.0, fs, nfft);
        let (frequencies, levels) = psd(&samples, nfft, fs);

        let peak = levels
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert!((frequencies[peak] - 150_000.0).abs() < fs as f32 / nfft as f32);
    }

    #[test]
    fn spectrum_is_centred() {
        let fs = 2_400_000.0;
        let nfft = 4096;
        let (frequencies, _) = psd(&tone(0.0, fs, nfft), nfft, fs);
        assert_eq!(frequencies[nfft / 2], 0.0);
        assert!(frequencies[0] < 0.0);
        assert!(frequencies[nfft - 1] > 0.0);
    }
}
