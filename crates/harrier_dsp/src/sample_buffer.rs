use num::complex::Complex32;

use crate::constants::{BLOCKS, CAPTURE_SAMPLES};

/// Fixed-size buffer holding one capture of interleaved IQ bytes.
///
/// The SDR delivers a capture as `BLOCKS` equally sized chunks; each chunk
/// lands in its ring position by arrival order. The buffer is allocated once
/// and reused for every capture.
pub struct CaptureBuffer {
    bytes: Vec<u8>,
    block: usize,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; 2 * CAPTURE_SAMPLES],
            block: 0,
        }
    }

    /// Size of one SDR chunk in bytes.
    pub fn block_bytes(&self) -> usize {
        self.bytes.len() / BLOCKS
    }

    /// Rewinds the ring position for a new capture.
    pub fn reset(&mut self) {
        self.block = 0;
    }

    /// Copies one SDR chunk into its ring position.
    /// Returns true when the final chunk has landed and the capture is complete.
    pub fn write_block(&mut self, chunk: &[u8]) -> bool {
        let position = self.block * chunk.len();
        let end = usize::min(position + chunk.len(), self.bytes.len());
        self.bytes[position..end].copy_from_slice(&chunk[..end - position]);

        self.block += 1;
        if self.block == BLOCKS {
            self.block = 0;
            return true;
        }
        false
    }

    /// Converts the captured byte pairs to complex samples.
    pub fn to_complex(&self) -> Vec<Complex32> {
        bytes_to_complex(&self.bytes)
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts an interleaved offset-binary IQ byte stream to complex samples
/// in the range [-1, +1]: `byte -> (byte - 127.5) / 127.5`.
pub fn bytes_to_complex(bytes: &[u8]) -> Vec<Complex32> {
    bytes
        .chunks_exact(2)
        .map(|iq| {
            Complex32::new(
                (iq[0] as f32 - 127.5) / 127.5,
                (iq[1] as f32 - 127.5) / 127.5,
            )
        })
        .collect()
}

/// Inverse of [`bytes_to_complex`] for samples already on the offset-binary
/// grid. Out of range values saturate.
pub fn complex_to_bytes(samples: &[Complex32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.push(quantise(sample.re));
        bytes.push(quantise(sample.im));
    }
    bytes
}

fn quantise(value: f32) -> u8 {
    (value * 127.5 + 127.5).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let bytes: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        let samples = bytes_to_complex(&bytes);
        assert_eq!(samples.len(), 128);
        assert_eq!(complex_to_bytes(&samples), bytes);
    }

    #[test]
    fn conversion_is_offset_binary() {
        let samples = bytes_to_complex(&[0, 255]);
        assert!((samples[0].re + 1.0).abs() < 1e-6);
        assert!((samples[0].im - 1.0).abs() < 1e-6);
    }

    #[test]
    fn capture_completes_after_all_blocks() {
        let mut buffer = CaptureBuffer::new();
        let chunk = vec![1u8; buffer.block_bytes()];
        for _ in 0..BLOCKS - 1 {
            assert!(!buffer.write_block(&chunk));
        }
        assert!(buffer.write_block(&chunk));
        assert!(buffer.raw_bytes().iter().all(|&b| b == 1));
    }
}
