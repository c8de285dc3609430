/// Sample rate of the SDR capture (Hz).
pub const SAMPLE_RATE: usize = 2_400_000;
/// Sampling time per capture (seconds).
pub const SAMPLE_TIME: usize = 4;
/// Number of asynchronous chunks the SDR delivers per capture.
pub const BLOCKS: usize = 20;
/// Number of complex samples in one capture.
pub const CAPTURE_SAMPLES: usize = SAMPLE_RATE * SAMPLE_TIME;
/// Channel spacing collars are tuned to (Hz).
pub const CHANNEL_SPACE: f64 = 20e3;
