pub mod collar;
pub mod constants;
pub mod detect;
pub mod psd;
pub mod sample_buffer;
pub mod scan;

use thiserror::Error;

/// Errors from the signal processing stages.
///
/// Rejections of individual candidate carriers are not errors; the detect
/// stage silently drops a lane that fails classification. These variants
/// only cover captures that cannot be processed at all.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DspError {
    #[error("sample too short: got {got} samples, need at least {need}")]
    SampleTooShort { got: usize, need: usize },
}
