/// Maximum age for a valid location (seconds).
pub const GPS_AGE: u64 = 5;
/// Retry GPS delay (seconds).
pub const GPS_RETRY: u64 = 5;
