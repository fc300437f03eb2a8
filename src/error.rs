use thiserror::Error;

/// Failures turning bytes into an envelope or back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is empty or shorter than its header")]
    MissingHeader,

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("frame declares {expected} payload bytes but only {actual} arrived")]
    Truncated { expected: usize, actual: usize },

    #[error("payload of {0} bytes exceeds the frame limit")]
    Oversized(usize),

    #[error("payload: {0}")]
    Payload(#[from] postcard::Error),
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum SettingsError {
    #[error("low bound {low} must be below high bound {high}")]
    InvertedBand { low: f32, high: f32 },
}

/// A single failed attempt at reading the climate sensor.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("checksum mismatch")]
    Checksum,

    #[error("sensor never answered within its timing window")]
    Timing,

    #[error("sensor unavailable")]
    Unavailable,
}

/// Failures addressing a command through the monitor's device table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("no device named {0:?} has reported in")]
    UnknownDevice(String),

    #[error("device {name:?} reported an unusable address {addr:?}")]
    BadAddress { name: String, addr: String },

    #[error("monitor is no longer running")]
    Stopped,
}
