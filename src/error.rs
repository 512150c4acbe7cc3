//! Error types for the capture pipeline

use thiserror::Error;

/// Errors raised while turning a captured frame into a TCP segment.
/// These never change session state; the packet is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("Unsupported network layer (IPv4 only)")]
    UnsupportedNetwork,
    #[error("Unsupported IPv4 protocol: {0}")]
    UnsupportedProtocol(u8),
}

/// Accumulation buffer corruption
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame length {length} ({buffered} bytes buffered)")]
    InvalidLength { length: u32, buffered: usize },
}

/// Tag-tree decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Truncated varint at offset {0}")]
    TruncatedVarint(usize),
    #[error("Field at offset {offset} needs {needed} bytes, {available} available")]
    Overrun {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Unsupported wire type {wire_type} at offset {offset}")]
    WireType { wire_type: u8, offset: usize },
    #[error("Invalid field number {field} at offset {offset}")]
    FieldNumber { field: u64, offset: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Main error type for the meter runtime
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Meter is already running")]
    AlreadyRunning,
    #[error("Meter is not running")]
    NotRunning,
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeterError>;
