//! Custom error types for the library.
//!
//! This module defines the primary error type, `CamError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from configuration and I/O problems to controller protocol errors.
//!
//! Controller reply words embedded in errors are rendered through
//! [`crate::proto::word_name`] so a failed command reads as
//! `expected DON, received ERR` rather than raw hex.

use std::time::Duration;

use thiserror::Error;

use crate::proto::word_name;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, CamError>;

/// Errors produced by device access, the controller protocol and the
/// supporting configuration and persistence layers.
#[derive(Error, Debug)]
pub enum CamError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected to any device")]
    NoDevice,

    #[error("No device bindings exist! Make sure a PCIe interface card is installed")]
    NoDevicesFound,

    #[error("Invalid device number: {0}")]
    InvalidDeviceNumber(u32),

    #[error("Device already open, call close() first")]
    AlreadyOpen,

    #[error("Failed to open device {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Invalid BAR number: {0:#X}")]
    InvalidBar(u32),

    #[error("Command value {0:#X} is larger than 24 bits")]
    ValueTooWide(u32),

    #[error("Device reports readout in progress! Status: {status:#X}")]
    ReadoutInProgress { status: u32 },

    #[error("Controller not ready! Verify controller has been setup. Reply: {}", word_name(*.0))]
    ControllerNotReady(u32),

    #[error("Timed out after {waited:?} waiting for a reply, status: {status:#X}")]
    ReplyTimeout { waited: Duration, status: u32 },

    #[error("{context}. Reply: {}", word_name(*.reply))]
    CommandFailed { context: String, reply: u32 },

    #[error("Replies don't match. Received: {}, expected: {}", word_name(*.received), word_name(*.expected))]
    ReplyMismatch { received: u32, expected: u32 },

    #[error("Reset failed! Device status not idle: {status:#X}")]
    ResetFailed { status: u32 },

    #[error("Invalid buffer size: {0}. Must be greater than zero")]
    InvalidBufferSize(usize),

    #[error("Buffer is not mapped")]
    BufferNotMapped,

    #[error("Buffer already mapped, unmap it first")]
    BufferAlreadyMapped,

    #[error("Short buffer allocation. Wanted: {wanted} bytes, received: {received} bytes")]
    ShortBuffer { wanted: u64, received: u64 },

    #[error("Image dimensions [ {cols} x {rows} ] exceed buffer size: {buffer_size}. Try re-mapping the buffer")]
    ImageExceedsBuffer {
        rows: u32,
        cols: u32,
        buffer_size: u64,
    },

    #[error("Read timeout! Pixel count stalled during readout")]
    ReadTimeout,

    #[error("Exposure aborted")]
    Aborted,

    #[error("Firmware file error: {0}")]
    Firmware(String),

    #[error("Deinterlace error: {0}")]
    Deinterlace(String),

    #[error("Temperature control error: {0}")]
    Temperature(String),

    #[error("Operation not supported by this device: {0}")]
    Unsupported(&'static str),
}

impl CamError {
    /// Shorthand for a [`CamError::CommandFailed`] with a formatted context.
    pub fn command(context: impl Into<String>, reply: u32) -> Self {
        CamError::CommandFailed {
            context: context.into(),
            reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{DON, ERR};

    #[test]
    fn reply_words_render_as_mnemonics() {
        let err = CamError::ReplyMismatch {
            received: ERR,
            expected: DON,
        };
        let text = err.to_string();
        assert!(text.contains("Received: ERR"), "{text}");
        assert!(text.contains("expected: DON"), "{text}");
    }

    #[test]
    fn command_shorthand_keeps_context() {
        let err = CamError::command("Power on failed", ERR);
        assert!(err.to_string().contains("Power on failed"));
        assert!(err.to_string().contains("ERR"));
    }
}
