/*!
Common error types for the chip configuration and readout codec.
*/

use std::fmt;
use thiserror::Error;

/// Common result type used throughout the codec library
pub type Result<T> = std::result::Result<T, CodecError>;

/// The structural check of a frame that failed during decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralCheck {
    FrameStart,
    ColumnHeader { column: u16 },
    ColumnIndex { column: u16 },
    FrameEnd,
}

impl fmt::Display for StructuralCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameStart => write!(f, "frame start"),
            Self::ColumnHeader { column } => write!(f, "column {} header pattern", column),
            Self::ColumnIndex { column } => write!(f, "column {} header index", column),
            Self::FrameEnd => write!(f, "frame end"),
        }
    }
}

/// Comprehensive error type for all codec operations
#[derive(Error, Debug)]
pub enum CodecError {
    /// Parameter width outside of 1..=30 bits
    #[error("Invalid parameter width {width} for \"{name}\": must be within 1..=30 bits")]
    InvalidWidth { name: String, width: u32 },

    /// Explicit bit order that is malformed or does not cover every bit exactly once
    #[error("Invalid bit order \"{order}\" for \"{name}\": {reason}")]
    InvalidBitOrder {
        name: String,
        order: String,
        reason: String,
    },

    /// A parameter with the same name is already registered
    #[error("Parameter \"{0}\" is already registered")]
    DuplicateParameter(String),

    /// Lookup of a parameter name or index that does not exist
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// Value does not fit into the parameter width
    #[error("Value {value} out of range for \"{name}\" ({width} bits)")]
    ValueOutOfRange { name: String, value: u32, width: u32 },

    /// Shift direction not usable for the requested operation
    #[error("Unsupported shift direction: {0}")]
    UnsupportedDirection(String),

    /// The cursor is already past the last word of the stream
    #[error("End of stream reached at word {word}")]
    EndOfStream { word: usize },

    /// A field started but the stream ended before all of its bits were read
    #[error("Frame truncated: field at word {word}, bit {bit} needs {missing} more bits")]
    FrameTruncated { word: usize, bit: u8, missing: u32 },

    /// Sentinel or column header mismatch while decoding a frame
    #[error("Structural decode error in {check}: expected {expected:#x}, found {found:#x}")]
    Structural {
        check: StructuralCheck,
        expected: u32,
        found: u32,
    },

    /// Malformed SerDes packet frame
    #[error("Packet decode error: {0}")]
    Packet(String),

    /// Read-back of a programmed matrix does not match the configuration
    #[error("Matrix verification failed: {mismatches} pixel(s) differ in stage {stage}")]
    Verification { stage: usize, mismatches: usize },

    /// Matrix programming did not succeed within the retry budget
    #[error("Matrix configuration failed after {attempts} attempt(s)")]
    CommunicationFailed { attempts: u32 },

    /// Matrix definition file content errors
    #[error("Matrix file {path}: {reason}")]
    MatrixFile { path: String, reason: String },

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CodecError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new unknown parameter error
    pub fn unknown_parameter(what: impl Into<String>) -> Self {
        Self::UnknownParameter(what.into())
    }

    /// Create a new packet decode error
    pub fn packet(msg: impl Into<String>) -> Self {
        Self::Packet(msg.into())
    }

    /// Create a new matrix file error
    pub fn matrix_file(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MatrixFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry of the failed operation may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Verification { .. })
    }

    /// The failed structural check, if this is a structural decode error
    pub fn structural_check(&self) -> Option<StructuralCheck> {
        match self {
            Self::Structural { check, .. } => Some(*check),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_message_names_check() {
        let err = CodecError::Structural {
            check: StructuralCheck::FrameEnd,
            expected: 0x3FFF94,
            found: 0,
        };
        assert!(err.to_string().contains("frame end"));
        assert_eq!(err.structural_check(), Some(StructuralCheck::FrameEnd));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(CodecError::Verification { stage: 1, mismatches: 3 }.is_recoverable());
        assert!(!CodecError::CommunicationFailed { attempts: 3 }.is_recoverable());
        assert!(!CodecError::config("missing matrix").is_recoverable());
    }
}
