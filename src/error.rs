use std::fmt::Display;

use thiserror::Error;

use crate::types::FileFormat;

/// Application error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Source bytes are malformed or unreadable for the declared format
    #[error("Failed to parse {format} file: {message}")]
    Parse { format: FileFormat, message: String },

    /// Target format cannot be produced from what was decoded
    #[error("Cannot encode {format}: {message}")]
    Encode { format: FileFormat, message: String },

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn parse(format: FileFormat, message: impl Display) -> Self {
        Error::Parse {
            format,
            message: message.to_string(),
        }
    }

    pub fn encode(format: FileFormat, message: impl Display) -> Self {
        Error::Encode {
            format,
            message: message.to_string(),
        }
    }
}
