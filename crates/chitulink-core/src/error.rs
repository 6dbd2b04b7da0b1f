// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for ChituLink.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all ChituLink operations.
///
/// A successful exchange is `Ok(..)`; every other outcome the device engine
/// can produce is one of these variants.
#[derive(Debug, Error)]
pub enum ChituLinkError {
    // -- Session / transport --
    #[error("no reply from the device within the time budget")]
    Timeout,

    #[error("device is not connected")]
    Disconnected,

    #[error("session is busy with another exchange")]
    Busy,

    #[error("operation aborted by the caller")]
    Aborted,

    // -- Transfer --
    #[error("device rejected the write: {0}")]
    WriteError(String),

    #[error("source file is empty")]
    FileEmpty,

    #[error("cannot open {path}: {source}")]
    FileNotOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device refused to start the print: {0}")]
    PrintRejected(String),

    #[error("G-code compression failed: {0}")]
    Compression(String),

    // -- Discovery --
    #[error("device discovery failed: {0}")]
    Discovery(String),

    // -- G-code / thumbnail --
    #[error("image processing failed: {0}")]
    Image(String),

    #[error("invalid upload file name: {0}")]
    InvalidFileName(String),

    // -- Configuration / persistence --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChituLinkError {
    /// Whether the caller may reasonably retry the whole operation.
    ///
    /// Protocol failures reported by the device (`WriteError`,
    /// `PrintRejected`) and local preconditions are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Busy | Self::Disconnected | Self::Discovery(_) => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ChituLinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_busy_are_transient() {
        assert!(ChituLinkError::Timeout.is_transient());
        assert!(ChituLinkError::Busy.is_transient());
        assert!(ChituLinkError::Disconnected.is_transient());
    }

    #[test]
    fn device_rejections_are_not_transient() {
        assert!(!ChituLinkError::WriteError("Error:open file".into()).is_transient());
        assert!(!ChituLinkError::PrintRejected("Error".into()).is_transient());
        assert!(!ChituLinkError::FileEmpty.is_transient());
        assert!(!ChituLinkError::Aborted.is_transient());
    }

    #[test]
    fn io_kind_drives_classification() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "t");
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "n");
        assert!(ChituLinkError::Io(timed_out).is_transient());
        assert!(!ChituLinkError::Io(missing).is_transient());
    }
}
