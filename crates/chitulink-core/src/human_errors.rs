// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Plain-language error messages for the host UI / CLI.
//
// Every engine error is mapped to a short message plus something the user can
// try. The severity drives how the host presents it.

use crate::error::ChituLinkError;

/// Severity of an error from the user's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Network blip, busy device; retrying the operation may work.
    Transient,
    /// The user must do something (insert storage, pick a file, fix a name).
    ActionRequired,
    /// Retrying will not help.
    Permanent,
}

/// A human-readable error with an actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    pub message: String,
    pub suggestion: String,
    pub retriable: bool,
    pub severity: Severity,
}

impl HumanError {
    fn new(message: &str, suggestion: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            suggestion: suggestion.into(),
            retriable: severity == Severity::Transient,
            severity,
        }
    }
}

impl std::fmt::Display for HumanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.message, self.suggestion)
    }
}

/// Convert a `ChituLinkError` into a `HumanError`.
pub fn humanize_error(err: &ChituLinkError) -> HumanError {
    use Severity::*;

    match err {
        ChituLinkError::Timeout => HumanError::new(
            "Connection timeout.",
            "Check that the printer is switched on and on the same network, then try again.",
            Transient,
        ),
        ChituLinkError::Disconnected => HumanError::new(
            "The printer is not connected.",
            "The printer may have restarted its Wi-Fi or accepted another client. Reconnect and try again.",
            Transient,
        ),
        ChituLinkError::Busy => HumanError::new(
            "The printer is busy.",
            "Another transfer or query is in progress. Wait a moment and try again.",
            Transient,
        ),
        ChituLinkError::Aborted => HumanError::new("Upload canceled.", "", Permanent),
        ChituLinkError::WriteError(detail) => {
            if detail.to_ascii_lowercase().contains("create file") || detail.contains("M28") {
                HumanError::new(
                    "Write error.",
                    "Please check that the SD card or USB disk has been inserted.",
                    ActionRequired,
                )
            } else {
                HumanError::new(
                    "The printer rejected the file data.",
                    format!("Try uploading again. (Detail: {detail})"),
                    Permanent,
                )
            }
        }
        ChituLinkError::FileEmpty => HumanError::new(
            "File empty.",
            "Slice the model again; the G-code file has no content.",
            ActionRequired,
        ),
        ChituLinkError::FileNotOpen { path, .. } => HumanError::new(
            "Cannot open file.",
            format!("Check that {} exists and is readable.", path.display()),
            ActionRequired,
        ),
        ChituLinkError::PrintRejected(_) => HumanError::new(
            "Cannot print.",
            "The printer refused to start. Check its screen for a message.",
            ActionRequired,
        ),
        ChituLinkError::Compression(detail) => HumanError::new(
            "The G-code could not be compressed.",
            format!("The uncompressed file will be sent instead. ({detail})"),
            Permanent,
        ),
        ChituLinkError::Discovery(_) => HumanError::new(
            "We couldn't search for printers.",
            "Make sure you're connected to a network that allows broadcasts, then try again.",
            Transient,
        ),
        ChituLinkError::Image(detail) => HumanError::new(
            "The preview image could not be prepared.",
            format!("Upload without a thumbnail or use a PNG file. ({detail})"),
            Permanent,
        ),
        ChituLinkError::InvalidFileName(_) => HumanError::new(
            "That file name can't be used on the printer.",
            "Use letters, digits, spaces, dots, dashes and underscores only.",
            ActionRequired,
        ),
        ChituLinkError::Config(detail) => HumanError::new(
            "A setting is invalid.",
            format!("Fix the setting and try again. ({detail})"),
            ActionRequired,
        ),
        ChituLinkError::Io(io) => HumanError::new(
            "A file or network operation failed.",
            format!("Try again. ({io})"),
            if err.is_transient() { Transient } else { Permanent },
        ),
        ChituLinkError::Serialization(_) => HumanError::new(
            "Saved settings are damaged.",
            "Delete the settings file to restore defaults.",
            ActionRequired,
        ),
    }
}
