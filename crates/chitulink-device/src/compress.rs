// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Optional G-code compression before upload.
//
// The device accepts a vendor-compressed `.gcode.tz` file as well as plain
// G-code. Compression itself is an injected capability: given a source path
// and the machine geometry, produce the compressed sibling or fail. The
// transfer engine falls back to the plain file on failure.

use std::path::{Path, PathBuf};

use chitulink_core::error::Result;
use chitulink_core::types::MachineProfile;

/// Extension appended by the compressor.
pub const COMPRESSED_SUFFIX: &str = "tz";

pub trait Compressor: Send + Sync {
    /// Compress `source` and return the path of the compressed file.
    fn compress(&self, source: &Path, profile: &MachineProfile) -> Result<PathBuf>;
}

/// Always fails, so the original file is uploaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, _source: &Path, _profile: &MachineProfile) -> Result<PathBuf> {
        Err(chitulink_core::ChituLinkError::Compression(
            "compression disabled".into(),
        ))
    }
}

/// `<source>.tz`, the path a compressor writes next to its input.
pub fn compressed_sibling(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".");
    name.push(COMPRESSED_SUFFIX);
    PathBuf::from(name)
}
