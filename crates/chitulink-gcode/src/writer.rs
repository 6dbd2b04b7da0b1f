// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Upload file preparation: thumbnail block, G-code body and time metacommands
// assembled into the file that is streamed to the device.

use std::path::Path;

use tracing::{debug, info, instrument};

use chitulink_core::error::{ChituLinkError, Result};

use crate::time_info::insert_time_infos;

/// Characters the device file system rejects in file names.
pub const FORBIDDEN_CHARS: &str = "\"'´`<>()[]?*\\,;:&%#$!";

/// Check a remote base name (without extension) before upload.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ChituLinkError::InvalidFileName("name is empty".into()));
    }
    if name.contains(['/', '\\']) {
        return Err(ChituLinkError::InvalidFileName(format!(
            "'{name}' must not contain a path separator"
        )));
    }
    if name == "." || name == ".." {
        return Err(ChituLinkError::InvalidFileName(format!("'{name}' is reserved")));
    }
    if let Some(bad) = name.chars().find(|c| FORBIDDEN_CHARS.contains(*c)) {
        return Err(ChituLinkError::InvalidFileName(format!(
            "'{name}' contains forbidden character '{bad}'"
        )));
    }
    Ok(())
}

/// Remote base name for a local file: its stem.
pub fn default_remote_name(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
}

/// Optional thumbnail block, a blank line, then the G-code, with time
/// comments rewritten.
pub fn prepare_upload(gcode: &str, thumbnail: Option<&str>) -> String {
    let mut combined = String::with_capacity(gcode.len() + thumbnail.map_or(0, str::len) + 1);
    if let Some(block) = thumbnail {
        combined.push_str(block);
        combined.push('\n');
    }
    combined.push_str(gcode);
    insert_time_infos(&combined)
}

/// Write the prepared upload to `target`; returns its size in bytes.
#[instrument(skip(gcode, thumbnail), fields(target = %target.display()))]
pub fn write_upload_file(target: &Path, gcode: &str, thumbnail: Option<&str>) -> Result<u64> {
    let prepared = prepare_upload(gcode, thumbnail);
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, prepared.as_bytes())?;
    let bytes = prepared.len() as u64;
    debug!(with_thumbnail = thumbnail.is_some(), "upload file prepared");
    info!(bytes, "wrote upload file");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_names() {
        let names = [
            "", ".", "..", "a:b", "cube?", "x#1", "it's", "a\\b", "na´me", "a/b", "../escape",
            "/abs", "dir/..",
        ];
        for name in names {
            assert!(
                matches!(validate_file_name(name), Err(ChituLinkError::InvalidFileName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_plain_names() {
        for name in ["cube", "benchy_v2", "part-01", "träger", "a.b"] {
            assert!(validate_file_name(name).is_ok(), "{name:?} should be accepted");
        }
    }

    #[test]
    fn thumbnail_precedes_gcode() {
        let prepared = prepare_upload(";TIME:60\nG28\n", Some("M4010 X1 Y1\nM4010 I0 T1 'f800'\n"));
        assert_eq!(
            prepared,
            "M4010 X1 Y1\nM4010 I0 T1 'f800'\n\nM2100 T60\nG28\n\n"
        );
    }

    #[test]
    fn without_thumbnail_only_rewrites_time() {
        assert_eq!(prepare_upload(";TIME:5\nG1", None), "M2100 T5\nG1\n");
    }

    #[test]
    fn stem_is_default_name() {
        assert_eq!(default_remote_name(Path::new("/jobs/cube.gcode")).as_deref(), Some("cube"));
        assert_eq!(default_remote_name(Path::new("/")), None);
    }

    #[test]
    fn writes_prepared_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out").join("cube.gcode");

        let bytes = write_upload_file(&target, "G28\n", None).unwrap();

        assert_eq!(bytes, 5);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "G28\n\n");
    }
}
