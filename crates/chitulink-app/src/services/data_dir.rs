// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::{Path, PathBuf};

/// Settings file inside the data directory.
pub const CONFIG_FILE: &str = "config.json";
/// Device registry inside the data directory.
pub const DEVICES_FILE: &str = "devices.json";

/// Return the application data directory, creating it if needed.
///
/// `override_dir` (from `--data-dir`) wins over the XDG location.
pub fn data_dir(override_dir: Option<&Path>) -> PathBuf {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => base_dir().join("chitulink"),
    };
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Return a subdirectory inside `dir` (e.g. "uploads"), creating it if needed.
pub fn data_subdir(dir: &Path, name: &str) -> PathBuf {
    let sub = dir.join(name);
    std::fs::create_dir_all(&sub).ok();
    sub
}

fn base_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    std::env::temp_dir()
}
