// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// chitulink-gcode: G-code preparation for ChituLink uploads.
//
// Provides the thumbnail run-length codec (`M4010` preview commands), the
// print-time metacommand rewriting (`M2100` / `M2101`) and assembly of the
// final upload file.

pub mod thumbnail;
pub mod time_info;
pub mod writer;

pub use thumbnail::{CaptureRect, ThumbnailEncoder};
pub use time_info::insert_time_infos;
pub use writer::{prepare_upload, validate_file_name, write_upload_file};
