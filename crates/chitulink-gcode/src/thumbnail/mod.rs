// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thumbnail module: run-length preview encoding for the device display.

pub mod encoder;

pub use encoder::{CaptureRect, PixelRun, ThumbnailEncoder};
