// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer bridging the command-line front end to the ChituLink crates.
//
// The device engine is blocking; services expose it in a form the
// async command handlers can drive through `spawn_blocking`.

pub mod app_services;
pub mod compressor;
pub mod data_dir;
