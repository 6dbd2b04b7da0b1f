// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// External G-code compressor.
//
// The vendor tool is invoked as
//   <tool> <source> <x_step> <y_step> <z_step> <e_step> <out_dir> <x_max> <y_max> <z_max> <machine_type>
// and writes `<source>.tz` next to its input.

use std::path::{Path, PathBuf};
use std::process::Command;

use chitulink_core::error::{ChituLinkError, Result};
use chitulink_core::types::MachineProfile;
use chitulink_device::compress::{Compressor, compressed_sibling};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ExternalCompressor {
    program: PathBuf,
}

impl ExternalCompressor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(source: &Path, profile: &MachineProfile) -> Vec<String> {
        let out_dir = source
            .parent()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        vec![
            source.display().to_string(),
            profile.x_mm_per_step.clone(),
            profile.y_mm_per_step.clone(),
            profile.z_mm_per_step.clone(),
            profile.e_mm_per_step.clone(),
            out_dir,
            profile.x_max.clone(),
            profile.y_max.clone(),
            profile.z_max.clone(),
            profile.machine_type.clone(),
        ]
    }
}

impl Compressor for ExternalCompressor {
    fn compress(&self, source: &Path, profile: &MachineProfile) -> Result<PathBuf> {
        if !self.program.exists() {
            return Err(ChituLinkError::Compression(format!(
                "compressor not found at {}",
                self.program.display()
            )));
        }

        let args = Self::args(source, profile);
        debug!(program = %self.program.display(), ?args, "running compressor");
        let output = Command::new(&self.program).args(&args).output()?;
        debug!(
            status = %output.status,
            stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
            "compressor finished"
        );

        let target = compressed_sibling(source);
        if target.exists() {
            info!(path = %target.display(), "G-code compressed");
            Ok(target)
        } else {
            Err(ChituLinkError::Compression(format!(
                "{} produced no output (exit {})",
                self.program.display(),
                output.status
            )))
        }
    }
}
