// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the ChituLink device engine.

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed UDP port every device in the family listens on.
pub const DEVICE_PORT: u16 = 3000;

/// Display name given to a discovered device that did not announce one.
pub const UNNAMED_DEVICE: &str = "undefined";

/// Unique identifier for one file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capabilities reported by the device during the handshake.
///
/// Values are kept exactly as the device sent them, because the external
/// compressor expects them verbatim on its command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineProfile {
    pub x_mm_per_step: String,
    pub y_mm_per_step: String,
    pub z_mm_per_step: String,
    pub e_mm_per_step: String,
    pub machine_type: String,
    pub x_max: String,
    pub y_max: String,
    pub z_max: String,
    /// Text after `ok ` in the `M4002` reply. Empty until queried.
    pub firmware_version: String,
}

impl Default for MachineProfile {
    fn default() -> Self {
        Self {
            x_mm_per_step: "0.0".into(),
            y_mm_per_step: "0.0".into(),
            z_mm_per_step: "0.0".into(),
            e_mm_per_step: "0.0".into(),
            machine_type: "0".into(),
            x_max: "0.0".into(),
            y_max: "0.0".into(),
            z_max: "0.0".into(),
            firmware_version: String::new(),
        }
    }
}

impl MachineProfile {
    /// Build volume in millimetres, if the device reported parseable bounds.
    pub fn build_volume(&self) -> Option<(f64, f64, f64)> {
        Some((
            self.x_max.parse().ok()?,
            self.y_max.parse().ok()?,
            self.z_max.parse().ok()?,
        ))
    }
}

/// A current/target temperature pair as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub current: f32,
    pub target: f32,
}

/// What the printer is doing, derived from successive status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintState {
    Idle,
    Printing,
    /// A print is in progress but the device reports its idle flag.
    Paused,
}

/// Last known status of a printer. Overwritten in place by every successful
/// poll; fields the device did not mention keep their previous values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub bed: Option<Temperature>,
    pub extruder1: Option<Temperature>,
    pub extruder2: Option<Temperature>,
    /// Cooling fan duty on the device's 0-255 scale.
    pub fan: Option<u8>,
    pub x_position: Option<String>,
    pub y_position: Option<String>,
    pub z_position: Option<String>,
    pub elapsed_seconds: u64,
    pub progress_now: u64,
    pub progress_total: u64,
    /// Device idle flag (third field of the `D` token).
    pub idle: bool,
    /// Name of the file being printed, fetched when a print starts.
    pub active_file: String,
    /// Derived; see the status poller.
    pub is_printing: bool,
}

impl PrinterStatus {
    /// Fan duty as a whole percentage.
    pub fn fan_percent(&self) -> Option<u8> {
        self.fan.map(|duty| (f32::from(duty) / 2.55) as u8)
    }

    /// Print progress in `[0, 1]`, if the device reported a total.
    pub fn progress_fraction(&self) -> Option<f64> {
        if self.progress_total == 0 {
            return None;
        }
        Some((self.progress_now as f64 / self.progress_total as f64).min(1.0))
    }

    /// Total print duration extrapolated from elapsed time and progress.
    pub fn estimated_total_seconds(&self) -> Option<u64> {
        let fraction = self.progress_fraction()?;
        if fraction <= 0.0 {
            return None;
        }
        Some((self.elapsed_seconds as f64 / fraction) as u64)
    }

    pub fn state(&self) -> PrintState {
        match (self.is_printing, self.idle) {
            (false, _) => PrintState::Idle,
            (true, true) => PrintState::Paused,
            (true, false) => PrintState::Printing,
        }
    }
}

/// A device that answered a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub ip: IpAddr,
    pub name: String,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            name: UNNAMED_DEVICE.to_string(),
            last_seen: Utc::now(),
        }
    }
}

impl std::fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.ip)
    }
}

/// Summary of a completed upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub id: TransferId,
    /// File name as stored on the device (pass this to start-print).
    pub remote_name: String,
    /// Local file that was actually streamed (compressed sibling or original).
    pub source: PathBuf,
    pub compressed: bool,
    pub bytes: u64,
    /// Chunks the device acknowledged with `ok`.
    pub chunks_sent: u64,
    pub resends: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_percent_scales_duty() {
        let status = PrinterStatus {
            fan: Some(255),
            ..Default::default()
        };
        assert_eq!(status.fan_percent(), Some(100));

        let half = PrinterStatus {
            fan: Some(128),
            ..Default::default()
        };
        assert_eq!(half.fan_percent(), Some(50));
    }

    #[test]
    fn estimate_requires_progress() {
        let mut status = PrinterStatus {
            elapsed_seconds: 600,
            progress_now: 0,
            progress_total: 100,
            ..Default::default()
        };
        assert_eq!(status.estimated_total_seconds(), None);

        status.progress_now = 25;
        assert_eq!(status.estimated_total_seconds(), Some(2400));
    }

    #[test]
    fn paused_when_printing_and_idle() {
        let status = PrinterStatus {
            is_printing: true,
            idle: true,
            ..Default::default()
        };
        assert_eq!(status.state(), PrintState::Paused);
        assert_eq!(PrinterStatus::default().state(), PrintState::Idle);
    }

    #[test]
    fn device_display_and_default_name() {
        let dev = DiscoveredDevice::new("192.168.1.50".parse().unwrap());
        assert_eq!(dev.name, UNNAMED_DEVICE);
        assert_eq!(dev.to_string(), "undefined[192.168.1.50]");
    }

    #[test]
    fn build_volume_parses_bounds() {
        let profile = MachineProfile {
            x_max: "235".into(),
            y_max: "235.0".into(),
            z_max: "250".into(),
            ..Default::default()
        };
        assert_eq!(profile.build_volume(), Some((235.0, 235.0, 250.0)));
    }
}
