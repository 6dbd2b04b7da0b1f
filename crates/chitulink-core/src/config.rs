// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application configuration and the persisted device registry.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ChituLinkError, Result};
use crate::types::DEVICE_PORT;

/// Persistent link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// UDP port of the device (default 3000).
    pub device_port: u16,
    /// Longest wait for the session lock before a command is dropped.
    pub command_lock_ms: u64,
    /// Longest wait for the session lock before a status poll is skipped.
    pub status_lock_ms: u64,
    /// Handshake attempts made by an explicit connect.
    pub connect_retries: u32,
    /// Period of the background status poller.
    pub poll_interval_ms: u64,
    /// Length of one discovery scan.
    pub discovery_window_ms: u64,
    /// Period between discovery broadcasts within a scan.
    pub discovery_cadence_ms: u64,
    /// Payload bytes per transfer chunk.
    pub chunk_size: usize,
    /// Start printing as soon as an upload succeeds.
    pub auto_print: bool,
    /// Optional external G-code compressor executable.
    pub compressor_path: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_port: DEVICE_PORT,
            command_lock_ms: 1000,
            status_lock_ms: 500,
            connect_retries: 3,
            poll_interval_ms: 1000,
            discovery_window_ms: 5000,
            discovery_cadence_ms: 1000,
            chunk_size: 1280,
            auto_print: false,
            compressor_path: None,
        }
    }
}

impl LinkConfig {
    pub fn command_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.command_lock_ms)
    }

    pub fn status_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.status_lock_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn discovery_cadence(&self) -> Duration {
        Duration::from_millis(self.discovery_cadence_ms)
    }

    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        if config.chunk_size == 0 {
            return Err(ChituLinkError::Config("chunk_size must be positive".into()));
        }
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// One saved device entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    /// Last known IPv4 address.
    pub url: String,
}

/// Mapping of device display name to last known address, persisted by the
/// host and used to re-create sessions at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, RegisteredDevice>,
}

impl DeviceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        info!(count = self.devices.len(), "device registry saved");
        Ok(())
    }

    /// Add or replace a device. When `old_name` is given the entry is renamed.
    pub fn save_device(&mut self, old_name: Option<&str>, name: &str, address: &str) -> Result<()> {
        let name = name.trim();
        if !is_valid_address(address) {
            return Err(ChituLinkError::Config(format!("not an IPv4 address: {address}")));
        }
        if !self.is_valid_name(old_name, name) {
            return Err(ChituLinkError::Config(format!("invalid or duplicate device name: {name:?}")));
        }
        if let Some(old) = old_name {
            self.devices.remove(old);
        }
        self.devices.insert(
            name.to_string(),
            RegisteredDevice {
                url: address.to_string(),
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<RegisteredDevice> {
        self.devices.remove(name)
    }

    pub fn address_of(&self, name: &str) -> Option<&str> {
        self.devices.get(name).map(|d| d.url.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.devices.iter().map(|(n, d)| (n.as_str(), d.url.as_str()))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Names must be non-empty and unique; keeping an entry's own name is fine.
    pub fn is_valid_name(&self, old_name: Option<&str>, new_name: &str) -> bool {
        if new_name.is_empty() {
            return false;
        }
        if old_name == Some(new_name) {
            return true;
        }
        !self.devices.contains_key(new_name)
    }
}

/// Dotted-quad IPv4 address with a non-zero first octet.
pub fn is_valid_address(address: &str) -> bool {
    address
        .parse::<Ipv4Addr>()
        .map(|ip| ip.octets()[0] != 0)
        .unwrap_or(false)
}
