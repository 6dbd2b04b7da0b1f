// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service registry. Holds the settings, the device registry and the
// data directory, and builds device sessions on demand.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use chitulink_core::config::{DeviceRegistry, LinkConfig};
use chitulink_core::error::{ChituLinkError, Result};
use chitulink_core::types::{DiscoveredDevice, UNNAMED_DEVICE};
use chitulink_device::{
    Compressor, DiscoveryScanner, NoCompression, Session, StatusPoller, TransferEngine,
    TransferOptions,
};
use chitulink_gcode::{CaptureRect, ThumbnailEncoder, validate_file_name, write_upload_file};

use super::compressor::ExternalCompressor;
use super::data_dir::{CONFIG_FILE, DEVICES_FILE, data_subdir};

/// Shared application state, cheaply cloneable.
#[derive(Clone)]
pub struct AppServices {
    data_dir: PathBuf,
    config: Arc<LinkConfig>,
    registry: Arc<RwLock<DeviceRegistry>>,
}

impl AppServices {
    /// Load settings and the device registry from `data_dir`.
    ///
    /// A corrupt settings file is reported and replaced by the defaults so the
    /// tool stays usable.
    pub fn init(data_dir: PathBuf) -> Result<Self> {
        info!(path = %data_dir.display(), "initialising ChituLink services");

        let config = match LinkConfig::load(data_dir.join(CONFIG_FILE)) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "failed to load config, using defaults");
                LinkConfig::default()
            }
        };
        let registry = DeviceRegistry::load(data_dir.join(DEVICES_FILE))?;
        debug!(devices = registry.len(), "device registry loaded");

        Ok(Self {
            data_dir,
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(registry)),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // -- Device registry ---------------------------------------------------

    pub fn devices(&self) -> Vec<(String, String)> {
        self.registry
            .read()
            .iter()
            .map(|(name, url)| (name.to_string(), url.to_string()))
            .collect()
    }

    pub fn add_device(&self, name: &str, address: &str) -> Result<()> {
        let mut registry = self.registry.write();
        registry.save_device(None, name, address)?;
        registry.save(self.data_dir.join(DEVICES_FILE))
    }

    pub fn rename_device(&self, old_name: &str, name: &str, address: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.address_of(old_name).is_none() {
            return Err(ChituLinkError::Config(format!("unknown device: {old_name}")));
        }
        registry.save_device(Some(old_name), name, address)?;
        registry.save(self.data_dir.join(DEVICES_FILE))
    }

    pub fn remove_device(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.remove(name).is_none() {
            return Err(ChituLinkError::Config(format!("unknown device: {name}")));
        }
        registry.save(self.data_dir.join(DEVICES_FILE))
    }

    /// Resolve a registered device name or a literal IP address.
    pub fn resolve_device(&self, target: &str) -> Result<IpAddr> {
        if let Some(url) = self.registry.read().address_of(target) {
            return url
                .parse()
                .map_err(|_| ChituLinkError::Config(format!("bad address for {target}: {url}")));
        }
        target.parse().map_err(|_| {
            ChituLinkError::Config(format!("{target} is neither a saved device nor an IP address"))
        })
    }

    // -- Discovery ---------------------------------------------------------

    pub fn scanner(&self) -> DiscoveryScanner {
        DiscoveryScanner::new(&self.config)
    }

    /// Save discovered devices, naming unnamed ones by their address.
    /// Returns how many entries were added or updated.
    pub fn remember_devices(&self, devices: &[DiscoveredDevice]) -> Result<usize> {
        let mut registry = self.registry.write();
        let mut saved = 0;
        for device in devices {
            let address = device.ip.to_string();
            let name = if device.name == UNNAMED_DEVICE {
                address.clone()
            } else {
                device.name.clone()
            };
            let existing = registry.address_of(&name).is_some().then_some(name.as_str());
            match registry.save_device(existing, &name, &address) {
                Ok(()) => saved += 1,
                Err(err) => warn!(device = %device, error = %err, "device not saved"),
            }
        }
        registry.save(self.data_dir.join(DEVICES_FILE))?;
        Ok(saved)
    }

    // -- Sessions ----------------------------------------------------------

    /// Open a session to `target` and perform the handshake.
    pub fn connect(&self, target: &str) -> Result<Arc<Session>> {
        let address = self.resolve_device(target)?;
        let session = Session::open(address, &self.config)?;
        if !session.connect(self.config.connect_retries) {
            return Err(ChituLinkError::Timeout);
        }
        info!(
            %address,
            firmware = %session.firmware_version(),
            "connected to printer"
        );
        Ok(Arc::new(session))
    }

    pub fn transfer_engine(&self, session: Arc<Session>) -> TransferEngine {
        TransferEngine::new(session, TransferOptions::from(self.config.as_ref()))
    }

    pub fn status_poller(&self, session: Arc<Session>) -> StatusPoller {
        StatusPoller::new(session, &self.config)
    }

    pub fn compressor(&self) -> Arc<dyn Compressor> {
        match &self.config.compressor_path {
            Some(program) => Arc::new(ExternalCompressor::new(program)),
            None => Arc::new(NoCompression),
        }
    }

    // -- Upload preparation ------------------------------------------------

    /// Build the file that is actually uploaded: the G-code with an optional
    /// embedded preview and rewritten time comments. It lands in the
    /// `uploads` directory under the remote base name.
    pub fn prepare_upload_file(
        &self,
        gcode_path: &Path,
        remote_base: &str,
        thumbnail: Option<(&Path, Option<CaptureRect>)>,
    ) -> Result<PathBuf> {
        validate_file_name(remote_base)?;

        let gcode = std::fs::read_to_string(gcode_path).map_err(|source| {
            ChituLinkError::FileNotOpen {
                path: gcode_path.to_path_buf(),
                source,
            }
        })?;
        if gcode.is_empty() {
            return Err(ChituLinkError::FileEmpty);
        }

        let preview = match thumbnail {
            Some((image_path, rect)) => Some(encode_thumbnail(image_path, rect)?),
            None => None,
        };

        let target = data_subdir(&self.data_dir, "uploads").join(format!("{remote_base}.gcode"));
        let bytes = write_upload_file(&target, &gcode, preview.as_deref())?;
        info!(path = %target.display(), bytes, "upload file ready");
        Ok(target)
    }
}

fn encode_thumbnail(path: &Path, rect: Option<CaptureRect>) -> Result<String> {
    let encoder = ThumbnailEncoder::new();
    match rect {
        Some(rect) => {
            let image = image::open(path).map_err(|e| {
                ChituLinkError::Image(format!("cannot read {}: {e}", path.display()))
            })?;
            Ok(encoder.encode(&image, rect))
        }
        None => encoder.encode_file(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn services() -> (tempfile::TempDir, AppServices) {
        let dir = tempfile::tempdir().unwrap();
        let services = AppServices::init(dir.path().to_path_buf()).unwrap();
        (dir, services)
    }

    #[test]
    fn resolves_names_and_literal_addresses() {
        let (_dir, services) = services();
        services.add_device("X-Plus", "192.168.1.50").unwrap();

        assert_eq!(
            services.resolve_device("X-Plus").unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))
        );
        assert_eq!(
            services.resolve_device("10.0.0.7").unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
        );
        assert!(services.resolve_device("nowhere").is_err());
    }

    #[test]
    fn registry_survives_restart() {
        let (dir, services) = services();
        services.add_device("A", "10.0.0.2").unwrap();
        services.rename_device("A", "B", "10.0.0.3").unwrap();

        let reloaded = AppServices::init(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.devices(), vec![("B".to_string(), "10.0.0.3".to_string())]);

        reloaded.remove_device("B").unwrap();
        assert!(reloaded.remove_device("B").is_err());
    }

    #[test]
    fn discovered_devices_are_saved_by_name_or_address() {
        let (_dir, services) = services();
        let named = DiscoveredDevice {
            name: "Mars".into(),
            ..DiscoveredDevice::new("192.168.1.20".parse().unwrap())
        };
        let unnamed = DiscoveredDevice::new("192.168.1.21".parse().unwrap());

        assert_eq!(services.remember_devices(&[named.clone(), unnamed]).unwrap(), 2);
        // A second scan refreshes the existing entries.
        assert_eq!(services.remember_devices(&[named]).unwrap(), 1);

        let devices = services.devices();
        assert_eq!(devices.len(), 2);
        assert!(devices.contains(&("Mars".into(), "192.168.1.20".into())));
        assert!(devices.contains(&("192.168.1.21".into(), "192.168.1.21".into())));
    }

    #[test]
    fn corrupt_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        let services = AppServices::init(dir.path().to_path_buf()).unwrap();
        assert_eq!(services.config(), &LinkConfig::default());
    }

    #[test]
    fn prepared_upload_carries_thumbnail_and_time_info() {
        let (dir, services) = services();
        let gcode = dir.path().join("cube.gcode");
        std::fs::write(&gcode, ";TIME:1200\nG28\n").unwrap();
        let png = dir.path().join("preview.png");
        image::RgbaImage::from_pixel(4, 4, image::Rgba([255, 0, 0, 255]))
            .save(&png)
            .unwrap();

        let target = services
            .prepare_upload_file(&gcode, "cube", Some((&png, None)))
            .unwrap();

        assert_eq!(target.file_name().unwrap(), "cube.gcode");
        let text = std::fs::read_to_string(&target).unwrap();
        assert!(text.starts_with("M4010 X4 Y4\n"));
        assert!(text.contains("M2100 T1200"));
        assert!(text.ends_with("G28\n\n"));
    }

    #[test]
    fn prepare_rejects_bad_names_and_empty_files() {
        let (dir, services) = services();
        let gcode = dir.path().join("empty.gcode");
        std::fs::write(&gcode, "").unwrap();

        assert!(matches!(
            services.prepare_upload_file(&gcode, "bad/name", None),
            Err(ChituLinkError::InvalidFileName(_))
        ));
        assert!(matches!(
            services.prepare_upload_file(&gcode, "../escape", None),
            Err(ChituLinkError::InvalidFileName(_))
        ));
        assert!(!services.data_dir().join("escape.gcode").exists());
        assert!(matches!(
            services.prepare_upload_file(&gcode, "empty", None),
            Err(ChituLinkError::FileEmpty)
        ));
    }

    #[test]
    fn compressor_follows_config() {
        let (_dir, services) = services();
        let err = services
            .compressor()
            .compress(Path::new("x.gcode"), &Default::default())
            .unwrap_err();
        assert!(matches!(err, ChituLinkError::Compression(_)));
    }
}
