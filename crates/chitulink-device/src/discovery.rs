// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Broadcast discovery of devices on the local subnets.
//
// For a fixed window the scanner broadcasts `M99999` once per cadence tick to
// every local broadcast address and collects replies. A reply containing
// `ok MAC:` is a device, keyed by source IP; `NAME:<token>` names it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use if_addrs::{IfAddr, get_if_addrs};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use chitulink_core::config::LinkConfig;
use chitulink_core::error::{ChituLinkError, Result};
use chitulink_core::types::DiscoveredDevice;

use crate::codec;

/// Marker every discovery reply carries.
const REPLY_MARKER: &str = "ok MAC:";
const NAME_PREFIX: &str = "NAME:";
/// Shortest read timeout used while waiting for replies.
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A scan started and the device list was emptied.
    Cleared,
    Found(DiscoveredDevice),
    /// The scan window closed; the complete list.
    Finished(Vec<DiscoveredDevice>),
}

pub struct DiscoveryScanner {
    port: u16,
    window: Duration,
    cadence: Duration,
    /// Explicit probe targets; `None` means every local broadcast address.
    targets: Option<Vec<IpAddr>>,
    devices: Mutex<Vec<DiscoveredDevice>>,
    listeners: Mutex<Vec<Sender<DiscoveryEvent>>>,
    cancel: AtomicBool,
}

impl DiscoveryScanner {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            port: config.device_port,
            window: config.discovery_window(),
            cadence: config.discovery_cadence(),
            targets: None,
            devices: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            cancel: AtomicBool::new(false),
        }
    }

    /// Probe these addresses instead of the local broadcast addresses.
    pub fn with_targets(mut self, targets: Vec<IpAddr>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn subscribe(&self) -> Receiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Devices found by the current or most recent scan.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.lock().clone()
    }

    /// End the running scan at its next wake-up.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Broadcast for the whole window and return every unique device.
    #[instrument(skip(self), fields(port = self.port))]
    pub fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        self.cancel.store(false, Ordering::SeqCst);
        self.devices.lock().clear();
        self.publish(DiscoveryEvent::Cleared);

        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .and_then(|socket| socket.set_broadcast(true).map(|()| socket))
            .map_err(|e| ChituLinkError::Discovery(format!("cannot open discovery socket: {e}")))?;

        let targets: Vec<SocketAddr> = match &self.targets {
            Some(targets) => targets.clone(),
            None => broadcast_addresses().into_iter().map(IpAddr::V4).collect(),
        }
        .into_iter()
        .map(|ip| SocketAddr::new(ip, self.port))
        .collect();
        info!(targets = targets.len(), window_ms = self.window.as_millis() as u64, "discovery started");

        let started = Instant::now();
        let deadline = started + self.window;
        let mut next_probe = started;
        let mut buf = [0u8; 1024];

        loop {
            let now = Instant::now();
            if self.cancel.load(Ordering::SeqCst) || now >= deadline {
                break;
            }
            if now >= next_probe {
                for target in &targets {
                    if let Err(err) = socket.send_to(codec::DISCOVERY_PROBE.as_bytes(), target) {
                        warn!(%target, error = %err, "discovery probe failed");
                    }
                }
                trace!("discovery probe sent");
                next_probe += self.cadence;
            }

            let wake = next_probe.min(deadline);
            let wait = wake.saturating_duration_since(Instant::now()).max(MIN_WAIT);
            socket.set_read_timeout(Some(wait))?;
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let message = String::from_utf8_lossy(&buf[..len]);
                    if let Some(device) = parse_reply(message.trim_end(), from.ip()) {
                        self.register(device);
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(err) => debug!(error = %err, "discovery receive failed"),
            }
        }

        let devices = self.devices();
        info!(found = devices.len(), "discovery finished");
        self.publish(DiscoveryEvent::Finished(devices.clone()));
        Ok(devices)
    }

    /// Add a device unless one with the same IP is already known.
    pub fn register(&self, device: DiscoveredDevice) -> bool {
        {
            let mut devices = self.devices.lock();
            if devices.iter().any(|known| known.ip == device.ip) {
                debug!(ip = %device.ip, "reply from known device");
                return false;
            }
            devices.push(device.clone());
        }
        info!(device = %device, "device found");
        self.publish(DiscoveryEvent::Found(device));
        true
    }

    /// Run a scan on its own thread.
    pub fn spawn(self: Arc<Self>) -> Result<ScanHandle> {
        let scanner = Arc::clone(&self);
        let join = std::thread::Builder::new()
            .name("chitulink-discovery".into())
            .spawn(move || scanner.scan())?;
        Ok(ScanHandle {
            scanner: self,
            join,
        })
    }

    fn publish(&self, event: DiscoveryEvent) {
        self.listeners.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

pub struct ScanHandle {
    scanner: Arc<DiscoveryScanner>,
    join: JoinHandle<Result<Vec<DiscoveredDevice>>>,
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.scanner.cancel();
    }

    pub fn join(self) -> Result<Vec<DiscoveredDevice>> {
        self.join
            .join()
            .map_err(|_| ChituLinkError::Discovery("discovery thread panicked".into()))?
    }
}

/// Device announced by one discovery reply, if it is one.
pub fn parse_reply(message: &str, ip: IpAddr) -> Option<DiscoveredDevice> {
    if !message.contains(REPLY_MARKER) {
        return None;
    }
    let mut device = DiscoveredDevice::new(ip);
    if let Some(start) = message.find(NAME_PREFIX) {
        let name = message[start + NAME_PREFIX.len()..]
            .split(' ')
            .next()
            .unwrap_or_default();
        if !name.is_empty() {
            device.name = name.to_string();
        }
    }
    Some(device)
}

/// Broadcast address of every non-loopback IPv4 interface, or the limited
/// broadcast address when none is found.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    match get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                let IfAddr::V4(v4) = iface.addr else {
                    continue;
                };
                if v4.ip.is_loopback() {
                    continue;
                }
                let broadcast = v4
                    .broadcast
                    .unwrap_or_else(|| directed_broadcast(v4.ip, v4.netmask));
                trace!(interface = %iface.name, %broadcast, "broadcast address");
                if !addresses.contains(&broadcast) {
                    addresses.push(broadcast);
                }
            }
        }
        Err(err) => warn!(error = %err, "cannot list network interfaces"),
    }

    if addresses.is_empty() {
        warn!("no valid broadcast address, using 255.255.255.255");
        addresses.push(Ipv4Addr::BROADCAST);
    }
    addresses
}

/// `ip | !netmask`.
pub fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}
