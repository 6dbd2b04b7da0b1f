// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stateful request/reply session with one device.
//
// Every exchange goes through a single timed lock: callers either get the
// link within a bounded wait or receive `ChituLinkError::Busy`, never block
// indefinitely. Holding the resulting `Exchange` guard lets a caller (the
// transfer engine) run many round trips without another component slipping
// datagrams in between.
//
// State machine: Disconnected --handshake--> Connected --disconnect marker in
// any reply, or repeated poll failures--> Disconnected. Reconnecting is up to
// the caller.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use chitulink_core::config::LinkConfig;
use chitulink_core::error::{ChituLinkError, Result};
use chitulink_core::types::MachineProfile;

use crate::codec::{self, Command, TextEncoding};
use crate::transport::{Transport, UdpTransport};

/// How long one handshake attempt waits for the `M4001` reply.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest wait for the lock when connecting.
const CONNECT_LOCK_WAIT: Duration = Duration::from_secs(5);
/// Budget for the firmware-version follow-up.
const FIRMWARE_TIMEOUT: Duration = Duration::from_secs(2);
const FIRMWARE_RETRIES: u32 = 2;
/// Budget for start-print.
const PRINT_TIMEOUT: Duration = Duration::from_secs(2);
const PRINT_RETRIES: u32 = 3;

/// Connection changes published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionChanged(bool),
}

/// A session with one device.
pub struct Session {
    peer: SocketAddr,
    link: Mutex<Box<dyn Transport>>,
    connected: AtomicBool,
    abort: AtomicBool,
    encoding: RwLock<TextEncoding>,
    profile: RwLock<MachineProfile>,
    command_lock_wait: Duration,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl Session {
    /// Create a disconnected session talking UDP to `address`.
    pub fn open(address: IpAddr, config: &LinkConfig) -> Result<Self> {
        let transport = UdpTransport::connect(SocketAddr::new(address, config.device_port))?;
        Ok(Self::with_transport(Box::new(transport), config))
    }

    /// Create a disconnected session over an arbitrary transport.
    pub fn with_transport(transport: Box<dyn Transport>, config: &LinkConfig) -> Self {
        Self {
            peer: transport.peer(),
            link: Mutex::new(transport),
            connected: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            encoding: RwLock::new(TextEncoding::default()),
            profile: RwLock::new(MachineProfile::default()),
            command_lock_wait: config.command_lock_timeout(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    // -- Accessors ------------------------------------------------------------

    pub fn address(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn port(&self) -> u16 {
        self.peer.port()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn encoding(&self) -> TextEncoding {
        *self.encoding.read()
    }

    /// Snapshot of what the handshake reported.
    pub fn profile(&self) -> MachineProfile {
        self.profile.read().clone()
    }

    pub fn firmware_version(&self) -> String {
        self.profile.read().firmware_version.clone()
    }

    /// Receive connection-state changes.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    // -- Cancellation ---------------------------------------------------------

    /// Ask the in-flight operation to stop at its next check.
    pub fn abort(&self) {
        info!(peer = %self.peer, "abort requested");
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    // -- Locking --------------------------------------------------------------

    /// Take exclusive use of the link, waiting at most `wait`.
    pub fn lock(&self, wait: Duration) -> Result<Exchange<'_>> {
        match self.link.try_lock_for(wait) {
            Some(transport) => Ok(Exchange {
                session: self,
                transport,
            }),
            None => {
                debug!(peer = %self.peer, wait_ms = wait.as_millis() as u64, "lock not available");
                Err(ChituLinkError::Busy)
            }
        }
    }

    // -- Operations -----------------------------------------------------------

    /// Handshake with the device, trying up to `retries` times.
    ///
    /// Never fails beyond the returned flag; problems are logged.
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub fn connect(&self, retries: u32) -> bool {
        match self.lock(CONNECT_LOCK_WAIT) {
            Ok(mut link) => link.handshake(retries),
            Err(_) => {
                warn!("cannot connect: session busy");
                false
            }
        }
    }

    /// One request/reply exchange under the command lock.
    pub fn request(&self, cmd: impl Into<Command>, timeout: Duration, retries: u32) -> Result<String> {
        self.lock(self.command_lock_wait)?
            .request(&cmd.into(), timeout, retries)
    }

    /// Fire-and-forget. If the lock is not free within the command wait the
    /// command is dropped; returns whether it was sent.
    pub fn send_command(&self, cmd: impl Into<Command>) -> bool {
        let cmd = cmd.into();
        let mut link = match self.lock(self.command_lock_wait) {
            Ok(link) => link,
            Err(_) => {
                warn!(peer = %self.peer, "timeout: lock not available, command dropped");
                return false;
            }
        };
        if let Command::Text(text) = &cmd {
            debug!(peer = %self.peer, cmd = %text, "sending command");
        }
        match link.send(&cmd) {
            Ok(()) => true,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "send failed");
                false
            }
        }
    }

    /// Start printing a file already stored on the device.
    pub fn start_print(&self, remote_name: &str) -> Result<()> {
        let reply = self.request(Command::start_print(remote_name), PRINT_TIMEOUT, PRINT_RETRIES)?;
        if reply.contains("Error") {
            warn!(reply = %reply.trim_end(), "device refused to start print");
            return Err(ChituLinkError::PrintRejected(reply.trim_end().to_string()));
        }
        info!(file = remote_name, "print started");
        Ok(())
    }

    pub fn pause(&self) -> bool {
        self.send_command(codec::PAUSE)
    }

    pub fn resume(&self) -> bool {
        self.send_command(codec::RESUME)
    }

    pub fn cancel(&self) -> bool {
        self.send_command(codec::CANCEL)
    }

    /// Force the Disconnected state (disconnect marker, repeated poll failures).
    pub fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(peer = %self.peer, "device disconnected");
            self.publish(SessionEvent::ConnectionChanged(false));
        }
    }

    fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.publish(SessionEvent::ConnectionChanged(true));
        }
    }

    fn publish(&self, event: SessionEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event).is_ok());
    }
}

/// Exclusive use of a session's link. Dropping it releases the lock.
pub struct Exchange<'a> {
    session: &'a Session,
    transport: MutexGuard<'a, Box<dyn Transport>>,
}

impl Exchange<'_> {
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Send one command without waiting for a reply.
    pub fn send(&mut self, cmd: &Command) -> Result<()> {
        let bytes = cmd.to_bytes(self.session.encoding());
        self.transport.send(&bytes)?;
        Ok(())
    }

    /// Wait up to `timeout` for a reply, then collect every datagram already
    /// pending into one string. A disconnect marker flips the session to
    /// Disconnected and is reported as such.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<String>> {
        let wait = (!timeout.is_zero()).then_some(timeout);
        let Some(first) = self.transport.recv(wait)? else {
            return Ok(None);
        };

        let encoding = self.session.encoding();
        let mut reply = encoding.decode(&first);
        while let Some(more) = self.transport.recv(None)? {
            reply.push_str(&encoding.decode(&more));
        }

        if codec::has_disconnect_marker(&reply) {
            warn!(reply = %reply.trim_end(), "device reported disconnect");
            self.session.mark_disconnected();
            return Err(ChituLinkError::Disconnected);
        }
        Ok(Some(reply))
    }

    /// Drop any reply left over from an earlier exchange.
    pub fn discard_pending(&mut self) {
        match self.receive(Duration::ZERO) {
            Ok(Some(stale)) => trace!(stale = %stale.trim_end(), "discarded stale reply"),
            Ok(None) | Err(ChituLinkError::Disconnected) => {}
            Err(err) => debug!(error = %err, "error while discarding stale replies"),
        }
    }

    /// Send `cmd` and wait for a reply, resending up to `retries` times.
    ///
    /// Fails without sending when the session is disconnected or an abort has
    /// been requested; both are re-checked before every attempt.
    pub fn request(&mut self, cmd: &Command, timeout: Duration, retries: u32) -> Result<String> {
        self.discard_pending();

        for attempt in 1..=retries {
            if self.session.is_abort_requested() {
                return Err(ChituLinkError::Aborted);
            }
            if !self.session.is_connected() {
                return Err(ChituLinkError::Disconnected);
            }
            if let Command::Text(text) = cmd {
                debug!(attempt, peer = %self.session.peer, cmd = %text, "sending command");
            }

            self.send(cmd)?;
            if let Some(reply) = self.receive(timeout)? {
                if cmd.is_text() {
                    debug!(peer = %self.session.peer, reply = %reply.trim_end(), "got reply");
                }
                return Ok(reply);
            }
            trace!(attempt, "no reply within timeout");
        }
        Err(ChituLinkError::Timeout)
    }

    /// Run the `M4001` handshake, then fetch the firmware version.
    pub fn handshake(&mut self, retries: u32) -> bool {
        let peer = self.session.peer;
        for _ in 0..retries {
            if self.session.is_connected() {
                return true;
            }
            if let Err(err) = self.send(&Command::text(codec::HANDSHAKE)) {
                warn!(%peer, error = %err, "handshake send failed");
                continue;
            }
            let reply = match self.receive(HANDSHAKE_TIMEOUT) {
                Ok(Some(reply)) => reply,
                Ok(None) | Err(_) => {
                    warn!(%peer, "connection timeout");
                    continue;
                }
            };

            let reply = reply.trim_end();
            debug!(%peer, reply, "handshake reply");
            {
                let mut profile = self.session.profile.write();
                if let Some(label) = apply_handshake(&mut profile, reply) {
                    let encoding = TextEncoding::from_label(&label).unwrap_or_else(|| {
                        warn!(label = %label, "unsupported text encoding, using UTF-8");
                        TextEncoding::utf8()
                    });
                    *self.session.encoding.write() = encoding;
                }
            }

            self.session.mark_connected();
            info!(%peer, "connected");

            match self.request(
                &Command::text(codec::FIRMWARE_VERSION),
                FIRMWARE_TIMEOUT,
                FIRMWARE_RETRIES,
            ) {
                Ok(reply) => {
                    if let Some(version) = codec::firmware_from_reply(&reply) {
                        info!(%peer, firmware = version, "firmware version");
                        self.session.profile.write().firmware_version = version.to_string();
                    }
                }
                Err(err) => debug!(%peer, error = %err, "firmware version query failed"),
            }

            return true;
        }
        self.session.is_connected()
    }
}

/// Apply `KEY:VALUE` handshake tokens to `profile`; returns the charset
/// label from the `U` token if present.
pub fn apply_handshake(profile: &mut MachineProfile, reply: &str) -> Option<String> {
    let mut encoding = None;
    for (key, value) in codec::key_values(reply) {
        match key {
            "X" => profile.x_mm_per_step = value.to_string(),
            "Y" => profile.y_mm_per_step = value.to_string(),
            "Z" => profile.z_mm_per_step = value.to_string(),
            "E" => profile.e_mm_per_step = value.to_string(),
            "T" => {
                let fields: Vec<&str> = value.split('/').collect();
                if let [machine_type, x_max, y_max, z_max, _reserved] = fields[..] {
                    profile.machine_type = machine_type.to_string();
                    profile.x_max = x_max.to_string();
                    profile.y_max = y_max.to_string();
                    profile.z_max = z_max.to_string();
                }
            }
            "U" => encoding = Some(value.replace('\'', "")),
            _ => {}
        }
    }
    encoding
}
