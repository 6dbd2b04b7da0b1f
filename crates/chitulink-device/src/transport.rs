// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Datagram transport underneath a session.
//
// The session only needs "send one datagram" and "receive one datagram within
// a deadline", so that is all the trait asks for. `UdpTransport` is the real
// implementation; tests substitute a scripted one.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

/// Largest UDP payload we accept from the device.
const MAX_DATAGRAM: usize = 65_507;

/// One peer, one datagram at a time.
pub trait Transport: Send {
    /// Send one datagram to the device.
    fn send(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Receive one datagram. `Some(timeout)` blocks up to that long; `None`
    /// only returns a datagram that is already pending.
    fn recv(&mut self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>>;

    /// Address of the device.
    fn peer(&self) -> SocketAddr;
}

/// Blocking UDP socket connected to a single device.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `peer`.
    pub fn connect(peer: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(peer)?;
        debug!(local = %socket.local_addr()?, peer = %peer, "UDP transport ready");
        Ok(Self {
            socket,
            peer,
            buf: vec![0; MAX_DATAGRAM],
        })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        match timeout {
            Some(wait) if !wait.is_zero() => {
                self.socket.set_nonblocking(false)?;
                self.socket.set_read_timeout(Some(wait))?;
            }
            _ => self.socket.set_nonblocking(true)?,
        }

        match self.socket.recv(&mut self.buf) {
            Ok(len) => Ok(Some(self.buf[..len].to_vec())),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            // ICMP port-unreachable from an earlier send surfaces here on a
            // connected socket; to the session it is just a missing reply.
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                trace!(peer = %self.peer, "device port unreachable");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}
