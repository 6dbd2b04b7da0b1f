// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::transport::Transport;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<String> + Send>;

/// Records every datagram and answers with whatever the responder returns.
pub(crate) struct ScriptedTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pending: VecDeque<Vec<u8>>,
    responder: Responder,
}

impl ScriptedTransport {
    pub(crate) fn new(
        responder: impl FnMut(&[u8]) -> Vec<String> + Send + 'static,
    ) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Self {
            sent: Arc::clone(&sent),
            pending: VecDeque::new(),
            responder: Box::new(responder),
        };
        (transport, sent)
    }

    /// Queue a reply that is already waiting before anything is sent.
    pub(crate) fn with_stale(mut self, reply: &str) -> Self {
        self.pending.push_back(reply.as_bytes().to_vec());
        self
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.sent.lock().push(datagram.to_vec());
        for reply in (self.responder)(datagram) {
            self.pending.push_back(reply.into_bytes());
        }
        Ok(())
    }

    fn recv(&mut self, _timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        Ok(self.pending.pop_front())
    }

    fn peer(&self) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 50], 3000))
    }
}

/// Sent datagrams rendered as text (binary chunks become lossy strings).
pub(crate) fn sent_text(sent: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<String> {
    sent.lock()
        .iter()
        .map(|d| String::from_utf8_lossy(d).into_owned())
        .collect()
}
