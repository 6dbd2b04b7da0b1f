// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ChituLink device layer: the UDP request/reply session, chunked file transfer,
// status polling and broadcast discovery for Chitu-firmware printers. All
// network exchanges with one device funnel through its `Session`.

pub mod codec;
pub mod compress;
pub mod discovery;
pub mod session;
pub mod status;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use codec::{Command, TextEncoding};
pub use compress::{Compressor, NoCompression};
pub use discovery::{DiscoveryEvent, DiscoveryScanner, ScanHandle};
pub use session::{Exchange, Session, SessionEvent};
pub use status::{PollerHandle, StatusEvent, StatusPoller};
pub use transfer::{TransferEngine, TransferEvent, TransferHandle, TransferOptions};
pub use transport::{Transport, UdpTransport};
