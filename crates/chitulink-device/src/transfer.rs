// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Chunked file upload over an established session.
//
// Protocol, in order:
//   1. `M28 <file>` opens the file on the device storage.
//   2. The file is streamed in fixed-size chunks, each followed by a 6-byte
//      trailer (offset, XOR checksum, sentinel). The device answers `ok`,
//      `resend <offset>` or an error.
//   3. `M29 <file>` closes it.
//
// The engine holds the session lock for the entire upload so status polls
// are dropped instead of interleaving with chunks. Cancellation is
// cooperative: the session's abort flag is checked before every chunk.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use chitulink_core::config::LinkConfig;
use chitulink_core::error::{ChituLinkError, Result};
use chitulink_core::types::{TransferId, TransferReport};

use crate::codec::{self, Command};
use crate::compress::{self, Compressor};
use crate::session::{Exchange, Session};

/// Timing and sizing for one upload.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: usize,
    /// Budget for `M28` / `M29`.
    pub command_timeout: Duration,
    pub command_retries: u32,
    /// Budget for one chunk.
    pub chunk_timeout: Duration,
    pub chunk_retries: u32,
    /// Consecutive timed-out rounds on one chunk before giving up.
    pub max_timeout_rounds: u32,
    /// How long to wait for the session lock before reporting `Busy`.
    pub lock_wait: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: codec::CHUNK_SIZE,
            command_timeout: Duration::from_secs(2),
            command_retries: 3,
            chunk_timeout: Duration::from_secs(2),
            chunk_retries: 3,
            max_timeout_rounds: 10,
            lock_wait: Duration::from_secs(1),
        }
    }
}

impl From<&LinkConfig> for TransferOptions {
    fn from(config: &LinkConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            lock_wait: config.command_lock_timeout(),
            ..Self::default()
        }
    }
}

/// Progress notifications for listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        id: TransferId,
        remote_name: String,
        bytes: u64,
    },
    /// Whole-percent progress; only ever increases within one upload.
    Progress(u8),
    Finished(TransferId),
}

/// State of one upload in flight.
struct TransferJob {
    total: u64,
    offset: u64,
    last_percent: u8,
    chunks_sent: u64,
    resends: u64,
    timeout_rounds: u32,
}

impl TransferJob {
    fn new(total: u64) -> Self {
        Self {
            total,
            offset: 0,
            last_percent: 0,
            chunks_sent: 0,
            resends: 0,
            timeout_rounds: 0,
        }
    }

    /// `floor(100 * offset / total)` if it moved past the last reported value.
    fn advance_progress(&mut self) -> Option<u8> {
        let percent = (self.offset.saturating_mul(100) / self.total).min(100) as u8;
        (percent > self.last_percent).then(|| {
            self.last_percent = percent;
            percent
        })
    }
}

pub struct TransferEngine {
    session: Arc<Session>,
    options: TransferOptions,
    listeners: Mutex<Vec<Sender<TransferEvent>>>,
}

impl TransferEngine {
    pub fn new(session: Arc<Session>, options: TransferOptions) -> Self {
        Self {
            session,
            options,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn subscribe(&self) -> Receiver<TransferEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Upload `source` as `<remote_base>.gcode`, or as `<remote_base>.gcode.tz`
    /// when `compressor` produces a compressed sibling.
    ///
    /// Connects on demand. The abort flag is cleared before and after.
    #[instrument(skip(self, source, compressor), fields(source = %source.display()))]
    pub fn upload(
        &self,
        source: &Path,
        remote_base: &str,
        compressor: &dyn Compressor,
    ) -> Result<TransferReport> {
        self.session.clear_abort();
        let result = self.upload_inner(source, remote_base, compressor);
        self.session.clear_abort();
        result
    }

    fn upload_inner(
        &self,
        source: &Path,
        remote_base: &str,
        compressor: &dyn Compressor,
    ) -> Result<TransferReport> {
        if file_len(source)? == 0 {
            warn!("file empty");
            return Err(ChituLinkError::FileEmpty);
        }

        if !self.session.is_connected() && !self.session.connect(1) {
            return Err(ChituLinkError::Disconnected);
        }

        let stale = compress::compressed_sibling(source);
        match std::fs::remove_file(&stale) {
            Ok(()) => debug!(path = %stale.display(), "removed stale compressed file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %stale.display(), error = %err, "cannot remove stale compressed file"),
        }

        let (send_path, remote_name, compressed) =
            match compressor.compress(source, &self.session.profile()) {
                Ok(path) if path.exists() => (path, format!("{remote_base}.gcode.tz"), true),
                Ok(path) => {
                    warn!(path = %path.display(), "compressor reported success but wrote nothing");
                    (source.to_path_buf(), format!("{remote_base}.gcode"), false)
                }
                Err(err) => {
                    debug!(error = %err, "uploading uncompressed");
                    (source.to_path_buf(), format!("{remote_base}.gcode"), false)
                }
            };

        let mut report = self.send_file(&send_path, &remote_name)?;
        report.compressed = compressed;
        Ok(report)
    }

    /// Stream `path` to the device as `remote_name`.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn send_file(&self, path: &Path, remote_name: &str) -> Result<TransferReport> {
        let mut file = File::open(path).map_err(|source| ChituLinkError::FileNotOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let total = file
            .metadata()
            .map_err(|source| ChituLinkError::FileNotOpen {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if total == 0 {
            warn!("file empty");
            return Err(ChituLinkError::FileEmpty);
        }

        let id = TransferId::new();
        let started_at = Utc::now();
        let mut link = self.session.lock(self.options.lock_wait)?;

        info!(%id, remote = remote_name, bytes = total, "creating file");
        self.publish(TransferEvent::Started {
            id,
            remote_name: remote_name.to_string(),
            bytes: total,
        });
        self.file_command(&mut link, Command::open_file(remote_name))?;

        let mut job = TransferJob::new(total);
        self.stream(&mut link, &mut file, &mut job)?;

        info!(%id, "closing file");
        self.file_command(&mut link, Command::close_file(remote_name))?;
        drop(link);

        info!(
            %id,
            remote = remote_name,
            chunks = job.chunks_sent,
            resends = job.resends,
            "upload complete"
        );
        self.publish(TransferEvent::Finished(id));

        Ok(TransferReport {
            id,
            remote_name: remote_name.to_string(),
            source: path.to_path_buf(),
            compressed: false,
            bytes: total,
            chunks_sent: job.chunks_sent,
            resends: job.resends,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run on a dedicated thread; the handle can abort or wait for it.
    pub fn spawn_upload(
        self: Arc<Self>,
        source: PathBuf,
        remote_base: String,
        compressor: Arc<dyn Compressor>,
    ) -> Result<TransferHandle> {
        let session = Arc::clone(&self.session);
        let join = std::thread::Builder::new()
            .name(format!("chitulink-upload-{remote_base}"))
            .spawn(move || self.upload(&source, &remote_base, compressor.as_ref()))?;
        Ok(TransferHandle { session, join })
    }

    // -- internal helpers ---------------------------------------------------

    fn file_command(&self, link: &mut Exchange<'_>, cmd: Command) -> Result<()> {
        let reply = link.request(
            &cmd,
            self.options.command_timeout,
            self.options.command_retries,
        )?;
        if reply.contains("Error") {
            warn!(reply = %reply.trim_end(), "device reported an error");
            return Err(ChituLinkError::WriteError(reply.trim_end().to_string()));
        }
        Ok(())
    }

    fn stream(&self, link: &mut Exchange<'_>, file: &mut File, job: &mut TransferJob) -> Result<()> {
        loop {
            if self.session.is_abort_requested() {
                info!(offset = job.offset, "upload aborted");
                return Err(ChituLinkError::Aborted);
            }
            if let Some(percent) = job.advance_progress() {
                self.publish(TransferEvent::Progress(percent));
            }

            let payload = read_chunk(file, job.offset, self.options.chunk_size)
                .map_err(|err| ChituLinkError::WriteError(format!("read failed: {err}")))?;
            if payload.is_empty() {
                debug!("reached end of file");
                return Ok(());
            }
            let wire_offset = u32::try_from(job.offset).map_err(|_| {
                ChituLinkError::WriteError(format!("offset {} exceeds 32 bits", job.offset))
            })?;

            let datagram = Command::Binary(codec::encode_chunk(&payload, wire_offset));
            match link.request(&datagram, self.options.chunk_timeout, self.options.chunk_retries) {
                Ok(reply) if reply.contains("ok") => {
                    job.offset += payload.len() as u64;
                    job.chunks_sent += 1;
                    job.timeout_rounds = 0;
                }
                Ok(reply) => {
                    warn!(offset = job.offset, reply = %reply.trim_end(), "chunk not acknowledged");
                    if !reply.contains("resend") {
                        return Err(ChituLinkError::WriteError(reply.trim_end().to_string()));
                    }
                    match codec::parse_resend(&reply) {
                        Some(offset) if offset <= job.total => {
                            job.offset = offset;
                            job.resends += 1;
                            job.timeout_rounds = 0;
                        }
                        _ => {
                            return Err(ChituLinkError::WriteError(format!(
                                "bad resend offset: {}",
                                reply.trim_end()
                            )));
                        }
                    }
                }
                Err(ChituLinkError::Timeout) => {
                    job.timeout_rounds += 1;
                    warn!(offset = job.offset, round = job.timeout_rounds, "chunk timeout");
                    if job.timeout_rounds >= self.options.max_timeout_rounds {
                        return Err(ChituLinkError::Timeout);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn publish(&self, event: TransferEvent) {
        self.listeners.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// An upload running on its own thread.
pub struct TransferHandle {
    session: Arc<Session>,
    join: JoinHandle<Result<TransferReport>>,
}

impl TransferHandle {
    /// Stop before the next chunk. No close command is sent.
    pub fn abort(&self) {
        self.session.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<TransferReport> {
        self.join
            .join()
            .map_err(|_| ChituLinkError::WriteError("upload thread panicked".into()))?
    }
}

fn file_len(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|source| ChituLinkError::FileNotOpen {
            path: path.to_path_buf(),
            source,
        })
}

/// Up to `size` bytes starting at `offset`; empty at end of file.
fn read_chunk(file: &mut File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(size);
    Read::take(&mut *file, size as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
