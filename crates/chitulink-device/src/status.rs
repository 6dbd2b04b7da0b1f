// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Periodic status polling.
//
// Each poll sends `M4000`, decodes the `KEY:VALUE` reply into the shared
// `PrinterStatus` record and derives the idle/printing transition. A poll
// that cannot get the session lock (an upload holds it) is dropped without
// counting as a failure; more than two consecutive failed polls force the
// session into the Disconnected state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use chitulink_core::config::LinkConfig;
use chitulink_core::error::{ChituLinkError, Result};
use chitulink_core::types::{PrinterStatus, Temperature};

use crate::codec::{self, Command};
use crate::session::Session;

const STATUS_TIMEOUT: Duration = Duration::from_millis(100);
const STATUS_RETRIES: u32 = 3;
/// Consecutive failures tolerated before the session is marked disconnected.
const MAX_FAILURES: u32 = 2;
/// Samples kept for the remaining-time estimate.
const HISTORY_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Updated(PrinterStatus),
    /// `file` is empty if the device did not answer the `M4006` query.
    PrintStarted { file: String },
    PrintFinished,
    ConnectionLost,
}

/// What a reply says about whether a print is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintEvidence {
    Printing,
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    progress_now: u64,
}

#[derive(Debug, Default)]
struct PollState {
    status: PrinterStatus,
    fail_count: u32,
    history: VecDeque<Sample>,
}

pub struct StatusPoller {
    session: Arc<Session>,
    state: Mutex<PollState>,
    listeners: Mutex<Vec<Sender<StatusEvent>>>,
    lock_wait: Duration,
}

impl StatusPoller {
    pub fn new(session: Arc<Session>, config: &LinkConfig) -> Self {
        Self {
            session,
            state: Mutex::new(PollState::default()),
            listeners: Mutex::new(Vec::new()),
            lock_wait: config.status_lock_timeout(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Snapshot of the last decoded status.
    pub fn status(&self) -> PrinterStatus {
        self.state.lock().status.clone()
    }

    pub fn fail_count(&self) -> u32 {
        self.state.lock().fail_count
    }

    /// Seconds left in the current print, from the recent progress rate when
    /// there is one, otherwise from the whole-print average.
    pub fn remaining_seconds(&self) -> Option<u64> {
        let state = self.state.lock();
        let status = &state.status;
        if !status.is_printing || status.progress_total == 0 {
            return None;
        }
        let left = status.progress_total.saturating_sub(status.progress_now);

        if let (Some(first), Some(last)) = (state.history.front(), state.history.back()) {
            let advanced = last.progress_now.saturating_sub(first.progress_now);
            let secs = last.at.duration_since(first.at).as_secs_f64();
            if advanced > 0 && secs > 0.0 {
                return Some((left as f64 * secs / advanced as f64) as u64);
            }
        }
        status
            .estimated_total_seconds()
            .map(|total| total.saturating_sub(status.elapsed_seconds))
    }

    /// Run one poll. A disconnected session gets one handshake attempt
    /// first, made under the same bounded lock wait as the poll itself.
    #[instrument(skip(self), fields(peer = %self.session.address()))]
    pub fn poll_once(&self) -> Result<PrinterStatus> {
        let mut link = match self.session.lock(self.lock_wait) {
            Ok(link) => link,
            Err(err) => {
                debug!("timeout: lock not available");
                return Err(err);
            }
        };

        if !self.session.is_connected() {
            if !link.handshake(1) {
                return Err(ChituLinkError::Disconnected);
            }
            info!("reconnected");
        }

        let reply = match link.request(&Command::text(codec::STATUS), STATUS_TIMEOUT, STATUS_RETRIES) {
            Ok(reply) => reply,
            Err(err) => {
                drop(link);
                self.record_failure();
                return Err(err);
            }
        };

        let mut state = self.state.lock();
        state.fail_count = 0;
        let evidence = apply_status_reply(&mut state.status, &reply);

        let mut events = Vec::new();
        match evidence {
            Some(PrintEvidence::Printing) if !state.status.is_printing => {
                state.status.is_printing = true;
                state.history.clear();
                let file = match link.request(&Command::text(codec::ACTIVE_FILE), STATUS_TIMEOUT, STATUS_RETRIES) {
                    Ok(reply) => codec::quoted_text(&reply).unwrap_or_default().to_string(),
                    Err(err) => {
                        debug!(error = %err, "active file query failed");
                        String::new()
                    }
                };
                info!(file = %file, "print started");
                state.status.active_file = file.clone();
                events.push(StatusEvent::PrintStarted { file });
            }
            Some(PrintEvidence::Idle) if state.status.is_printing => {
                state.status.is_printing = false;
                info!("print finished");
                events.push(StatusEvent::PrintFinished);
            }
            _ => {}
        }
        drop(link);

        if state.status.is_printing {
            let sample = Sample {
                at: Instant::now(),
                progress_now: state.status.progress_now,
            };
            if state.history.len() == HISTORY_LEN {
                state.history.pop_front();
            }
            state.history.push_back(sample);
        }

        let status = state.status.clone();
        drop(state);

        events.push(StatusEvent::Updated(status.clone()));
        for event in events {
            self.publish(event);
        }
        Ok(status)
    }

    /// Poll every `interval` on a dedicated thread until the handle is stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Result<PollerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(format!("chitulink-status-{}", self.session.address()))
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    if let Err(err) = self.poll_once() {
                        trace!(error = %err, "poll failed");
                    }
                    std::thread::park_timeout(interval);
                }
                debug!("status poller stopped");
            })?;
        Ok(PollerHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn record_failure(&self) {
        let failures = {
            let mut state = self.state.lock();
            state.fail_count += 1;
            state.fail_count
        };
        debug!(failures, "status poll failed");
        if failures > MAX_FAILURES && self.session.is_connected() {
            warn!(failures, "device stopped answering status polls");
            self.session.mark_disconnected();
            self.publish(StatusEvent::ConnectionLost);
        }
    }

    fn publish(&self, event: StatusEvent) {
        self.listeners.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// A running poll loop; stops and joins on drop.
pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("status poller thread panicked");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decode an `M4000` reply into `status`.
///
/// Tokens that do not parse are logged and skipped; the rest still apply.
/// Returns the print evidence: from `T` (elapsed seconds) when present,
/// otherwise from `D` (progress and idle flag), otherwise none.
pub fn apply_status_reply(status: &mut PrinterStatus, reply: &str) -> Option<PrintEvidence> {
    let mut elapsed = None;
    let mut progress = None;

    for (key, value) in codec::key_values(reply) {
        let applied = match key {
            "B" => parse_temperature(value).map(|t| status.bed = Some(t)),
            "E1" => parse_temperature(value).map(|t| status.extruder1 = Some(t)),
            "E2" => parse_temperature(value).map(|t| status.extruder2 = Some(t)),
            "D" => parse_progress(value).map(|(now, total, idle)| {
                status.progress_now = now;
                status.progress_total = total;
                status.idle = idle;
                progress = Some((now, idle));
            }),
            "F" => value
                .split('/')
                .next()
                .and_then(|duty| duty.parse::<u8>().ok())
                .map(|duty| status.fan = Some(duty)),
            "X" => {
                status.x_position = Some(value.to_string());
                Some(())
            }
            "Y" => {
                status.y_position = Some(value.to_string());
                Some(())
            }
            "Z" => {
                status.z_position = Some(value.to_string());
                Some(())
            }
            "T" => value.parse::<u64>().ok().map(|secs| {
                status.elapsed_seconds = secs;
                elapsed = Some(secs);
            }),
            _ => Some(()),
        };
        if applied.is_none() {
            warn!(token = key, value, "could not parse status token");
        }
    }

    match (elapsed, progress) {
        (Some(secs), _) if secs > 0 => Some(PrintEvidence::Printing),
        (Some(_), _) => Some(PrintEvidence::Idle),
        (None, Some((now, idle))) if now > 0 && !idle => Some(PrintEvidence::Printing),
        (None, Some(_)) => Some(PrintEvidence::Idle),
        (None, None) => None,
    }
}

fn parse_temperature(value: &str) -> Option<Temperature> {
    let (current, target) = value.split_once('/')?;
    if target.contains('/') {
        return None;
    }
    Some(Temperature {
        current: current.parse().ok()?,
        target: target.parse().ok()?,
    })
}

fn parse_progress(value: &str) -> Option<(u64, u64, bool)> {
    let mut parts = value.split('/');
    let (now, total, idle) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some((now.parse().ok()?, total.parse().ok()?, idle == "1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, sent_text};

    /// A connected poller whose device answers `M4000` with `replies` in turn
    /// (an empty string means no answer).
    fn poller(replies: Vec<&'static str>) -> (StatusPoller, Arc<Mutex<Vec<Vec<u8>>>>) {
        let mut replies = replies.into_iter();
        let (transport, sent) = ScriptedTransport::new(move |d| match d {
            b"M4001" => vec!["ok".into()],
            b"M4002" => vec!["ok V1".into()],
            b"M4006" => vec!["ok '/sd/cube.gcode'".into()],
            b"M4000" => match replies.next() {
                Some("") | None => Vec::new(),
                Some(reply) => vec![reply.to_string()],
            },
            _ => Vec::new(),
        });
        let session = Arc::new(Session::with_transport(Box::new(transport), &LinkConfig::default()));
        assert!(session.connect(1));
        sent.lock().clear();
        (StatusPoller::new(session, &LinkConfig::default()), sent)
    }

    fn transitions(events: &Receiver<StatusEvent>) -> Vec<StatusEvent> {
        events
            .try_iter()
            .filter(|e| !matches!(e, StatusEvent::Updated(_)))
            .collect()
    }

    #[test]
    fn decodes_full_reply() {
        let mut status = PrinterStatus::default();
        let evidence = apply_status_reply(
            &mut status,
            "ok B:60/60 E1:210/215 E2:25/0 D:123/4567/0 F:255/255 X:10.5 Y:20.0 Z:0.3 T:42\r\n",
        );
        assert_eq!(evidence, Some(PrintEvidence::Printing));
        assert_eq!(status.bed, Some(Temperature { current: 60.0, target: 60.0 }));
        assert_eq!(status.extruder1.map(|t| t.target), Some(215.0));
        assert_eq!(status.extruder2.map(|t| t.current), Some(25.0));
        assert_eq!((status.progress_now, status.progress_total), (123, 4567));
        assert!(!status.idle);
        assert_eq!(status.fan_percent(), Some(100));
        assert_eq!(status.z_position.as_deref(), Some("0.3"));
        assert_eq!(status.elapsed_seconds, 42);
    }

    #[test]
    fn malformed_tokens_are_skipped() {
        let mut status = PrinterStatus::default();
        let evidence = apply_status_reply(&mut status, "B:abc/60 D:1/2 F:x E1:200/210 T:soon");
        assert_eq!(evidence, None);
        assert_eq!(status.bed, None);
        assert_eq!(status.fan, None);
        assert_eq!(status.extruder1.map(|t| t.current), Some(200.0));
    }

    #[test]
    fn progress_token_drives_transitions() {
        let (poller, _sent) = poller(vec!["ok D:50/100/0", "ok D:0/100/1"]);
        let events = poller.subscribe();

        poller.poll_once().unwrap();
        assert!(poller.status().is_printing);
        poller.poll_once().unwrap();
        assert!(!poller.status().is_printing);

        assert_eq!(
            transitions(&events),
            vec![
                StatusEvent::PrintStarted {
                    file: "/sd/cube.gcode".into()
                },
                StatusEvent::PrintFinished,
            ]
        );
    }

    #[test]
    fn malformed_intermediate_reply_does_not_toggle() {
        let (poller, _sent) = poller(vec![
            "ok D:50/100/0",
            "ok D:garbage B:60/60",
            "ok D:x/y/z",
            "ok D:0/100/1",
        ]);
        let events = poller.subscribe();
        for _ in 0..4 {
            poller.poll_once().unwrap();
        }
        assert_eq!(transitions(&events).len(), 2);
    }

    #[test]
    fn elapsed_time_wins_over_progress() {
        let mut status = PrinterStatus::default();
        assert_eq!(
            apply_status_reply(&mut status, "D:0/100/1 T:5"),
            Some(PrintEvidence::Printing)
        );
        assert_eq!(
            apply_status_reply(&mut status, "D:50/100/0 T:0"),
            Some(PrintEvidence::Idle)
        );
    }

    #[test]
    fn start_fetches_active_file() {
        let (poller, sent) = poller(vec!["ok T:12", "ok T:13"]);
        poller.poll_once().unwrap();
        poller.poll_once().unwrap();

        assert_eq!(poller.status().active_file, "/sd/cube.gcode");
        let fetches = sent_text(&sent).iter().filter(|c| *c == "M4006").count();
        assert_eq!(fetches, 1);
    }

    #[test]
    fn repeated_failures_disconnect() {
        let (poller, _sent) = poller(vec!["", "", "", ""]);
        let events = poller.subscribe();

        for _ in 0..2 {
            assert!(matches!(poller.poll_once(), Err(ChituLinkError::Timeout)));
        }
        assert!(poller.session.is_connected());
        assert!(matches!(poller.poll_once(), Err(ChituLinkError::Timeout)));
        assert!(!poller.session.is_connected());
        assert_eq!(poller.fail_count(), 3);
        assert_eq!(transitions(&events), vec![StatusEvent::ConnectionLost]);
    }

    #[test]
    fn success_resets_fail_count() {
        let (poller, _sent) = poller(vec!["", "", "ok T:0", "", ""]);
        for _ in 0..5 {
            let _ = poller.poll_once();
        }
        assert!(poller.session.is_connected());
        assert_eq!(poller.fail_count(), 2);
    }

    #[test]
    fn busy_lock_is_not_a_failure() {
        let (poller, sent) = poller(vec!["ok T:0"]);
        let session = Arc::clone(&poller.session);
        let _held = session.lock(Duration::from_secs(1)).unwrap();

        assert!(matches!(poller.poll_once(), Err(ChituLinkError::Busy)));
        assert_eq!(poller.fail_count(), 0);
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn disconnected_poll_reconnects() {
        let (poller, sent) = poller(vec!["ok T:0"]);
        poller.session.mark_disconnected();

        let status = poller.poll_once().unwrap();

        assert!(poller.session.is_connected());
        assert!(!status.is_printing);
        assert_eq!(sent.lock().first().map(Vec::as_slice), Some(&b"M4001"[..]));
    }

    #[test]
    fn reconnect_waits_no_longer_than_a_poll() {
        let (poller, sent) = poller(vec!["ok T:0"]);
        let session = Arc::clone(&poller.session);
        session.mark_disconnected();
        let _held = session.lock(Duration::from_secs(1)).unwrap();

        let started = Instant::now();
        assert!(matches!(poller.poll_once(), Err(ChituLinkError::Busy)));

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(poller.fail_count(), 0);
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn remaining_time_from_average() {
        let (poller, _sent) = poller(vec!["ok D:25/100/0 T:600"]);
        poller.poll_once().unwrap();
        // One sample only: whole-print average, 600 s for 25 %.
        assert_eq!(poller.remaining_seconds(), Some(1800));
    }

    #[test]
    fn spawned_poller_publishes_and_stops() {
        let (poller, _sent) = poller(vec!["ok T:0"; 100]);
        let poller = Arc::new(poller);
        let events = poller.subscribe();

        let handle = Arc::clone(&poller).spawn(Duration::from_millis(5)).unwrap();
        let first = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, StatusEvent::Updated(_)));
        handle.stop();
    }
}
