//! Progress and message streaming from the commit worker to the client.
//!
//! The worker writes through a [`ProgressWriter`] or updates
//! [`ProgressTask`] counters; the protocol thread renders status lines
//! while it waits and flushes everything before the push response goes out.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::executor::WorkOutcome;

/// The protocol session of one push: sideband progress plus the
/// out-of-band error channel.
pub trait ProtocolSession: Send + Sync {
    fn send_message(&self, message: &str);
    fn send_error(&self, message: &str);
    fn send_progress(&self, bytes: &[u8]);
    fn flush(&self);
}

/// Narrow sink for client-facing text.
pub trait MessageSender: Send + Sync {
    fn send_message(&self, message: &str);
    fn send_error(&self, message: &str);
    fn send_bytes(&self, bytes: &[u8]);
    fn flush(&self);
}

/// Default sender when the caller supplies none: writes straight to the
/// protocol session.
pub struct SessionMessageSender {
    session: Arc<dyn ProtocolSession>,
}

impl SessionMessageSender {
    pub fn new(session: Arc<dyn ProtocolSession>) -> Self {
        Self { session }
    }
}

impl MessageSender for SessionMessageSender {
    fn send_message(&self, message: &str) {
        self.session.send_message(message);
    }

    fn send_error(&self, message: &str) {
        self.session.send_error(message);
    }

    fn send_bytes(&self, bytes: &[u8]) {
        self.session.send_progress(bytes);
    }

    fn flush(&self) {
        self.session.flush();
    }
}

struct ChannelState {
    sender: Arc<dyn MessageSender>,
    partial: Vec<u8>,
    queued: Vec<String>,
    sealed: bool,
    dropped_bytes: usize,
    /// Unterminated status line currently on the client's screen.
    status: Option<String>,
}

impl ChannelState {
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        if let Some(end) = self.partial.iter().rposition(|b| *b == b'\n' || *b == b'\r') {
            let complete: Vec<u8> = self.partial.drain(..=end).collect();
            self.send_output(&complete);
        }
    }

    /// Worker output starts on a fresh line when a status line is showing.
    fn send_output(&mut self, bytes: &[u8]) {
        if self.status.take().is_some() {
            self.sender.send_bytes(b"\n");
        }
        self.sender.send_bytes(bytes);
    }

    fn drain_partial(&mut self, terminate: bool) {
        if self.partial.is_empty() {
            return;
        }
        if terminate {
            self.partial.push(b'\n');
        }
        let rest = std::mem::take(&mut self.partial);
        self.send_output(&rest);
    }
}

/// Line-buffered, thread-safe path to the client.
///
/// All sends happen under one lock, so a writer and a flusher on different
/// threads never reorder bytes. After [`MessageChannel::seal`] every write
/// is dropped.
#[derive(Clone)]
pub struct MessageChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MessageChannel {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                sender,
                partial: Vec::new(),
                queued: Vec::new(),
                sealed: false,
                dropped_bytes: 0,
                status: None,
            })),
        }
    }

    pub fn writer(&self) -> ProgressWriter {
        ProgressWriter {
            channel: self.clone(),
        }
    }

    /// Forwards complete lines at once and keeps a trailing partial line
    /// until it is terminated or the channel is flushed.
    pub fn write(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        if state.sealed {
            state.dropped_bytes += bytes.len();
            debug!(bytes = bytes.len(), "dropping progress output after push response");
            return;
        }
        state.push_bytes(bytes);
    }

    /// Sends a status line unless a partial worker line is pending, in
    /// which case the update is skipped rather than splitting that line.
    /// A line identical to the one on screen is not sent again.
    pub fn write_status(&self, status: &str) -> bool {
        let mut state = self.state.lock();
        if state.sealed || !state.partial.is_empty() {
            return false;
        }
        if state.status.as_deref() == Some(status) {
            return false;
        }
        state.sender.send_bytes(status.as_bytes());
        state.sender.flush();
        state.status = Some(status.to_string());
        true
    }

    fn write_final_status(&self, status: &str) {
        let mut state = self.state.lock();
        if state.sealed {
            return;
        }
        state.drain_partial(true);
        state.sender.send_bytes(status.as_bytes());
        state.status = None;
    }

    /// Queues a message for the end of the push (e.g. links to created
    /// changes).
    pub fn queue_message(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.sealed {
            debug!("dropping queued message after push response");
            return;
        }
        state.queued.push(message.into());
    }

    pub fn flush(&self) {
        let mut state = self.state.lock();
        if state.sealed {
            return;
        }
        state.drain_partial(false);
        state.sender.flush();
    }

    /// Flushes everything pending and closes the channel for good.
    pub fn seal(&self) {
        let mut state = self.state.lock();
        if state.sealed {
            return;
        }
        state.drain_partial(false);
        let queued = std::mem::take(&mut state.queued);
        for message in &queued {
            state.sender.send_message(message);
        }
        state.sender.flush();
        state.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    pub fn dropped_bytes(&self) -> usize {
        self.state.lock().dropped_bytes
    }
}

/// `io::Write` view of a [`MessageChannel`] handed to the worker.
#[derive(Clone)]
pub struct ProgressWriter {
    channel: MessageChannel,
}

impl io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial lines stay buffered; the monitor decides when they go out.
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("worker did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("worker failed: {0}")]
    Failed(String),
}

const SPINNER: [char; 4] = ['-', '\\', '|', '/'];

struct TaskState {
    name: String,
    total: Option<u64>,
    count: AtomicU64,
}

/// Counter for one sub-task of the monitor, e.g. "refs" or "new".
#[derive(Clone)]
pub struct ProgressTask {
    state: Arc<TaskState>,
    wake: Sender<()>,
}

impl ProgressTask {
    pub fn update(&self, completed: u64) {
        self.state.count.fetch_add(completed, Ordering::Relaxed);
        // A pending wake-up already covers this update.
        let _ = self.wake.try_send(());
    }

    pub fn count(&self) -> u64 {
        self.state.count.load(Ordering::Relaxed)
    }
}

struct MonitorInner {
    title: String,
    channel: MessageChannel,
    interval: Duration,
    tasks: Mutex<Vec<Arc<TaskState>>>,
    stage: Mutex<String>,
    spinner: AtomicUsize,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

#[derive(Clone)]
pub struct ProgressMonitor {
    inner: Arc<MonitorInner>,
}

impl ProgressMonitor {
    pub fn new(channel: MessageChannel, title: impl Into<String>, interval: Duration) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            inner: Arc::new(MonitorInner {
                title: title.into(),
                channel,
                interval: interval.max(Duration::from_millis(1)),
                tasks: Mutex::new(Vec::new()),
                stage: Mutex::new(String::new()),
                spinner: AtomicUsize::new(0),
                wake_tx,
                wake_rx,
            }),
        }
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.inner.channel
    }

    pub fn writer(&self) -> ProgressWriter {
        self.inner.channel.writer()
    }

    pub fn begin_sub_task(&self, name: impl Into<String>, total: Option<u64>) -> ProgressTask {
        let state = Arc::new(TaskState {
            name: name.into(),
            total,
            count: AtomicU64::new(0),
        });
        self.inner.tasks.lock().push(Arc::clone(&state));
        ProgressTask {
            state,
            wake: self.inner.wake_tx.clone(),
        }
    }

    /// Labels the stage in progress. Only used in log records.
    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        debug!(title = %self.inner.title, stage = %stage, "receive stage");
        *self.inner.stage.lock() = stage;
    }

    pub fn stage(&self) -> String {
        self.inner.stage.lock().clone()
    }

    /// Blocks until the worker reports on `completion` or `timeout`
    /// elapses, rendering a status line on every task update and at least
    /// once per interval. The worker is left running on timeout.
    pub fn wait_for(
        &self,
        completion: &Receiver<WorkOutcome>,
        timeout: Option<Duration>,
    ) -> Result<(), WaitError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut next_spin = started + self.inner.interval;

        loop {
            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    // Work that finished right at the deadline still counts.
                    return match completion.try_recv() {
                        Ok(outcome) => self.conclude(Ok(outcome)),
                        Err(TryRecvError::Empty) => {
                            self.send_final(", interrupted\n");
                            Err(WaitError::TimedOut(now.duration_since(started)))
                        }
                        Err(TryRecvError::Disconnected) => self.conclude(Err(())),
                    };
                }
            }

            let wake_at = deadline.map_or(next_spin, |d| d.min(next_spin));
            let wait = wake_at.saturating_duration_since(now);
            select! {
                recv(completion) -> outcome => return self.conclude(outcome.map_err(|_| ())),
                recv(self.inner.wake_rx) -> _ => {},
                default(wait) => {},
            }

            let now = Instant::now();
            if now >= next_spin {
                self.inner.spinner.fetch_add(1, Ordering::Relaxed);
                next_spin = now + self.inner.interval;
            }
            self.send_update();
        }
    }

    fn conclude(&self, outcome: Result<WorkOutcome, ()>) -> Result<(), WaitError> {
        match outcome {
            Ok(Ok(())) => {
                self.send_final(", done    \n");
                Ok(())
            }
            Ok(Err(message)) => {
                self.send_final(", interrupted\n");
                Err(WaitError::Failed(message))
            }
            Err(()) => {
                self.send_final(", interrupted\n");
                Err(WaitError::Failed(
                    "worker exited without reporting a result".to_string(),
                ))
            }
        }
    }

    /// Sends everything still buffered and closes the channel.
    pub fn finish(&self) {
        self.inner.channel.seal();
    }

    fn send_update(&self) {
        let spinner = SPINNER[self.inner.spinner.load(Ordering::Relaxed) % SPINNER.len()];
        let mut line = self.format();
        line.push(' ');
        line.push(spinner);
        self.inner.channel.write_status(&line);
    }

    fn send_final(&self, suffix: &str) {
        let mut line = self.format();
        if line.ends_with(':') {
            line.push(' ');
            line.push_str(suffix.trim_start_matches(", "));
        } else {
            line.push_str(suffix);
        }
        self.inner.channel.write_final_status(&line);
    }

    fn format(&self) -> String {
        let mut line = format!("\r{}:", self.inner.title);
        let tasks = self.inner.tasks.lock();
        let mut first = true;
        for task in tasks.iter() {
            let count = task.count.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if !first {
                line.push(',');
            }
            first = false;
            line.push(' ');
            if !task.name.is_empty() {
                line.push_str(&task.name);
                line.push_str(": ");
            }
            match task.total {
                Some(total) if total > 0 => {
                    let percent = count.saturating_mul(100) / total;
                    line.push_str(&format!("{percent}% ({count}/{total})"));
                }
                _ => line.push_str(&count.to_string()),
            }
        }
        line
    }
}
