use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::hardware::{uid_to_hex, TagReader};

use super::worker::{PendingStop, Worker};
use super::BoxFuture;
use crate::log_debug;

const ENABLE_LOGS: bool = true;

/// Pause between activation attempts that came back empty or failed.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);
/// Read window used by the always-on mode before each pause.
const CONTINUOUS_READ_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRead {
    pub uid: String,
    pub uid_len: usize,
    pub timestamp: DateTime<Utc>,
}

impl TagRead {
    pub fn from_uid(uid: &[u8]) -> Self {
        Self {
            uid: uid_to_hex(uid),
            uid_len: uid.len(),
            timestamp: Utc::now(),
        }
    }
}

pub type TagCallback = Arc<dyn Fn(TagRead) -> BoxFuture + Send + Sync>;

pub struct TagPoller {
    reader: Arc<dyn TagReader>,
    worker: Mutex<Option<Worker>>,
}

impl TagPoller {
    pub fn new(reader: Arc<dyn TagReader>) -> Self {
        Self {
            reader,
            worker: Mutex::new(None),
        }
    }

    /// Keeps asking the reader for a tag until one shows up or `window` passes.
    pub async fn read_once(&self, window: Duration) -> Option<TagRead> {
        read_once(self.reader.clone(), window).await
    }

    /// Polls in `poll_interval` windows until a tag is found or `scan_timeout`
    /// passes. The callback runs at most once, only on success.
    pub async fn read_until_found(
        &self,
        scan_timeout: Duration,
        poll_interval: Duration,
        callback: TagCallback,
    ) -> Option<TagRead> {
        let tag = find_tag(self.reader.clone(), scan_timeout, poll_interval).await?;
        callback(tag.clone()).await;
        Some(tag)
    }

    /// Runs `read_until_found` in the background. Returns false when a scan is
    /// already running.
    pub fn start_scan(
        &self,
        scan_timeout: Duration,
        poll_interval: Duration,
        callback: TagCallback,
    ) -> bool {
        let mut worker = lock_worker(&self.worker);
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            log_debug!("Tag scan already running");
            return false;
        }

        let reader = self.reader.clone();
        *worker = Some(Worker::spawn(move |cancel_token| {
            scan_once(reader, scan_timeout, poll_interval, callback, cancel_token)
        }));

        info!("Tag scan started (timeout {}ms)", scan_timeout.as_millis());
        true
    }

    /// Always-on mode: every tag seen is handed to the callback until stopped.
    pub fn start_continuous(&self, poll_interval: Duration, callback: TagCallback) -> bool {
        let mut worker = lock_worker(&self.worker);
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            log_debug!("Tag polling already running");
            return false;
        }

        let reader = self.reader.clone();
        *worker = Some(Worker::spawn(move |cancel_token| {
            continuous_loop(reader, poll_interval, callback, cancel_token)
        }));

        info!("Continuous tag polling started");
        true
    }

    pub fn is_running(&self) -> bool {
        lock_worker(&self.worker)
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Cancels any scan without waiting for it. Safe when nothing is running.
    pub fn begin_stop(&self) -> PendingStop {
        match lock_worker(&self.worker).take() {
            Some(worker) => worker.cancel(),
            None => PendingStop::none(),
        }
    }

    pub async fn stop(&self) {
        self.begin_stop().join().await;
    }
}

fn lock_worker(worker: &Mutex<Option<Worker>>) -> std::sync::MutexGuard<'_, Option<Worker>> {
    worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_once(reader: Arc<dyn TagReader>, window: Duration) -> Option<TagRead> {
    if window.is_zero() {
        return None;
    }

    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }

        let attempt = {
            let reader = reader.clone();
            tokio::task::spawn_blocking(move || reader.read_passive_target())
        };

        match timeout(remaining, attempt).await {
            Ok(Ok(Ok(Some(uid)))) => {
                let tag = TagRead::from_uid(&uid);
                log_debug!("Tag read: {} ({} bytes)", tag.uid, tag.uid_len);
                return Some(tag);
            }
            Ok(Ok(Ok(None))) => {}
            Ok(Ok(Err(err))) => log_debug!("Tag activation attempt failed: {err:#}"),
            Ok(Err(err)) => {
                warn!("Tag read task failed: {err}");
                return None;
            }
            Err(_) => return None,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(RETRY_BACKOFF.min(remaining)).await;
    }
}

async fn find_tag(
    reader: Arc<dyn TagReader>,
    scan_timeout: Duration,
    poll_interval: Duration,
) -> Option<TagRead> {
    if scan_timeout.is_zero() {
        return None;
    }

    let deadline = Instant::now() + scan_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            info!("No tag within {}ms", scan_timeout.as_millis());
            return None;
        }

        let window = if poll_interval.is_zero() {
            remaining
        } else {
            poll_interval.min(remaining)
        };

        if let Some(tag) = read_once(reader.clone(), window).await {
            info!("Tag found: {}", tag.uid);
            return Some(tag);
        }
    }
}

/// Background form of `read_until_found`. Only the search is cancellable;
/// a callback that has started runs to completion, since it may be the one
/// stopping this scan.
async fn scan_once(
    reader: Arc<dyn TagReader>,
    scan_timeout: Duration,
    poll_interval: Duration,
    callback: TagCallback,
    cancel_token: CancellationToken,
) {
    let found = tokio::select! {
        found = find_tag(reader, scan_timeout, poll_interval) => found,
        _ = cancel_token.cancelled() => {
            info!("Tag scan cancelled");
            return;
        }
    };

    if let Some(tag) = found {
        callback(tag).await;
    }
}

async fn continuous_loop(
    reader: Arc<dyn TagReader>,
    poll_interval: Duration,
    callback: TagCallback,
    cancel_token: CancellationToken,
) {
    loop {
        let found = tokio::select! {
            found = read_once(reader.clone(), CONTINUOUS_READ_WINDOW) => found,
            _ = cancel_token.cancelled() => break,
        };

        if let Some(tag) = found {
            callback(tag).await;
        }

        if cancel_token.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = cancel_token.cancelled() => break,
        }
    }

    info!("Continuous tag polling stopped");
}
