// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use once_cell::sync::Lazy;
use snafu::ensure;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DEFAULT_CONN_TIMEOUT_MS, DownloadConfig, MAX_THREAD_NUM},
    entry_handler::EntryHandler,
    error::{
        AlreadyDownloadingSnafu, DownloadError, InvalidConnTimeoutSnafu,
        InvalidFetchInfoRetrySnafu, InvalidThreadNumSnafu,
    },
    event::StopEvent,
    types::{
        DownloadResult, ProgressCallback, ResultCallback, SpeedCallback, VerboseCallback,
        shielded_call,
    },
};

/// Process-wide prototype HTTP client, built once by [`global_init`] so TLS
/// bring-up happens before the first download.
static PROTOTYPE_CLIENT: Lazy<Mutex<Option<reqwest::Client>>> = Lazy::new(|| Mutex::new(None));

/// Bring up the shared HTTP client once per process. Idempotent; optional
/// but saves the first job the client construction cost.
pub fn global_init() {
    let mut prototype = PROTOTYPE_CLIENT.lock().expect("prototype client lock poisoned");
    if prototype.is_none() {
        *prototype = Some(build_raw_client(DEFAULT_CONN_TIMEOUT_MS));
    }
}

/// Drop the shared HTTP client.
pub fn global_uninit() {
    PROTOTYPE_CLIENT
        .lock()
        .expect("prototype client lock poisoned")
        .take();
}

fn build_raw_client(conn_timeout_ms: u32) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_millis(u64::from(conn_timeout_ms)))
        .build()
        .expect("failed to build HTTP client")
}

fn build_client(config: &DownloadConfig) -> reqwest::Client {
    if config.conn_timeout_ms == DEFAULT_CONN_TIMEOUT_MS {
        let prototype = PROTOTYPE_CLIENT.lock().expect("prototype client lock poisoned");
        if let Some(client) = prototype.as_ref() {
            return client.clone();
        }
    }
    build_raw_client(config.conn_timeout_ms)
}

/// Mutable shared view of the running job.
#[derive(Debug, Default)]
struct ActiveJob {
    downloading: AtomicBool,
    stop:        Mutex<Option<CancellationToken>>,
    url:         Mutex<String>,
    target:      Mutex<PathBuf>,
}

/// A download job: configure through the setters, launch with
/// [`Downloader::start`], cancel with [`Downloader::stop`].
///
/// Options are immutable while a job is active; every setter then returns
/// the `ALREADY_DOWNLOADING` error. A finished job can be started again and
/// behaves like a fresh one against the same sidecar.
#[derive(Debug, Default)]
pub struct Downloader {
    config: DownloadConfig,
    active: Arc<ActiveJob>,
}

/// Resolves to the terminal [`DownloadResult`] of a started job.
pub struct DownloadHandle {
    inner: HandleInner,
}

enum HandleInner {
    Ready(DownloadResult),
    Pending(oneshot::Receiver<DownloadResult>),
}

impl DownloadHandle {
    fn ready(result: DownloadResult) -> Self { Self { inner: HandleInner::Ready(result) } }

    fn pending(rx: oneshot::Receiver<DownloadResult>) -> Self {
        Self { inner: HandleInner::Pending(rx) }
    }

    /// Wait for the job to reach its terminal result.
    pub async fn wait(self) -> DownloadResult {
        match self.inner {
            HandleInner::Ready(result) => result,
            HandleInner::Pending(rx) => rx.await.unwrap_or(DownloadResult::UnknownError),
        }
    }
}

impl Downloader {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn guard_idle(&self) -> Result<(), DownloadError> {
        ensure!(
            !self.active.downloading.load(Ordering::Acquire),
            AlreadyDownloadingSnafu
        );
        Ok(())
    }

    /// Concurrent range transfers, `[1, 100]`.
    pub fn set_thread_num(&mut self, value: u32) -> Result<(), DownloadError> {
        self.guard_idle()?;
        ensure!(
            (1..=MAX_THREAD_NUM).contains(&value),
            InvalidThreadNumSnafu { value }
        );
        self.config.thread_num = value;
        Ok(())
    }

    #[must_use]
    pub fn thread_num(&self) -> u32 { self.config.thread_num }

    /// Connection-phase timeout in milliseconds; must be positive.
    pub fn set_network_conn_timeout(&mut self, value: u32) -> Result<(), DownloadError> {
        self.guard_idle()?;
        ensure!(value > 0, InvalidConnTimeoutSnafu { value });
        self.config.conn_timeout_ms = value;
        Ok(())
    }

    #[must_use]
    pub fn network_conn_timeout(&self) -> u32 { self.config.conn_timeout_ms }

    /// Attempts when requesting file information; at least 1.
    pub fn set_fetch_file_info_retry_times(&mut self, value: u32) -> Result<(), DownloadError> {
        self.guard_idle()?;
        ensure!(value >= 1, InvalidFetchInfoRetrySnafu { value });
        self.config.fetch_info_retries = value;
        Ok(())
    }

    #[must_use]
    pub fn fetch_file_info_retry_times(&self) -> u32 { self.config.fetch_info_retries }

    /// Seconds after which an untouched sidecar expires; negative means
    /// never.
    pub fn set_tmp_file_expired_time(&mut self, value: i64) -> Result<(), DownloadError> {
        self.guard_idle()?;
        self.config.tmp_expire_secs = value;
        Ok(())
    }

    #[must_use]
    pub fn tmp_file_expired_time(&self) -> i64 { self.config.tmp_expire_secs }

    /// Aggregate speed cap in bytes per second; non-positive means
    /// unlimited.
    pub fn set_max_download_speed(&mut self, value: i64) -> Result<(), DownloadError> {
        self.guard_idle()?;
        self.config.max_speed_bps = value;
        Ok(())
    }

    #[must_use]
    pub fn max_download_speed(&self) -> i64 { self.config.max_speed_bps }

    /// High-water mark for buffered bytes; zero disables buffering.
    pub fn set_disk_cache_size(&mut self, value: u64) -> Result<(), DownloadError> {
        self.guard_idle()?;
        self.config.disk_cache_bytes = value;
        Ok(())
    }

    #[must_use]
    pub fn disk_cache_size(&self) -> u64 { self.config.disk_cache_bytes }

    /// Skip the sidecar URL comparison; with an empty caller URL the sidecar
    /// URL is adopted.
    pub fn set_skipping_url_check(&mut self, value: bool) -> Result<(), DownloadError> {
        self.guard_idle()?;
        self.config.skipping_url_check = value;
        Ok(())
    }

    #[must_use]
    pub fn skipping_url_check(&self) -> bool { self.config.skipping_url_check }

    /// Install a caller-owned stop signal shared with other code.
    pub fn set_stop_event(&mut self, event: Arc<StopEvent>) -> Result<(), DownloadError> {
        self.guard_idle()?;
        self.config.stop_event = Some(event);
        Ok(())
    }

    #[must_use]
    pub fn stop_event(&self) -> Option<Arc<StopEvent>> { self.config.stop_event.clone() }

    /// Install the diagnostic output channel.
    pub fn set_verbose_output(&mut self, verbose: VerboseCallback) -> Result<(), DownloadError> {
        self.guard_idle()?;
        self.config.verbose = Some(verbose);
        Ok(())
    }

    /// URL of the most recently started job.
    #[must_use]
    pub fn url(&self) -> String {
        self.active.url.lock().expect("job state lock poisoned").clone()
    }

    /// Target path of the most recently started job.
    #[must_use]
    pub fn target_file_path(&self) -> PathBuf {
        self.active.target.lock().expect("job state lock poisoned").clone()
    }

    /// Launch the state machine. Must be called within a tokio runtime.
    ///
    /// Configuration problems resolve the returned handle immediately; the
    /// result callback is still invoked exactly once either way.
    pub fn start(
        &mut self,
        url: impl Into<String>,
        target_file_path: impl Into<PathBuf>,
        result_cb: Option<ResultCallback>,
        progress_cb: Option<ProgressCallback>,
        speed_cb: Option<SpeedCallback>,
    ) -> DownloadHandle {
        let url = url.into();
        let target = target_file_path.into();

        if let Err(err) = self.precheck(&url, &target) {
            let code = err.code();
            if let Some(cb) = &result_cb {
                let cb = Arc::clone(cb);
                shielded_call(|| cb(code));
            }
            return DownloadHandle::ready(code);
        }

        let stop = CancellationToken::new();
        self.active.downloading.store(true, Ordering::Release);
        *self.active.stop.lock().expect("job state lock poisoned") = Some(stop.clone());
        *self.active.url.lock().expect("job state lock poisoned") = url.clone();
        *self.active.target.lock().expect("job state lock poisoned") = target.clone();

        let entry = EntryHandler::new(
            self.config.clone(),
            url,
            target,
            build_client(&self.config),
            stop,
            progress_cb,
            speed_cb,
        );

        let (tx, rx) = oneshot::channel();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let result = entry.run().await;
            active.downloading.store(false, Ordering::Release);
            if let Some(cb) = result_cb {
                shielded_call(|| cb(result));
            }
            let _ = tx.send(result);
        });

        DownloadHandle::pending(rx)
    }

    fn precheck(&self, url: &str, target: &PathBuf) -> Result<(), DownloadError> {
        self.guard_idle()?;
        if url.is_empty() && !self.config.skipping_url_check {
            return crate::error::InvalidUrlSnafu { url }.fail();
        }
        ensure!(
            !target.as_os_str().is_empty(),
            crate::error::InvalidTargetFilePathSnafu
        );
        self.config.validate()
    }

    /// Request cancellation of the active job; the job ends with `CANCELED`.
    /// A no-op when nothing is downloading; calling it twice is
    /// indistinguishable from calling it once.
    pub fn stop(&self) {
        let stop = self.active.stop.lock().expect("job state lock poisoned").clone();
        if let Some(token) = stop {
            token.cancel();
        }
    }
}

impl Drop for Downloader {
    fn drop(&mut self) { self.stop(); }
}
