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

use std::{fmt, sync::Arc, time::Duration};

use bon::Builder;
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{
    error::{
        DownloadError, InvalidConnTimeoutSnafu, InvalidFetchInfoRetrySnafu, InvalidThreadNumSnafu,
    },
    event::StopEvent,
    types::VerboseCallback,
};

/// Upper bound on concurrent range transfers.
pub const MAX_THREAD_NUM: u32 = 100;

/// Default number of concurrent range transfers.
pub const DEFAULT_THREAD_NUM: u32 = 1;

/// Default connection-phase timeout.
pub const DEFAULT_CONN_TIMEOUT_MS: u32 = 3000;

/// Default number of fetch-file-info attempts.
pub const DEFAULT_FETCH_INFO_RETRIES: u32 = 1;

/// Default high-water mark for buffered bytes across all slices (20 MiB).
pub const DEFAULT_DISK_CACHE_BYTES: u64 = 20 * 1024 * 1024;

/// Attempts granted to each slice transfer before the job fails with
/// `SLICE_DOWNLOAD_FAILED`.
pub const SLICE_RETRY_BUDGET: usize = 3;

/// Options of a download job.
///
/// Immutable while a job is active; the [`crate::Downloader`] setters refuse
/// mutation with `ALREADY_DOWNLOADING`. Embedders that construct options
/// directly can use the builder and [`DownloadConfig::validate`].
#[derive(Clone, SmartDefault, Builder)]
pub struct DownloadConfig {
    /// Concurrent range transfers, within `[1, 100]`.
    #[default = 1]
    pub thread_num: u32,

    /// Maximum time the connection phase to the server may take, in
    /// milliseconds. Transfers themselves are unbounded.
    #[default = 3000]
    pub conn_timeout_ms: u32,

    /// Attempts when requesting file information, at least 1.
    #[default = 1]
    pub fetch_info_retries: u32,

    /// Discard the temporary file when the sidecar is older than this many
    /// seconds. Negative means never.
    #[default(-1)]
    pub tmp_expire_secs: i64,

    /// Aggregate transfer ceiling in bytes per second. Non-positive means
    /// unlimited.
    #[default(-1)]
    pub max_speed_bps: i64,

    /// High-water mark for buffered bytes across all slices. Zero flushes
    /// every append immediately.
    #[default(DEFAULT_DISK_CACHE_BYTES)]
    pub disk_cache_bytes: u64,

    /// Skip comparing the caller URL against the sidecar URL; with an empty
    /// caller URL the sidecar URL is adopted.
    #[default = false]
    pub skipping_url_check: bool,

    /// Caller-owned stop signal observed cooperatively during the job.
    pub stop_event: Option<Arc<StopEvent>>,

    /// Diagnostic output channel.
    pub verbose: Option<VerboseCallback>,
}

impl DownloadConfig {
    /// Check every option bound; the first violation wins.
    pub fn validate(&self) -> Result<(), DownloadError> {
        ensure!(
            (1..=MAX_THREAD_NUM).contains(&self.thread_num),
            InvalidThreadNumSnafu { value: self.thread_num }
        );
        ensure!(
            self.conn_timeout_ms > 0,
            InvalidConnTimeoutSnafu { value: self.conn_timeout_ms }
        );
        ensure!(
            self.fetch_info_retries >= 1,
            InvalidFetchInfoRetrySnafu { value: self.fetch_info_retries }
        );
        Ok(())
    }

    #[must_use]
    pub fn conn_timeout(&self) -> Duration { Duration::from_millis(u64::from(self.conn_timeout_ms)) }
}

impl fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("thread_num", &self.thread_num)
            .field("conn_timeout_ms", &self.conn_timeout_ms)
            .field("fetch_info_retries", &self.fetch_info_retries)
            .field("tmp_expire_secs", &self.tmp_expire_secs)
            .field("max_speed_bps", &self.max_speed_bps)
            .field("disk_cache_bytes", &self.disk_cache_bytes)
            .field("skipping_url_check", &self.skipping_url_check)
            .field("stop_event", &self.stop_event.is_some())
            .field("verbose", &self.verbose.is_some())
            .finish()
    }
}
