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

use std::sync::Arc;

use strum_macros::{Display, EnumString, FromRepr};

/// Terminal result of a download job.
///
/// Every job ends in exactly one of these codes, delivered once through the
/// result callback and through the handle returned by
/// [`crate::Downloader::start`]. The numeric code is stable and the textual
/// name round-trips through [`DownloadResult::from_code`] and `Display`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum DownloadResult {
    Successed = 0,
    UnknownError,
    InvalidUrl,
    InvalidIndexFormat,
    InvalidTargetFilePath,
    InvalidThreadNum,
    InvalidNetworkConnTimeout,
    InvalidNetworkReadTimeout,
    InvalidFetchFileInfoRetryTimes,
    AlreadyDownloading,
    Canceled,
    RenameTmpFileFailed,
    OpenIndexFileFailed,
    TmpFileExpired,
    CreateTargetFileFailed,
    CreateTmpFileFailed,
    OpenTmpFileFailed,
    UrlDifferent,
    TmpFileSizeError,
    TmpFileCannotRw,
    FlushTmpFileFailed,
    UpdateIndexFileFailed,
    SliceDownloadFailed,
}

impl DownloadResult {
    /// Stable numeric code of this result.
    #[must_use]
    pub const fn as_code(self) -> i32 { self as i32 }

    /// Recover a result from its numeric code.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> { Self::from_repr(code) }

    /// Textual name of the code, e.g. `SUCCESSED`.
    #[must_use]
    pub fn name(self) -> String { self.to_string() }

    #[must_use]
    pub const fn is_success(self) -> bool { matches!(self, Self::Successed) }
}

/// Invoked exactly once with the terminal result of a job.
pub type ResultCallback = Arc<dyn Fn(DownloadResult) + Send + Sync>;

/// Invoked roughly every 200 ms with `(total, downloaded)` byte counts.
/// `total` is `-1` while the resource size is unknown.
pub type ProgressCallback = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// Invoked roughly once per second with the smoothed transfer rate in
/// bytes per second.
pub type SpeedCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// Diagnostic channel; may be invoked from any task.
pub type VerboseCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-transfer state of a slice.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum SliceStatus {
    /// Not yet assigned to a transfer.
    Idle,
    /// A transfer is currently appending into this slice.
    Active,
    /// All bytes of the range are captured.
    Done,
    /// The per-slice retry budget is exhausted.
    Failed,
}

/// Run an embedder callback, keeping its panics out of the state machine.
pub(crate) fn shielded_call<F: FnOnce()>(f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::warn!("download callback panicked; the panic was discarded");
    }
}

/// Emit a diagnostic line to tracing and the verbose callback when present.
pub(crate) fn emit_verbose(cb: Option<&VerboseCallback>, message: &str) {
    tracing::debug!("{message}");
    if let Some(cb) = cb {
        shielded_call(|| cb(message));
    }
}
