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

use std::path::PathBuf;

use snafu::Snafu;

use crate::types::DownloadResult;

/// Operational error of a download job.
///
/// Every variant maps to exactly one terminal [`DownloadResult`] code via
/// [`DownloadError::code`]; the variant itself keeps the underlying cause for
/// diagnostics.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DownloadError {
    #[snafu(display("invalid url: {url}"))]
    InvalidUrl { url: String },

    #[snafu(display("target file path is empty or not writable"))]
    InvalidTargetFilePath,

    #[snafu(display("thread number {value} is outside [1, 100]"))]
    InvalidThreadNum { value: u32 },

    #[snafu(display("network connection timeout {value} ms must be positive"))]
    InvalidConnTimeout { value: u32 },

    #[snafu(display("fetch-file-info retry times {value} must be at least 1"))]
    InvalidFetchInfoRetry { value: u32 },

    #[snafu(display("a download is already in progress"))]
    AlreadyDownloading,

    #[snafu(display("fetching file info from {url} failed: {source}"))]
    FetchFileInfo { url: String, source: reqwest::Error },

    #[snafu(display("index file is malformed: {reason}"))]
    InvalidIndexFormat { reason: String },

    #[snafu(display("opening index file {} failed: {source}", path.display()))]
    OpenIndexFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("temporary file expired: saved {age_secs} s ago, limit {limit_secs} s"))]
    TmpFileExpired { age_secs: i64, limit_secs: i64 },

    #[snafu(display("index url {stored} differs from requested url {requested}"))]
    UrlDifferent { stored: String, requested: String },

    #[snafu(display("index total size {stored} differs from resource size {actual}"))]
    TmpFileSizeError { stored: u64, actual: u64 },

    #[snafu(display("temporary file {} is not readable/writable: {source}", path.display()))]
    TmpFileCannotRw { path: PathBuf, source: std::io::Error },

    #[snafu(display("creating target file {} failed: {source}", path.display()))]
    CreateTargetFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("creating temporary file {} failed: {source}", path.display()))]
    CreateTmpFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("opening temporary file {} failed: {source}", path.display()))]
    OpenTmpFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("flushing slice buffer to temporary file failed: {source}"))]
    FlushTmpFile { source: std::io::Error },

    #[snafu(display("updating index file {} failed: {source}", path.display()))]
    UpdateIndexFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("renaming temporary file to {} failed: {source}", path.display()))]
    RenameTmpFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("slice {index} failed after {attempts} attempts: {message}"))]
    SliceDownload { index: u32, attempts: usize, message: String },

    // Per-attempt transfer failures. These are retried within the slice
    // budget and only escape wrapped in `SliceDownload`.
    #[snafu(display("network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("unexpected http status {status}"))]
    HttpStatus { status: u16 },

    #[snafu(display("server ignored the range request and replied with a full body"))]
    RangeIgnored,

    #[snafu(display("slice body truncated: expected {expected} bytes, got {got}"))]
    TruncatedSlice { expected: u64, got: u64 },

    #[snafu(display("download canceled"))]
    Canceled,

    #[snafu(display("unexpected failure: {message}"))]
    Unknown { message: String },
}

impl DownloadError {
    /// The terminal code this error surfaces as.
    #[must_use]
    pub fn code(&self) -> DownloadResult {
        match self {
            Self::InvalidUrl { .. } | Self::FetchFileInfo { .. } => DownloadResult::InvalidUrl,
            Self::InvalidTargetFilePath => DownloadResult::InvalidTargetFilePath,
            Self::InvalidThreadNum { .. } => DownloadResult::InvalidThreadNum,
            Self::InvalidConnTimeout { .. } => DownloadResult::InvalidNetworkConnTimeout,
            Self::InvalidFetchInfoRetry { .. } => DownloadResult::InvalidFetchFileInfoRetryTimes,
            Self::AlreadyDownloading => DownloadResult::AlreadyDownloading,
            Self::InvalidIndexFormat { .. } => DownloadResult::InvalidIndexFormat,
            Self::OpenIndexFile { .. } => DownloadResult::OpenIndexFileFailed,
            Self::TmpFileExpired { .. } => DownloadResult::TmpFileExpired,
            Self::UrlDifferent { .. } => DownloadResult::UrlDifferent,
            Self::TmpFileSizeError { .. } => DownloadResult::TmpFileSizeError,
            Self::TmpFileCannotRw { .. } => DownloadResult::TmpFileCannotRw,
            Self::CreateTargetFile { .. } => DownloadResult::CreateTargetFileFailed,
            Self::CreateTmpFile { .. } => DownloadResult::CreateTmpFileFailed,
            Self::OpenTmpFile { .. } => DownloadResult::OpenTmpFileFailed,
            Self::FlushTmpFile { .. } => DownloadResult::FlushTmpFileFailed,
            Self::UpdateIndexFile { .. } => DownloadResult::UpdateIndexFileFailed,
            Self::RenameTmpFile { .. } => DownloadResult::RenameTmpFileFailed,
            Self::SliceDownload { .. }
            | Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::RangeIgnored
            | Self::TruncatedSlice { .. } => DownloadResult::SliceDownloadFailed,
            Self::Canceled => DownloadResult::Canceled,
            Self::Unknown { .. } => DownloadResult::UnknownError,
        }
    }

    /// Whether a slice transfer hitting this error may be retried within the
    /// per-slice budget.
    #[must_use]
    pub(crate) fn is_transfer_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::HttpStatus { .. }
                | Self::RangeIgnored
                | Self::TruncatedSlice { .. }
        )
    }
}
