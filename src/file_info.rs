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

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::header;
use snafu::ResultExt;

use crate::error::{DownloadError, FetchFileInfoSnafu, InvalidUrlSnafu};

/// What the server told us about the resource.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// `None` when the server did not expose a size (chunked transfer).
    pub total_size:     Option<u64>,
    pub accepts_ranges: bool,
    pub etag:           Option<String>,
    pub last_modified:  Option<String>,
}

/// Discovers resource capabilities with a HEAD request, falling back to a
/// zero-length ranged GET for servers that reject HEAD.
pub(crate) struct FileInfoFetcher {
    client:  reqwest::Client,
    retries: u32,
}

impl FileInfoFetcher {
    pub(crate) const fn new(client: reqwest::Client, retries: u32) -> Self {
        Self { client, retries }
    }

    /// Fetch the resource descriptor, retrying transient failures up to the
    /// configured attempt count with a brief backoff.
    pub(crate) async fn fetch(&self, url: &str) -> Result<FileInfo, DownloadError> {
        if reqwest::Url::parse(url).is_err() {
            return InvalidUrlSnafu { url }.fail();
        }

        let backoff = ExponentialBuilder::default()
            .with_max_times(self.retries.saturating_sub(1) as usize)
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(4));

        (|| self.attempt(url))
            .retry(backoff)
            .when(|e| matches!(e, DownloadError::FetchFileInfo { .. }))
            .await
    }

    async fn attempt(&self, url: &str) -> Result<FileInfo, DownloadError> {
        let head = self
            .client
            .head(url)
            .send()
            .await
            .context(FetchFileInfoSnafu { url })?;

        if head.status().is_success() {
            let headers = head.headers();
            return Ok(FileInfo {
                total_size:     header_u64(headers, &header::CONTENT_LENGTH),
                accepts_ranges: accepts_ranges(headers),
                etag:           header_string(headers, &header::ETAG),
                last_modified:  header_string(headers, &header::LAST_MODIFIED),
            });
        }

        // Some servers refuse HEAD outright; probe with a one-byte ranged
        // GET instead.
        let probe = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await
            .context(FetchFileInfoSnafu { url })?
            .error_for_status()
            .context(FetchFileInfoSnafu { url })?;

        let ranged = probe.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let headers = probe.headers();
        let total_size = if ranged {
            header_string(headers, &header::CONTENT_RANGE)
                .as_deref()
                .and_then(content_range_total)
        } else {
            header_u64(headers, &header::CONTENT_LENGTH)
        };

        Ok(FileInfo {
            total_size,
            accepts_ranges: ranged || accepts_ranges(headers),
            etag: header_string(headers, &header::ETAG),
            last_modified: header_string(headers, &header::LAST_MODIFIED),
        })
    }
}

fn accepts_ranges(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("bytes"))
}

fn header_u64(headers: &header::HeaderMap, name: &header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn header_string(headers: &header::HeaderMap, name: &header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total size out of a `Content-Range: bytes 0-0/1234` header; `*` means the
/// server itself does not know.
fn content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}
