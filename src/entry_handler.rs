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

//! The per-job state machine:
//!
//! ```text
//! FETCH_INFO -> PLAN -> TRANSFER -> FINALIZE
//! ```
//!
//! `FETCH_INFO` discovers the resource, `PLAN` reconciles the sidecar and
//! opens the body file, `TRANSFER` drives one task per pending slice while a
//! ticker reports progress and speed, and `FINALIZE` renames the body onto
//! the target. Cancellation is cooperative at every stage; the caller's stop
//! signal is bridged onto the job's cancellation token.

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::StreamExt;
use reqwest::header;
use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DownloadConfig, SLICE_RETRY_BUDGET},
    error::{
        CanceledSnafu, DownloadError, HttpStatusSnafu, InvalidUrlSnafu, NetworkSnafu,
        RangeIgnoredSnafu, SliceDownloadSnafu, TruncatedSliceSnafu,
    },
    file_info::FileInfoFetcher,
    index_file::IndexRecord,
    slice::Slice,
    slice_manager::{SliceManager, index_path_for},
    speed_limiter::SpeedLimiter,
    types::{
        DownloadResult, ProgressCallback, SliceStatus, SpeedCallback, VerboseCallback,
        emit_verbose, shielded_call,
    },
};

/// Cadence of the progress callback.
const PROGRESS_TICK: Duration = Duration::from_millis(200);

/// Cadence of the speed callback.
const SPEED_TICK: Duration = Duration::from_millis(1000);

/// Poll interval for the caller-owned stop event.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Granularity at which network chunks are appended and charged, so the
/// governor can pace even servers that deliver very large chunks.
const APPEND_GRANULARITY: usize = 64 * 1024;

/// Shared context of one TRANSFER phase.
struct TransferCtx {
    client:     reqwest::Client,
    url:        String,
    manager:    Arc<SliceManager>,
    limiter:    Arc<SpeedLimiter>,
    /// Cancelled by user stop or by the first fatal slice failure.
    abort:      CancellationToken,
    multi:      bool,
    verbose:    Option<VerboseCallback>,
}

pub(crate) struct EntryHandler {
    config:      DownloadConfig,
    url:         String,
    target:      PathBuf,
    client:      reqwest::Client,
    /// User-initiated cancellation only (`stop()` or the stop event).
    stop:        CancellationToken,
    /// Child of `stop`, additionally cancelled on fatal errors to wind the
    /// job down promptly.
    abort:       CancellationToken,
    limiter:     Arc<SpeedLimiter>,
    progress_cb: Option<ProgressCallback>,
    speed_cb:    Option<SpeedCallback>,
}

impl EntryHandler {
    pub(crate) fn new(
        config: DownloadConfig,
        url: String,
        target: PathBuf,
        client: reqwest::Client,
        stop: CancellationToken,
        progress_cb: Option<ProgressCallback>,
        speed_cb: Option<SpeedCallback>,
    ) -> Self {
        let abort = stop.child_token();
        let limiter = Arc::new(SpeedLimiter::new(config.max_speed_bps));
        Self { config, url, target, client, stop, abort, limiter, progress_cb, speed_cb }
    }

    /// Drive the job to its terminal result. Runs on a dedicated task.
    pub(crate) async fn run(self) -> DownloadResult {
        let bridge = self.spawn_stop_bridge();

        let outcome = self.drive().await;

        self.abort.cancel();
        if let Some(bridge) = bridge {
            let _ = bridge.await;
        }

        match outcome {
            Ok(()) => DownloadResult::Successed,
            Err(_) if self.stop_requested() => DownloadResult::Canceled,
            Err(DownloadError::Canceled) => DownloadResult::Canceled,
            Err(err) => {
                emit_verbose(
                    self.config.verbose.as_ref(),
                    &format!("download failed: {err}"),
                );
                err.code()
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
            || self.config.stop_event.as_ref().is_some_and(|event| event.is_set())
    }

    async fn drive(&self) -> Result<(), DownloadError> {
        let url = self.resolve_url().await?;

        emit_verbose(self.config.verbose.as_ref(), &format!("fetching file info: {url}"));
        let fetcher = FileInfoFetcher::new(self.client.clone(), self.config.fetch_info_retries);
        let info = tokio::select! {
            () = self.abort.cancelled() => return CanceledSnafu.fail(),
            info = fetcher.fetch(&url) => info?,
        };
        emit_verbose(
            self.config.verbose.as_ref(),
            &format!(
                "file info: size={:?} accepts_ranges={} etag={:?}",
                info.total_size, info.accepts_ranges, info.etag
            ),
        );

        let manager = Arc::new(
            SliceManager::create(&self.target, &self.config, url.clone(), &info).await?,
        );

        if manager.is_complete() {
            return manager.finalize().await;
        }

        // Record the plan before any byte moves so a killed process can
        // resume from it.
        manager.persist().await?;

        self.transfer(&url, Arc::clone(&manager)).await?;
        manager.finalize().await?;

        self.report_progress(&manager);
        Ok(())
    }

    /// An empty caller URL is only usable when the sidecar supplies one and
    /// URL checking is being skipped.
    async fn resolve_url(&self) -> Result<String, DownloadError> {
        if !self.url.is_empty() {
            return Ok(self.url.clone());
        }
        if self.config.skipping_url_check {
            if let Ok(bytes) = tokio::fs::read(index_path_for(&self.target)).await {
                let record = IndexRecord::decode(&bytes)?;
                if !record.url.is_empty() {
                    emit_verbose(
                        self.config.verbose.as_ref(),
                        &format!("adopted url from index: {}", record.url),
                    );
                    return Ok(record.url);
                }
            }
        }
        InvalidUrlSnafu { url: self.url.clone() }.fail()
    }

    async fn transfer(
        &self,
        url: &str,
        manager: Arc<SliceManager>,
    ) -> Result<(), DownloadError> {
        let pending = manager.pending_slices();
        let ctx = Arc::new(TransferCtx {
            client:  self.client.clone(),
            url:     url.to_string(),
            manager: Arc::clone(&manager),
            limiter: Arc::clone(&self.limiter),
            abort:   self.abort.clone(),
            multi:   manager.slices().len() > 1,
            verbose: self.config.verbose.clone(),
        });

        let ticker = self.spawn_ticker(Arc::clone(&manager));

        let mut workers: Vec<JoinHandle<Result<(), DownloadError>>> = Vec::new();
        for slice in pending {
            slice.set_status(SliceStatus::Active);
            let ctx = Arc::clone(&ctx);
            workers.push(tokio::spawn(slice_worker(ctx, slice)));
        }

        let mut failure: Option<DownloadError> = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(DownloadError::Canceled)) => {}
                Ok(Err(err)) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
                Err(join_err) => {
                    if failure.is_none() {
                        failure = Some(DownloadError::Unknown {
                            message: format!("slice task aborted: {join_err}"),
                        });
                    }
                }
            }
        }

        ticker.abort();
        let _ = ticker.await;

        if let Some(err) = failure {
            // Keep whatever arrived; the next start resumes from it.
            let _ = manager.flush_all().await;
            let _ = manager.persist().await;
            return Err(err);
        }
        if self.stop_requested() || self.abort.is_cancelled() {
            let _ = manager.flush_all().await;
            let _ = manager.persist().await;
            return CanceledSnafu.fail();
        }
        Ok(())
    }

    /// Reports progress every 200 ms and the smoothed rate every second
    /// until the job winds down.
    fn spawn_ticker(&self, manager: Arc<SliceManager>) -> JoinHandle<()> {
        let abort = self.abort.clone();
        let limiter = Arc::clone(&self.limiter);
        let progress_cb = self.progress_cb.clone();
        let speed_cb = self.speed_cb.clone();
        let total = manager.total_size();

        tokio::spawn(async move {
            let mut progress_tick = tokio::time::interval(PROGRESS_TICK);
            let mut speed_tick = tokio::time::interval(SPEED_TICK);
            loop {
                tokio::select! {
                    () = abort.cancelled() => break,
                    _ = progress_tick.tick() => {
                        if let Some(cb) = &progress_cb {
                            let downloaded = manager.total_captured() as i64;
                            let total = total.map_or(-1, |t| t as i64);
                            shielded_call(|| cb(total, downloaded));
                        }
                    }
                    _ = speed_tick.tick() => {
                        if let Some(cb) = &speed_cb {
                            let rate = limiter.rate() as i64;
                            shielded_call(|| cb(rate));
                        }
                    }
                }
            }
        })
    }

    /// Watches the caller-owned stop event and folds it into the stop token.
    fn spawn_stop_bridge(&self) -> Option<JoinHandle<()>> {
        let event = self.config.stop_event.clone()?;
        let stop = self.stop.clone();
        let abort = self.abort.clone();
        Some(tokio::spawn(async move {
            loop {
                if event.is_set() {
                    stop.cancel();
                    break;
                }
                tokio::select! {
                    () = abort.cancelled() => break,
                    () = tokio::time::sleep(STOP_POLL) => {}
                }
            }
        }))
    }

    fn report_progress(&self, manager: &SliceManager) {
        if let Some(cb) = &self.progress_cb {
            let total = manager.total_size().map_or(-1, |t| t as i64);
            let downloaded = manager.total_captured() as i64;
            shielded_call(|| cb(total, downloaded));
        }
    }
}

/// Downloads one slice, retrying transport failures within the budget.
async fn slice_worker(ctx: Arc<TransferCtx>, slice: Arc<Slice>) -> Result<(), DownloadError> {
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        if ctx.abort.is_cancelled() {
            return CanceledSnafu.fail();
        }

        match run_transfer(&ctx, &slice).await {
            Ok(()) => {
                if let Err(err) = ctx.manager.flush_slice(&slice).await {
                    ctx.abort.cancel();
                    return Err(err);
                }
                return Ok(());
            }
            Err(DownloadError::Canceled) => return CanceledSnafu.fail(),
            Err(err) if err.is_transfer_retryable() && attempt < SLICE_RETRY_BUDGET => {
                emit_verbose(
                    ctx.verbose.as_ref(),
                    &format!(
                        "slice {} attempt {attempt}/{SLICE_RETRY_BUDGET} failed: {err}",
                        slice.index()
                    ),
                );
                slice.discard_buffer(ctx.manager.cache()).await;
                let backoff = Duration::from_millis(500 * attempt as u64);
                tokio::select! {
                    () = ctx.abort.cancelled() => return CanceledSnafu.fail(),
                    () = tokio::time::sleep(backoff) => {}
                }
            }
            Err(err) if err.is_transfer_retryable() => {
                slice.set_status(SliceStatus::Failed);
                ctx.abort.cancel();
                return SliceDownloadSnafu {
                    index:    slice.index(),
                    attempts: attempt,
                    message:  err.to_string(),
                }
                .fail();
            }
            Err(err) => {
                // Filesystem/index failures abort the whole job.
                ctx.abort.cancel();
                return Err(err);
            }
        }
    }
}

/// One transfer attempt for a slice: issue the ranged GET, stream the body
/// into the slice buffer, charge the governor, honor the watermark.
async fn run_transfer(ctx: &TransferCtx, slice: &Slice) -> Result<(), DownloadError> {
    if slice.remaining() == Some(0) {
        return Ok(());
    }

    let offset = slice.next_offset();
    let range = slice.range_header();
    let mut request = ctx.client.get(&ctx.url);
    if let Some(range) = &range {
        request = request.header(header::RANGE, range.clone());
    }

    let response = tokio::select! {
        () = ctx.abort.cancelled() => return CanceledSnafu.fail(),
        response = request.send() => response.context(NetworkSnafu)?,
    };

    let status = response.status();
    if range.is_some() {
        if status != reqwest::StatusCode::PARTIAL_CONTENT {
            if !status.is_success() {
                return HttpStatusSnafu { status: status.as_u16() }.fail();
            }
            // A 2xx full-body reply to a range request is only usable when
            // the request happened to cover the whole resource from zero.
            let covers_whole = offset == 0
                && slice.begin() == 0
                && match (slice.end(), ctx.manager.total_size()) {
                    (Some(end), Some(total)) => end + 1 == total,
                    (None, _) => true,
                    _ => false,
                };
            if !covers_whole || ctx.multi {
                return RangeIgnoredSnafu.fail();
            }
        }
    } else if !status.is_success() {
        return HttpStatusSnafu { status: status.as_u16() }.fail();
    }

    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            () = ctx.abort.cancelled() => return CanceledSnafu.fail(),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.context(NetworkSnafu)?;
        if chunk.is_empty() {
            continue;
        }

        // Never let a chatty server push a slice past its range.
        let take = match slice.remaining() {
            Some(remaining) => (chunk.len() as u64).min(remaining) as usize,
            None => chunk.len(),
        };
        if take == 0 {
            break;
        }

        let mut filled = false;
        for piece in chunk[..take].chunks(APPEND_GRANULARITY) {
            slice.append(ctx.manager.cache(), piece).await;
            tokio::select! {
                () = ctx.abort.cancelled() => return CanceledSnafu.fail(),
                () = ctx.limiter.consume(piece.len() as u64) => {}
            }
            ctx.manager.enforce_cache_watermark().await?;
            if slice.remaining() == Some(0) {
                filled = true;
                break;
            }
        }
        if filled {
            break;
        }
    }

    match slice.remaining() {
        Some(0) => Ok(()),
        Some(missing) => {
            let expected = slice.len().unwrap_or_default();
            TruncatedSliceSnafu { expected, got: expected - missing }.fail()
        }
        None => {
            // Open-ended slice: a clean end of stream is completion.
            slice.set_status(SliceStatus::Done);
            Ok(())
        }
    }
}
