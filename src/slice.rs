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

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::{disk_cache::DiskCache, target_file::TargetFile, types::SliceStatus};

/// One contiguous byte range of the target and its transfer state.
///
/// Appends are serialized by the single transfer that owns the slice; the
/// flushed/buffered counters are atomics so the progress aggregator and the
/// persister can read them concurrently. The buffer itself is lockable from
/// other tasks because the watermark policy may flush any slice's buffer.
#[derive(Debug)]
pub(crate) struct Slice {
    index:    u32,
    begin:    u64,
    /// Inclusive range end; `None` for the open-ended streaming slice.
    end:      Option<u64>,
    /// Bytes already written to the temporary file.
    flushed:  AtomicU64,
    /// Bytes sitting in `buffer`, mirrored for lock-free reads.
    buffered: AtomicU64,
    status:   AtomicU8,
    buffer:   Mutex<Vec<u8>>,
}

impl Slice {
    pub(crate) fn new(index: u32, begin: u64, end: Option<u64>, flushed: u64) -> Self {
        let len = end.map(|end| end - begin + 1);
        let status = if len.is_some_and(|len| flushed == len) {
            SliceStatus::Done
        } else {
            SliceStatus::Idle
        };
        Self {
            index,
            begin,
            end,
            flushed: AtomicU64::new(flushed),
            buffered: AtomicU64::new(0),
            status: AtomicU8::new(status as u8),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn index(&self) -> u32 { self.index }

    pub(crate) fn begin(&self) -> u64 { self.begin }

    pub(crate) fn end(&self) -> Option<u64> { self.end }

    /// Range length when bounded.
    pub(crate) fn len(&self) -> Option<u64> { self.end.map(|end| end - self.begin + 1) }

    pub(crate) fn flushed(&self) -> u64 { self.flushed.load(Ordering::Acquire) }

    pub(crate) fn buffered(&self) -> u64 { self.buffered.load(Ordering::Acquire) }

    /// Total bytes received for this range, on disk plus buffered.
    pub(crate) fn captured(&self) -> u64 { self.flushed() + self.buffered() }

    /// Absolute offset the next received byte belongs at.
    pub(crate) fn next_offset(&self) -> u64 { self.begin + self.captured() }

    /// Bytes still missing when the range is bounded.
    pub(crate) fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.captured()))
    }

    pub(crate) fn status(&self) -> SliceStatus {
        SliceStatus::from_repr(self.status.load(Ordering::Acquire)).unwrap_or(SliceStatus::Idle)
    }

    pub(crate) fn set_status(&self, status: SliceStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn is_done(&self) -> bool { self.status() == SliceStatus::Done }

    /// `Range` header value for the next request, `None` when a plain GET
    /// must be issued (open-ended slice from the start of the resource).
    pub(crate) fn range_header(&self) -> Option<String> {
        let offset = self.next_offset();
        match self.end {
            Some(end) => Some(format!("bytes={offset}-{end}")),
            None if offset > 0 => Some(format!("bytes={offset}-")),
            None => None,
        }
    }

    /// Buffer received bytes; marks the slice done when the range fills up.
    pub(crate) async fn append(&self, cache: &DiskCache, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(data);
        self.buffered.fetch_add(data.len() as u64, Ordering::AcqRel);
        cache.add(data.len() as u64);
        drop(buffer);

        if self.remaining() == Some(0) {
            self.set_status(SliceStatus::Done);
        }
    }

    /// Whether this slice must be written out now.
    pub(crate) fn needs_flush(&self, threshold: u64) -> bool {
        let buffered = self.buffered();
        buffered > 0 && (buffered >= threshold || self.is_done())
    }

    /// Write the buffer at `begin + flushed`, emptying it. Returns the
    /// number of bytes written.
    pub(crate) async fn flush_to(
        &self,
        file: &TargetFile,
        cache: &DiskCache,
    ) -> std::io::Result<u64> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(0);
        }
        let offset = self.begin + self.flushed.load(Ordering::Acquire);
        file.write_at(offset, &buffer).await?;
        let written = buffer.len() as u64;
        buffer.clear();
        self.flushed.fetch_add(written, Ordering::AcqRel);
        self.buffered.fetch_sub(written, Ordering::AcqRel);
        cache.sub(written);
        Ok(written)
    }

    /// Drop buffered bytes before a retry; flushed bytes stay authoritative.
    pub(crate) async fn discard_buffer(&self, cache: &DiskCache) {
        let mut buffer = self.buffer.lock().await;
        let dropped = buffer.len() as u64;
        if dropped == 0 {
            return;
        }
        buffer.clear();
        self.buffered.fetch_sub(dropped, Ordering::AcqRel);
        cache.sub(dropped);
    }
}
