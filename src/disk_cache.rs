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

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate accountant of bytes buffered in memory across all slices.
///
/// Slices report appends and flushes here; the slice manager consults
/// [`DiskCache::over_watermark`] to decide when buffers must be written out.
/// A zero watermark disables buffering entirely: any buffered byte demands a
/// flush.
#[derive(Debug)]
pub(crate) struct DiskCache {
    buffered:  AtomicU64,
    watermark: u64,
}

impl DiskCache {
    pub(crate) const fn new(watermark: u64) -> Self {
        Self { buffered: AtomicU64::new(0), watermark }
    }

    pub(crate) fn add(&self, bytes: u64) { self.buffered.fetch_add(bytes, Ordering::AcqRel); }

    pub(crate) fn sub(&self, bytes: u64) { self.buffered.fetch_sub(bytes, Ordering::AcqRel); }

    pub(crate) fn buffered(&self) -> u64 { self.buffered.load(Ordering::Acquire) }

    pub(crate) fn over_watermark(&self) -> bool {
        let buffered = self.buffered();
        if self.watermark == 0 {
            buffered > 0
        } else {
            buffered >= self.watermark
        }
    }
}
