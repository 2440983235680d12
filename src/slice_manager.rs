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
    path::{Path, PathBuf},
    sync::Arc,
};

use jiff::Timestamp;
use snafu::ResultExt;
use tokio::sync::Mutex;

use crate::{
    config::DownloadConfig,
    disk_cache::DiskCache,
    error::{
        CreateTmpFileSnafu, DownloadError, FlushTmpFileSnafu, InvalidIndexFormatSnafu,
        OpenIndexFileSnafu, OpenTmpFileSnafu, RenameTmpFileSnafu, TmpFileCannotRwSnafu,
        TmpFileExpiredSnafu, TmpFileSizeSnafu, UpdateIndexFileSnafu, UrlDifferentSnafu,
    },
    file_info::FileInfo,
    index_file::{IndexRecord, SCHEMA_VERSION, SliceRecord},
    slice::Slice,
    target_file::TargetFile,
    types::{VerboseCallback, emit_verbose},
};

/// Sidecar index path for a target: `<target>.teemo`.
pub(crate) fn index_path_for(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(".teemo");
    PathBuf::from(os)
}

/// In-progress body path for a target: `<target>.teemo.tmp`.
pub(crate) fn body_path_for(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(".teemo.tmp");
    PathBuf::from(os)
}

/// Owns the slice set of one job: reconciles the sidecar with the discovered
/// resource, synthesizes the slice plan, orchestrates flushes under the disk
/// cache watermark, persists progress atomically, and finalizes the target.
pub(crate) struct SliceManager {
    url:          String,
    target_path:  PathBuf,
    index_path:   PathBuf,
    total_size:   Option<u64>,
    slices:       Vec<Arc<Slice>>,
    file:         TargetFile,
    cache:        DiskCache,
    persist_lock: Mutex<()>,
    verbose:      Option<VerboseCallback>,
}

impl std::fmt::Debug for SliceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceManager")
            .field("url", &self.url)
            .field("target_path", &self.target_path)
            .field("index_path", &self.index_path)
            .field("total_size", &self.total_size)
            .field("slices", &self.slices)
            .field("file", &self.file)
            .field("cache", &self.cache)
            .field("verbose", &self.verbose.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl SliceManager {
    /// Load-or-plan against the discovered resource and open the body file.
    pub(crate) async fn create(
        target_path: &Path,
        config: &DownloadConfig,
        url: String,
        info: &FileInfo,
    ) -> Result<Self, DownloadError> {
        let index_path = index_path_for(target_path);
        let body_path = body_path_for(target_path);
        let verbose = config.verbose.clone();

        let record = match tokio::fs::read(&index_path).await {
            Ok(bytes) => Some(IndexRecord::decode(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).context(OpenIndexFileSnafu { path: index_path });
            }
        };

        if let Some(record) = record {
            Self::reconcile(config, &url, info, &record)?;

            if tokio::fs::try_exists(&body_path).await.unwrap_or(false) {
                let slices = Self::adopt_slices(&record, info.total_size)?;
                let file = TargetFile::open_rw(&body_path)
                    .await
                    .context(OpenTmpFileSnafu { path: body_path.clone() })?;
                if let Some(total) = info.total_size {
                    file.ensure_len(total)
                        .await
                        .context(TmpFileCannotRwSnafu { path: body_path.clone() })?;
                }
                emit_verbose(
                    verbose.as_ref(),
                    &format!(
                        "resuming from index: {} slice(s), {} byte(s) already on disk",
                        slices.len(),
                        slices.iter().map(|s| s.flushed()).sum::<u64>()
                    ),
                );
                return Ok(Self {
                    url,
                    target_path: target_path.to_path_buf(),
                    index_path,
                    total_size: info.total_size,
                    slices,
                    file,
                    cache: DiskCache::new(config.disk_cache_bytes),
                    persist_lock: Mutex::new(()),
                    verbose,
                });
            }

            emit_verbose(
                verbose.as_ref(),
                "index present but temporary file missing; planning from scratch",
            );
        }

        let slices = Self::plan_slices(info.total_size, config.thread_num);
        let file = TargetFile::create(&body_path, info.total_size)
            .await
            .context(CreateTmpFileSnafu { path: body_path.clone() })?;
        emit_verbose(
            verbose.as_ref(),
            &format!("planned {} slice(s) for the transfer", slices.len()),
        );

        Ok(Self {
            url,
            target_path: target_path.to_path_buf(),
            index_path,
            total_size: info.total_size,
            slices,
            file,
            cache: DiskCache::new(config.disk_cache_bytes),
            persist_lock: Mutex::new(()),
            verbose,
        })
    }

    /// Policy checks of a loaded sidecar against the caller and the server.
    fn reconcile(
        config: &DownloadConfig,
        url: &str,
        info: &FileInfo,
        record: &IndexRecord,
    ) -> Result<(), DownloadError> {
        if !config.skipping_url_check && record.url != url {
            return UrlDifferentSnafu { stored: record.url.clone(), requested: url }.fail();
        }

        if config.tmp_expire_secs >= 0 {
            let age = Timestamp::now().as_second() - record.saved_at_unix;
            if age >= config.tmp_expire_secs {
                return TmpFileExpiredSnafu {
                    age_secs:   age,
                    limit_secs: config.tmp_expire_secs,
                }
                .fail();
            }
        }

        if let (Some(stored), Some(actual)) = (record.total_size, info.total_size) {
            if stored != actual {
                return TmpFileSizeSnafu { stored, actual }.fail();
            }
        }

        Ok(())
    }

    /// Turn sidecar records into live slices, verifying they still partition
    /// the resource.
    fn adopt_slices(
        record: &IndexRecord,
        total_size: Option<u64>,
    ) -> Result<Vec<Arc<Slice>>, DownloadError> {
        let slices: Vec<Arc<Slice>> = record
            .slices
            .iter()
            .enumerate()
            .map(|(index, r)| Arc::new(Slice::new(index as u32, r.begin, r.end, r.captured)))
            .collect();

        match total_size {
            Some(0) => {}
            Some(total) => {
                let mut expected_begin = 0u64;
                for slice in &slices {
                    if slice.begin() != expected_begin {
                        return InvalidIndexFormatSnafu {
                            reason: format!(
                                "slice table has a gap or overlap at byte {expected_begin}"
                            ),
                        }
                        .fail();
                    }
                    let Some(end) = slice.end() else {
                        return InvalidIndexFormatSnafu {
                            reason: "open-ended slice in a sized plan",
                        }
                        .fail();
                    };
                    expected_begin = end + 1;
                }
                if expected_begin != total {
                    return InvalidIndexFormatSnafu {
                        reason: format!(
                            "slice table covers {expected_begin} byte(s) of {total}"
                        ),
                    }
                    .fail();
                }
            }
            None => {
                let streaming_single = slices.len() == 1
                    && slices[0].begin() == 0
                    && slices[0].end().is_none();
                if !streaming_single {
                    return InvalidIndexFormatSnafu {
                        reason: "unsized resource requires a single streaming slice",
                    }
                    .fail();
                }
            }
        }

        Ok(slices)
    }

    /// Slice plan for a fresh job.
    fn plan_slices(total_size: Option<u64>, thread_num: u32) -> Vec<Arc<Slice>> {
        match total_size {
            // Unknown size: one open-ended streaming slice.
            None => vec![Arc::new(Slice::new(0, 0, None, 0))],
            Some(0) => Vec::new(),
            Some(total) => {
                let count = u64::from(thread_num).min(total);
                let per_slice = total.div_ceil(count);
                let mut slices = Vec::with_capacity(count as usize);
                let mut begin = 0u64;
                while begin < total {
                    let end = (begin + per_slice - 1).min(total - 1);
                    slices.push(Arc::new(Slice::new(slices.len() as u32, begin, Some(end), 0)));
                    begin = end + 1;
                }
                slices
            }
        }
    }

    pub(crate) fn total_size(&self) -> Option<u64> { self.total_size }

    pub(crate) fn cache(&self) -> &DiskCache { &self.cache }

    pub(crate) fn slices(&self) -> &[Arc<Slice>] { &self.slices }

    /// The dispatch view: slices that still need a transfer.
    pub(crate) fn pending_slices(&self) -> Vec<Arc<Slice>> {
        self.slices.iter().filter(|s| !s.is_done()).cloned().collect()
    }

    pub(crate) fn is_complete(&self) -> bool { self.slices.iter().all(|s| s.is_done()) }

    /// Bytes received across all slices, on disk plus buffered.
    pub(crate) fn total_captured(&self) -> u64 {
        self.slices.iter().map(|s| s.captured()).sum()
    }

    pub(crate) fn total_flushed(&self) -> u64 { self.slices.iter().map(|s| s.flushed()).sum() }

    /// Write one slice's buffer out and record the progress in the sidecar.
    /// The sidecar write happens after the flush it reflects.
    pub(crate) async fn flush_slice(&self, slice: &Slice) -> Result<(), DownloadError> {
        let written = slice
            .flush_to(&self.file, &self.cache)
            .await
            .context(FlushTmpFileSnafu)?;
        if written > 0 {
            self.persist().await?;
        }
        Ok(())
    }

    /// Flush the largest buffers until the aggregate drops back under the
    /// disk cache watermark.
    pub(crate) async fn enforce_cache_watermark(&self) -> Result<(), DownloadError> {
        while self.cache.over_watermark() {
            let fattest = self
                .slices
                .iter()
                .filter(|s| s.needs_flush(1))
                .max_by_key(|s| s.buffered())
                .cloned();
            let Some(slice) = fattest else { break };
            self.flush_slice(&slice).await?;
        }
        Ok(())
    }

    /// Flush every buffered byte.
    pub(crate) async fn flush_all(&self) -> Result<(), DownloadError> {
        for slice in &self.slices {
            if slice.needs_flush(1) {
                self.flush_slice(slice).await?;
            }
        }
        Ok(())
    }

    /// Atomically rewrite the sidecar from the current flushed counts.
    pub(crate) async fn persist(&self) -> Result<(), DownloadError> {
        let _guard = self.persist_lock.lock().await;

        let record = self.snapshot().merge_adjacent_done();
        let mut swap = self.index_path.as_os_str().to_os_string();
        swap.push(".swap");
        let swap = PathBuf::from(swap);

        tokio::fs::write(&swap, record.encode())
            .await
            .context(UpdateIndexFileSnafu { path: self.index_path.clone() })?;
        tokio::fs::rename(&swap, &self.index_path)
            .await
            .context(UpdateIndexFileSnafu { path: self.index_path.clone() })?;
        Ok(())
    }

    fn snapshot(&self) -> IndexRecord {
        IndexRecord {
            version:       SCHEMA_VERSION,
            url:           self.url.clone(),
            total_size:    self.total_size,
            saved_at_unix: Timestamp::now().as_second(),
            slices:        self
                .slices
                .iter()
                .map(|s| SliceRecord { begin: s.begin(), end: s.end(), captured: s.flushed() })
                .collect(),
        }
    }

    /// Rename the finished body onto the target and drop the sidecar.
    pub(crate) async fn finalize(&self) -> Result<(), DownloadError> {
        self.flush_all().await?;
        self.file.sync().await.context(FlushTmpFileSnafu)?;

        if let Some(parent) = self.target_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.context(
                    crate::error::CreateTargetFileSnafu { path: self.target_path.clone() },
                )?;
            }
        }
        tokio::fs::rename(self.file.path(), &self.target_path)
            .await
            .context(RenameTmpFileSnafu { path: self.target_path.clone() })?;

        if let Err(err) = tokio::fs::remove_file(&self.index_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("removing sidecar {} failed: {err}", self.index_path.display());
            }
        }
        emit_verbose(
            self.verbose.as_ref(),
            &format!(
                "finalized {} ({} bytes)",
                self.target_path.display(),
                self.total_flushed()
            ),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::types::DownloadResult;

    fn info(total: Option<u64>) -> FileInfo {
        FileInfo {
            total_size:     total,
            accepts_ranges: true,
            etag:           None,
            last_modified:  None,
        }
    }

    fn config() -> DownloadConfig { DownloadConfig::default() }

    #[test]
    fn plans_partition_the_resource() {
        for (total, threads) in [(1000u64, 4u32), (10, 4), (3, 100), (7, 1), (1001, 4)] {
            let slices = SliceManager::plan_slices(Some(total), threads);
            assert!(slices.len() as u64 <= u64::from(threads).min(total));
            let mut expected_begin = 0;
            for slice in &slices {
                assert_eq!(slice.begin(), expected_begin, "gap at {total}/{threads}");
                let end = slice.end().unwrap();
                assert!(end >= slice.begin());
                expected_begin = end + 1;
            }
            assert_eq!(expected_begin, total);

            let per_slice = total.div_ceil(u64::from(threads).min(total));
            for slice in &slices[..slices.len() - 1] {
                assert_eq!(slice.len().unwrap(), per_slice);
            }
        }
    }

    #[test]
    fn unknown_size_collapses_to_one_streaming_slice() {
        let slices = SliceManager::plan_slices(None, 8);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].end(), None);

        assert!(SliceManager::plan_slices(Some(0), 4).is_empty());
    }

    #[tokio::test]
    async fn fresh_persist_then_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let cfg = DownloadConfig { thread_num: 4, ..config() };

        let manager = SliceManager::create(&target, &cfg, "http://x/f".into(), &info(Some(100)))
            .await
            .unwrap();
        manager.persist().await.unwrap();

        let bytes = tokio::fs::read(index_path_for(&target)).await.unwrap();
        let record = IndexRecord::decode(&bytes).unwrap();
        assert_eq!(record.url, "http://x/f");
        assert_eq!(record.total_size, Some(100));
        assert_eq!(record.slices.len(), 4);

        // A second manager adopts the persisted table.
        let resumed = SliceManager::create(&target, &cfg, "http://x/f".into(), &info(Some(100)))
            .await
            .unwrap();
        assert_eq!(resumed.slices().len(), 4);
        assert_eq!(resumed.total_captured(), 0);
    }

    #[tokio::test]
    async fn url_mismatch_is_rejected_unless_skipped() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");

        let manager =
            SliceManager::create(&target, &config(), "http://a/f".into(), &info(Some(10)))
                .await
                .unwrap();
        manager.persist().await.unwrap();

        let err = SliceManager::create(&target, &config(), "http://b/f".into(), &info(Some(10)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::UrlDifferent);

        let skipping = DownloadConfig { skipping_url_check: true, ..config() };
        assert!(
            SliceManager::create(&target, &skipping, "http://b/f".into(), &info(Some(10)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn expired_sidecar_is_rejected() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let index = index_path_for(&target);

        let record = IndexRecord {
            version:       SCHEMA_VERSION,
            url:           "http://x/f".to_string(),
            total_size:    Some(10),
            saved_at_unix: Timestamp::now().as_second() - 3600,
            slices:        vec![SliceRecord { begin: 0, end: Some(9), captured: 0 }],
        };
        tokio::fs::write(&index, record.encode()).await.unwrap();
        tokio::fs::write(body_path_for(&target), [0u8; 10]).await.unwrap();

        let cfg = DownloadConfig { tmp_expire_secs: 60, ..config() };
        let err = SliceManager::create(&target, &cfg, "http://x/f".into(), &info(Some(10)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::TmpFileExpired);

        // Never-expire keeps the sidecar usable.
        let cfg = DownloadConfig { tmp_expire_secs: -1, ..config() };
        assert!(
            SliceManager::create(&target, &cfg, "http://x/f".into(), &info(Some(10)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn total_size_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");

        let manager =
            SliceManager::create(&target, &config(), "http://x/f".into(), &info(Some(10)))
                .await
                .unwrap();
        manager.persist().await.unwrap();

        let err = SliceManager::create(&target, &config(), "http://x/f".into(), &info(Some(11)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::TmpFileSizeError);
    }

    #[tokio::test]
    async fn corrupted_slice_table_is_invalid() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let index = index_path_for(&target);

        // A table with a hole must not be adopted.
        let record = IndexRecord {
            version:       SCHEMA_VERSION,
            url:           "http://x/f".to_string(),
            total_size:    Some(100),
            saved_at_unix: Timestamp::now().as_second(),
            slices:        vec![
                SliceRecord { begin: 0, end: Some(49), captured: 50 },
                SliceRecord { begin: 60, end: Some(99), captured: 0 },
            ],
        };
        tokio::fs::write(&index, record.encode()).await.unwrap();
        tokio::fs::write(body_path_for(&target), [0u8; 100]).await.unwrap();

        let err = SliceManager::create(&target, &config(), "http://x/f".into(), &info(Some(100)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidIndexFormat);
    }

    #[tokio::test]
    async fn zero_length_resource_finalizes_immediately() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("empty.bin");

        let manager = SliceManager::create(&target, &config(), "http://x/e".into(), &info(Some(0)))
            .await
            .unwrap();
        assert!(manager.is_complete());
        manager.finalize().await.unwrap();

        assert_eq!(tokio::fs::metadata(&target).await.unwrap().len(), 0);
        assert!(!tokio::fs::try_exists(index_path_for(&target)).await.unwrap());
        assert!(!tokio::fs::try_exists(body_path_for(&target)).await.unwrap());
    }

    #[tokio::test]
    async fn watermark_flushes_largest_buffers_first() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let cfg = DownloadConfig { thread_num: 2, disk_cache_bytes: 16, ..config() };

        let manager = SliceManager::create(&target, &cfg, "http://x/f".into(), &info(Some(20)))
            .await
            .unwrap();
        let slices = manager.slices().to_vec();
        slices[0].append(manager.cache(), &[1u8; 4]).await;
        slices[1].append(manager.cache(), &[2u8; 10]).await;
        assert!(!manager.cache().over_watermark());
        manager.enforce_cache_watermark().await.unwrap();
        assert_eq!(manager.total_flushed(), 0);

        slices[0].append(manager.cache(), &[1u8; 4]).await;
        assert!(manager.cache().over_watermark());
        manager.enforce_cache_watermark().await.unwrap();

        // The 10-byte buffer went first; flushing it was already enough.
        assert_eq!(slices[1].buffered(), 0);
        assert_eq!(slices[1].flushed(), 10);
        assert_eq!(slices[0].buffered(), 8);
        assert_eq!(manager.cache().buffered(), 8);

        // Accounting invariant holds across the flush.
        assert_eq!(
            manager.total_captured(),
            manager.total_flushed() + manager.cache().buffered()
        );

        // The sidecar written by the flush reflects only flushed bytes.
        let record =
            IndexRecord::decode(&tokio::fs::read(index_path_for(&target)).await.unwrap()).unwrap();
        assert_eq!(record.slices.iter().map(|s| s.captured).sum::<u64>(), 10);
    }
}
