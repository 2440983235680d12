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
    io::SeekFrom,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

/// The in-progress download body (`<target>.teemo.tmp`).
///
/// One handle serves all slices; writes are positioned and serialized
/// through the mutex, so concurrent flushes of disjoint ranges stay safe.
#[derive(Debug)]
pub(crate) struct TargetFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl TargetFile {
    /// Create (or truncate-extend) the body file, presized to `size` when
    /// known. Sparse allocation is fine.
    pub(crate) async fn create(path: &Path, size: Option<u64>) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        if let Some(size) = size {
            file.set_len(size).await?;
        }
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    /// Open an existing body file for resumption.
    pub(crate) async fn open_rw(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    /// Grow or shrink the body to `size`.
    pub(crate) async fn ensure_len(&self, size: u64) -> std::io::Result<()> {
        let file = self.file.lock().await;
        if file.metadata().await?.len() != size {
            file.set_len(size).await?;
        }
        Ok(())
    }

    /// Positioned write of `data` at `offset`.
    pub(crate) async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    pub(crate) async fn sync(&self) -> std::io::Result<()> {
        self.file.lock().await.sync_all().await
    }

    pub(crate) fn path(&self) -> &Path { &self.path }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn positioned_writes_land_at_their_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("body.tmp");
        let file = TargetFile::create(&path, Some(10)).await.unwrap();

        file.write_at(6, b"6789").await.unwrap();
        file.write_at(0, b"012345").await.unwrap();
        file.sync().await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, b"0123456789");
    }

    #[tokio::test]
    async fn create_presizes_sparsely() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sparse.tmp");
        let _file = TargetFile::create(&path, Some(1 << 20)).await.unwrap();
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 1 << 20);
    }

    #[tokio::test]
    async fn open_rw_requires_existing_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.tmp");
        assert!(TargetFile::open_rw(&missing).await.is_err());
    }
}
