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

//! Resumable multi-connection HTTP downloader.
//!
//! A job fetches a resource in parallel byte-range slices, persists partial
//! progress across process restarts through a sidecar index
//! (`<target>.teemo`), bounds in-memory buffering with a disk-cache
//! watermark, enforces an aggregate speed cap, and reports progress, rate,
//! and the terminal result to the embedder.
//!
//! ```rust,no_run
//! use teemo::{DownloadResult, Downloader};
//!
//! #[tokio::main]
//! async fn main() {
//!     teemo::global_init();
//!
//!     let mut job = Downloader::new();
//!     job.set_thread_num(4).unwrap();
//!     let handle = job.start("http://example.com/big.bin", "big.bin", None, None, None);
//!     assert_eq!(handle.wait().await, DownloadResult::Successed);
//! }
//! ```

mod config;
mod disk_cache;
mod downloader;
mod entry_handler;
mod error;
mod event;
mod file_info;
mod index_file;
mod slice;
mod slice_manager;
mod speed_limiter;
mod target_file;
mod types;

pub use config::{
    DEFAULT_CONN_TIMEOUT_MS, DEFAULT_DISK_CACHE_BYTES, DEFAULT_FETCH_INFO_RETRIES,
    DEFAULT_THREAD_NUM, DownloadConfig, MAX_THREAD_NUM, SLICE_RETRY_BUDGET,
};
pub use downloader::{DownloadHandle, Downloader, global_init, global_uninit};
pub use error::DownloadError;
pub use event::StopEvent;
pub use file_info::FileInfo;
pub use index_file::{IndexRecord, SCHEMA_VERSION, SliceRecord};
pub use types::{
    DownloadResult, ProgressCallback, ResultCallback, SliceStatus, SpeedCallback, VerboseCallback,
};
