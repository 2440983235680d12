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
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Width of the accounting window.
const WINDOW: Duration = Duration::from_millis(1000);

/// Longest single cooperative stall.
const MAX_STALL: Duration = Duration::from_millis(1000);

/// Aggregate byte/second governor shared by all slice transfers.
///
/// Transfers account received bytes into a sliding 1000 ms window through
/// [`SpeedLimiter::consume`]; when a cap is configured, the call stalls
/// cooperatively until enough earlier charges age out of the window for the
/// new bytes to fit under the cap. With a non-positive cap the governor never
/// stalls but still answers [`SpeedLimiter::rate`] for the speed callback.
#[derive(Debug)]
pub(crate) struct SpeedLimiter {
    max_bps: i64,
    window:  Mutex<VecDeque<(Instant, u64)>>,
}

impl SpeedLimiter {
    pub(crate) fn new(max_bps: i64) -> Self {
        Self { max_bps, window: Mutex::new(VecDeque::new()) }
    }

    /// Account `bytes`, first stalling until they fit under the cap.
    pub(crate) async fn consume(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if self.max_bps > 0 {
            let cap = self.max_bps as u64;
            // A charge larger than a full window budget can only ever start
            // against an empty window.
            let headroom = cap.saturating_sub(bytes.min(cap));
            loop {
                let stall = {
                    let now = Instant::now();
                    let mut window = self.window.lock().expect("speed window lock poisoned");
                    Self::prune(&mut window, now);
                    Self::stall_needed(&window, headroom, now)
                };
                match stall {
                    None => break,
                    Some(stall) => tokio::time::sleep(stall.min(MAX_STALL)).await,
                }
            }
        }
        let now = Instant::now();
        let mut window = self.window.lock().expect("speed window lock poisoned");
        Self::prune(&mut window, now);
        window.push_back((now, bytes));
    }

    /// Bytes observed in the last 1000 ms.
    pub(crate) fn rate(&self) -> u64 {
        let now = Instant::now();
        let mut window = self.window.lock().expect("speed window lock poisoned");
        Self::prune(&mut window, now);
        window.iter().map(|(_, bytes)| bytes).sum()
    }

    fn prune(window: &mut VecDeque<(Instant, u64)>, now: Instant) {
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// The minimum sleep after which enough charges age out of the window to
    /// bring its sum down to `budget` or lower.
    fn stall_needed(
        window: &VecDeque<(Instant, u64)>,
        budget: u64,
        now: Instant,
    ) -> Option<Duration> {
        let mut in_window: u64 = window.iter().map(|(_, bytes)| bytes).sum();
        if in_window <= budget {
            return None;
        }
        for (at, bytes) in window {
            in_window -= bytes;
            if in_window <= budget {
                let age_out = *at + WINDOW;
                return Some(age_out.saturating_duration_since(now));
            }
        }
        Some(WINDOW)
    }
}
