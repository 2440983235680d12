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
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Caller-owned cross-thread stop signal.
///
/// A condvar-backed boolean with a timed wait. Setting is idempotent and the
/// flag can be read without taking the lock; waiters tolerate spurious
/// wakeups. Share it between the embedder and a job via `Arc` and install it
/// with [`crate::Downloader::set_stop_event`].
#[derive(Debug, Default)]
pub struct StopEvent {
    flag:  AtomicBool,
    state: Mutex<bool>,
    cond:  Condvar,
}

impl StopEvent {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Signal the event, waking all waiters. Idempotent.
    pub fn set(&self) {
        let mut set = self.state.lock().expect("stop event lock poisoned");
        *set = true;
        self.flag.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Clear the event so it can be reused for another job.
    pub fn unset(&self) {
        let mut set = self.state.lock().expect("stop event lock poisoned");
        *set = false;
        self.flag.store(false, Ordering::Release);
    }

    /// Lock-free read of the flag.
    #[must_use]
    pub fn is_set(&self) -> bool { self.flag.load(Ordering::Acquire) }

    /// Block until the event is set or `timeout` elapses. Returns the state
    /// of the flag at wakeup.
    pub fn wait(&self, timeout: Duration) -> bool {
        let set = self.state.lock().expect("stop event lock poisoned");
        let (set, _) = self
            .cond
            .wait_timeout_while(set, timeout, |set| !*set)
            .expect("stop event lock poisoned");
        *set
    }
}
