// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The emulator-wide lock that serializes device emulation.
//!
//! Device models usually run with a big lock held. A synchronous call into the server must not
//! keep that lock while it waits for the reply: the server may need the rest of the machine (for
//! example a DMA read that another vCPU's emulation has to complete) before it can answer. The
//! lock therefore tracks its owning thread so a blocked call can drop it and take it back.

use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::ThreadId;

#[derive(Debug, Default)]
pub struct GlobalLock {
    owner: Mutex<Option<ThreadId>>,
    cond: Condvar,
}

impl GlobalLock {
    pub fn new() -> GlobalLock {
        GlobalLock::default()
    }

    /// Blocks until the lock is free and takes it for the current thread.
    ///
    /// The lock is not recursive; taking it twice on one thread deadlocks.
    pub fn lock(&self) -> GlobalLockGuard {
        self.acquire();
        GlobalLockGuard { lock: self }
    }

    fn acquire(&self) {
        let mut owner = self.owner.lock().expect("global lock poisoned");
        while owner.is_some() {
            owner = self.cond.wait(owner).expect("global lock poisoned");
        }
        *owner = Some(thread::current().id());
    }

    fn release(&self) {
        let mut owner = self.owner.lock().expect("global lock poisoned");
        *owner = None;
        self.cond.notify_one();
    }

    pub fn held_by_current_thread(&self) -> bool {
        *self.owner.lock().expect("global lock poisoned") == Some(thread::current().id())
    }

    /// Drops the lock if the current thread holds it. The returned value takes it back when
    /// dropped. Returns `None` if the current thread does not hold the lock.
    pub fn unlock_temporarily(&self) -> Option<Relock> {
        if !self.held_by_current_thread() {
            return None;
        }
        self.release();
        Some(Relock { lock: self })
    }
}

/// Holds the global lock until dropped.
#[must_use]
pub struct GlobalLockGuard<'a> {
    lock: &'a GlobalLock,
}

impl Drop for GlobalLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Reacquires the global lock when dropped.
#[must_use]
pub struct Relock<'a> {
    lock: &'a GlobalLock,
}

impl Drop for Relock<'_> {
    fn drop(&mut self) {
        self.lock.acquire();
    }
}
