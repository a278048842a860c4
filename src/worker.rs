// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worker thread abstraction

use std::io;
use std::panic;
use std::thread;
use std::thread::JoinHandle;

use crate::poll::Event;

/// A named thread that is told to exit by signaling an [`Event`] and is joined when stopped.
///
/// Joining is what guarantees that no callback of the thread still runs once `stop` returns.
pub struct WorkerThread<T: Send + 'static> {
    worker: Option<(Event, JoinHandle<T>)>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Starts a worker thread named `thread_name` running `thread_func`.
    ///
    /// `thread_func` must watch the provided `Event` and return once it is signaled.
    pub fn start<F>(thread_name: impl Into<String>, thread_func: F) -> io::Result<Self>
    where
        F: FnOnce(Event) -> T + Send + 'static,
    {
        let stop_event = Event::new()?;
        let thread_stop_event = stop_event.try_clone()?;

        let thread_handle = thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || thread_func(thread_stop_event))?;

        Ok(WorkerThread {
            worker: Some((stop_event, thread_handle)),
        })
    }

    /// Stops the worker thread and returns what its function returned, or `None` if it was
    /// already stopped.
    pub fn stop(&mut self) -> Option<T> {
        self.worker.take().map(|(stop_event, thread_handle)| {
            // Leaving the thread running would break the shutdown barrier.
            stop_event
                .signal()
                .expect("WorkerThread stop event signal failed");

            match thread_handle.join() {
                Ok(v) => v,
                Err(e) => panic::resume_unwind(e),
            }
        })
    }

    /// Signals the thread to exit without waiting for it. Used when the worker itself asks to
    /// stop, since a thread cannot join itself.
    pub fn detach(&mut self) {
        if let Some((stop_event, _)) = self.worker.take() {
            if let Err(e) = stop_event.signal() {
                log::error!("failed to signal worker stop event: {}", e);
            }
        }
    }

    /// Whether the calling thread is the worker.
    pub fn is_current(&self) -> bool {
        self.worker
            .as_ref()
            .map(|(_, handle)| handle.thread().id() == thread::current().id())
            .unwrap_or(false)
    }
}

impl<T: Send + 'static> Drop for WorkerThread<T> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
