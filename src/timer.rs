// SPDX-License-Identifier: AGPL-3.0-or-later
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use crossbeam::select;

/// One-shot timer on its own thread. Dropping it cancels the callback.
pub(crate) struct Timer {
    cancel: Option<Sender<()>>,
}

impl Timer {
    pub(crate) fn after<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);
        let deadline = channel::after(delay);
        thread::spawn(move || {
            select! {
                recv(cancel_rx) -> _ => {}
                recv(deadline) -> _ => f(),
            }
        });
        Self {
            cancel: Some(cancel_tx),
        }
    }

    /// Cancels the callback if it has not started yet.
    pub(crate) fn stop(&mut self) {
        // disconnecting wakes the timer thread
        self.cancel.take();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
