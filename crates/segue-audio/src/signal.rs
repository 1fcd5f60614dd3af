//! Wake signals between the engine's threads.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Wakeups that may be pending at once. Further posts are dropped, which is
/// fine since one wakeup makes a worker re-examine all of its work.
const PENDING_WAKEUPS: usize = 4;

/// Counting signal used to wake a worker thread.
///
/// Posting never blocks, so it is safe from the render callback.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(PENDING_WAKEUPS);
        Self { tx, rx }
    }

    /// Post a wakeup.
    pub fn post(&self) {
        let _ = self.tx.try_send(());
    }

    /// Block until woken or `timeout` elapses. Returns `true` when woken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Discard pending wakeups.
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}
