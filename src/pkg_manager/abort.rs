//! Cancellation primitive shared by the locator, the context lifecycle and the
//! orchestrator's workers.
//!
//! An [`AbortController`] owns the sending half of a `watch` channel; any
//! number of [`AbortSignal`]s observe it. Aborting is idempotent and sticky.
//! Signals from different controllers can be joined with [`AbortSignal::either`].

use futures_util::future::select_all;
use tokio::sync::watch;

/// Sending half. Dropping the controller does *not* abort its signals.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: vec![self.tx.subscribe()],
        }
    }

    /// Abort every signal derived from this controller.
    ///
    /// Returns `true` only for the call that actually flipped the state.
    pub fn abort(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half, cheap to clone. Fires when any of its controllers aborts.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: Vec<watch::Receiver<bool>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: Vec::new() }
    }

    /// A signal that fires as soon as `self` or `other` does.
    pub fn either(&self, other: &AbortSignal) -> AbortSignal {
        AbortSignal {
            rx: self.rx.iter().chain(&other.rx).cloned().collect(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once the signal fires. Pends forever for [`AbortSignal::never`]
    /// or when the controller is dropped without aborting.
    pub async fn aborted(&self) {
        if self.rx.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.rx.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                if rx.wait_for(|aborted| *aborted).await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
        });
        select_all(waits).await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}
