// THEORY:
// The control loop is strictly sequential: one camera, one background model, two pins,
// and nothing to gain from touching any of them concurrently. It still must not run
// on the thread that waits for OS signals or serves HTTP, so it gets a dedicated
// blocking worker of its own.
//
// The only thing shared with that worker is a one-shot cancellation flag, carried by a
// `watch` channel. The loop polls it synchronously between frames; async code (the
// signal handler, the HTTP server's graceful shutdown) can await it.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core_modules::frame::FrameSource;
use crate::core_modules::localizer::Localizer;
use crate::core_modules::turret::TargetHandler;
use crate::error::Result;
use crate::pipeline::{ControlLoop, LoopSummary};

/// The sending half of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Raises the flag. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// The observing half of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised, or when every handle has been dropped.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Creates a fresh, lowered cancellation flag.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Runs `control_loop` to completion on a dedicated blocking worker.
pub fn spawn_control_loop<S, L, H>(
    mut control_loop: ControlLoop<S, L, H>,
    cancel: CancelToken,
) -> JoinHandle<Result<LoopSummary>>
where
    S: FrameSource + 'static,
    L: Localizer + 'static,
    H: TargetHandler + 'static,
{
    tokio::task::spawn_blocking(move || control_loop.run(&cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn token_observes_cancel() {
        let (handle, token) = cancellation();
        let other = handle.token();
        assert!(!token.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let (handle, mut token) = cancellation();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_when_handle_is_dropped() {
        let (handle, mut token) = cancellation();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }
}
