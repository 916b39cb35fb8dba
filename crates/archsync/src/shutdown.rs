//! Two-stage graceful shutdown
//!
//! The first interrupt asks the run to stop at the next unit boundary. A
//! second one while that stop is pending escalates to immediate termination:
//! whatever awaits [`ShutdownController::forced`] gives up on the in-flight
//! unit.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    Running,
    StopRequested,
    Forced,
}

impl ShutdownStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownStage::Running,
            1 => ShutdownStage::StopRequested,
            _ => ShutdownStage::Forced,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    stage: AtomicU8,
    forced: Notify,
}

/// Shared, cloneable shutdown state
#[derive(Debug, Clone, Default)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> ShutdownStage {
        ShutdownStage::from_u8(self.inner.stage.load(Ordering::SeqCst))
    }

    /// Record one interrupt and return the stage it led to
    pub fn request(&self) -> ShutdownStage {
        let previous = self
            .inner
            .stage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| Some((s + 1).min(2)))
            .unwrap_or(2);
        let stage = ShutdownStage::from_u8((previous + 1).min(2));
        if stage == ShutdownStage::Forced {
            self.inner.forced.notify_waiters();
        }
        stage
    }

    /// Whether the run should start no further units
    pub fn is_stop_requested(&self) -> bool {
        self.stage() != ShutdownStage::Running
    }

    pub fn is_forced(&self) -> bool {
        self.stage() == ShutdownStage::Forced
    }

    /// Completes once termination has been forced
    pub async fn forced(&self) {
        loop {
            let notified = self.inner.forced.notified();
            if self.is_forced() {
                return;
            }
            notified.await;
        }
    }

    /// Listen for Ctrl-C (and SIGTERM on Unix) for the rest of the process
    pub fn install(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        error!(error = %e, "Cannot listen for SIGTERM");
                        None
                    }
                };

            loop {
                #[cfg(unix)]
                let received = match terminate.as_mut() {
                    Some(sig) => tokio::select! {
                        r = tokio::signal::ctrl_c() => r.is_ok(),
                        r = sig.recv() => r.is_some(),
                    },
                    None => tokio::signal::ctrl_c().await.is_ok(),
                };
                #[cfg(not(unix))]
                let received = tokio::signal::ctrl_c().await.is_ok();

                if !received {
                    error!("Signal listener stopped");
                    return;
                }

                match controller.request() {
                    ShutdownStage::StopRequested => warn!(
                        "Interrupt received: finishing the current unit, then stopping. \
                         Interrupt again to terminate immediately."
                    ),
                    ShutdownStage::Forced => {
                        warn!("Second interrupt: terminating without waiting for the current unit");
                        return;
                    }
                    ShutdownStage::Running => {}
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_two_stage_escalation() {
        let controller = ShutdownController::new();
        assert_eq!(controller.stage(), ShutdownStage::Running);
        assert!(!controller.is_stop_requested());

        assert_eq!(controller.request(), ShutdownStage::StopRequested);
        assert!(controller.is_stop_requested());
        assert!(!controller.is_forced());

        assert_eq!(controller.request(), ShutdownStage::Forced);
        assert!(controller.is_forced());

        // further interrupts stay forced
        assert_eq!(controller.request(), ShutdownStage::Forced);
    }

    #[test]
    fn test_clones_share_state() {
        let controller = ShutdownController::new();
        let clone = controller.clone();
        clone.request();
        assert!(controller.is_stop_requested());
    }

    #[tokio::test]
    async fn test_forced_wakes_waiters() {
        let controller = ShutdownController::new();
        let waiter = {
            let c = controller.clone();
            tokio::spawn(async move { c.forced().await })
        };

        controller.request();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        controller.request();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_forced_returns_immediately_when_already_forced() {
        let controller = ShutdownController::new();
        controller.request();
        controller.request();
        tokio::time::timeout(Duration::from_secs(1), controller.forced())
            .await
            .unwrap();
    }
}
