//! The watchdog supervisor.
//!
//! Runs the worker side of the daemon as a supervised task and owns the
//! signal semantics: SIGHUP drains the workers and starts them again with
//! the original options (graceful restart), SIGINT/SIGTERM drain and
//! exit, SIGQUIT aborts on the spot. A worker set that fails to drain
//! within the timeout is aborted.

use crate::error::DaemonResult;
use std::future::Future;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long a drain may take before the worker set is abandoned.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// What the supervisor does in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Drain, then start the worker set again
    Restart,
    /// Drain, then exit cleanly
    Shutdown,
    /// Abort immediately
    Abort,
}

/// The signal-to-action policy.
pub fn action_for_signal(kind: SignalKind) -> Option<SupervisorAction> {
    match kind {
        k if k == SignalKind::hangup() => Some(SupervisorAction::Restart),
        k if k == SignalKind::interrupt() => Some(SupervisorAction::Shutdown),
        k if k == SignalKind::terminate() => Some(SupervisorAction::Shutdown),
        k if k == SignalKind::quit() => Some(SupervisorAction::Abort),
        _ => None,
    }
}

/// Supervise the worker set until it exits or a terminal signal arrives.
///
/// `run` is invoked once per generation; a SIGHUP restart calls it again
/// with a fresh token. The returned value is the process exit code.
pub async fn supervise<F, Fut>(mut run: F) -> DaemonResult<i32>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = DaemonResult<()>> + Send + 'static,
{
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    loop {
        let token = CancellationToken::new();
        let mut worker: JoinHandle<DaemonResult<()>> = tokio::spawn(run(token.clone()));

        let action = tokio::select! {
            result = &mut worker => {
                return Ok(match result {
                    Ok(Ok(())) => {
                        info!("Worker set finished");
                        0
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Worker set failed");
                        255
                    }
                    Err(e) => {
                        error!(error = %e, "Worker set panicked");
                        255
                    }
                });
            }
            _ = sighup.recv() => SupervisorAction::Restart,
            _ = sigint.recv() => SupervisorAction::Shutdown,
            _ = sigterm.recv() => SupervisorAction::Shutdown,
            _ = sigquit.recv() => SupervisorAction::Abort,
        };

        match action {
            SupervisorAction::Restart => {
                info!("Restart requested");
                drain(token, worker).await;
            }
            SupervisorAction::Shutdown => {
                info!("Shutdown requested");
                let drained = drain(token, worker).await;
                return Ok(if drained { 0 } else { 255 });
            }
            SupervisorAction::Abort => {
                warn!("Immediate shutdown requested");
                worker.abort();
                return Ok(255);
            }
        }
    }
}

/// Cancel the worker set and wait for it, up to [`DRAIN_TIMEOUT`].
async fn drain(token: CancellationToken, worker: JoinHandle<DaemonResult<()>>) -> bool {
    token.cancel();
    let abort = worker.abort_handle();
    match timeout(DRAIN_TIMEOUT, worker).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            error!(error = %e, "Worker set failed during drain");
            true
        }
        Ok(Err(e)) => {
            error!(error = %e, "Worker set panicked during drain");
            true
        }
        Err(_) => {
            warn!("Worker set did not drain in time, aborting");
            abort.abort();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_policy() {
        assert_eq!(
            action_for_signal(SignalKind::hangup()),
            Some(SupervisorAction::Restart)
        );
        assert_eq!(
            action_for_signal(SignalKind::interrupt()),
            Some(SupervisorAction::Shutdown)
        );
        assert_eq!(
            action_for_signal(SignalKind::terminate()),
            Some(SupervisorAction::Shutdown)
        );
        assert_eq!(
            action_for_signal(SignalKind::quit()),
            Some(SupervisorAction::Abort)
        );
        assert_eq!(action_for_signal(SignalKind::user_defined1()), None);
    }

    #[tokio::test]
    async fn test_supervise_returns_worker_exit() {
        let code = supervise(|_token| async { Ok(()) }).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_supervise_maps_errors_to_fatal_exit() {
        let code = supervise(|_token| async {
            Err(crate::error::DaemonError::Config("boom".to_string()))
        })
        .await
        .unwrap();
        assert_eq!(code, 255);
    }
}
