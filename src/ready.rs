// SPDX-License-Identifier: MIT
//! Readiness detection for freshly spawned workers.
//!
//! CodeQL background servers run on the JVM and emit stderr log output once
//! the JVM has initialised. Rather than sleeping for a hard-coded duration,
//! fragile on both fast and slow machines, readiness is the first byte of
//! output on either stream. The detector fails fast when the process dies
//! before producing any output, and resolves best-effort when the timeout
//! expires: the caller's subsequent I/O will surface real failures.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::process::ExitState;

/// Default maximum wait for a worker to become ready (30 s).
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait until a spawned worker signals readiness.
///
/// "Ready" is any of:
/// 1. data observed on stderr or stdout (the first-output heuristic, kept
///    deliberately weak, downstream protocol calls time out on their own);
/// 2. the timeout elapsing (best-effort resolve with a warning).
///
/// Fails when the process has already exited at call time, or exits before
/// producing any output.
pub async fn wait_for_ready(
    label: &str,
    mut ready: watch::Receiver<bool>,
    mut exit: watch::Receiver<ExitState>,
    timeout: Duration,
) -> Result<()> {
    // Dead before we even started waiting.
    if let ExitState::Exited(code) = *exit.borrow() {
        return Err(WorkerError::NotReady {
            label: label.to_string(),
            code,
        });
    }

    tokio::select! {
        // Ready takes precedence when output and exit race.
        biased;
        result = ready.wait_for(|r| *r) => match result {
            Ok(_) => {
                debug!(worker = label, "ready (output detected)");
                Ok(())
            }
            // Sender dropped without ever signalling: the worker is gone.
            Err(_) => Err(WorkerError::NotReady {
                label: label.to_string(),
                code: None,
            }),
        },
        result = exit.wait_for(|state| matches!(state, ExitState::Exited(_))) => {
            let code = match result {
                Ok(state) => match *state {
                    ExitState::Exited(code) => code,
                    ExitState::Running => None,
                },
                Err(_) => None,
            };
            Err(WorkerError::NotReady {
                label: label.to_string(),
                code,
            })
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(
                worker = label,
                timeout_ms = timeout.as_millis() as u64,
                "readiness timeout, proceeding anyway"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (
        watch::Sender<bool>,
        watch::Receiver<bool>,
        watch::Sender<ExitState>,
        watch::Receiver<ExitState>,
    ) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        (ready_tx, ready_rx, exit_tx, exit_rx)
    }

    #[tokio::test]
    async fn resolves_on_ready_signal() {
        let (ready_tx, ready_rx, _exit_tx, exit_rx) = channels();
        let wait = wait_for_ready("w", ready_rx, exit_rx, Duration::from_secs(5));
        ready_tx.send(true).unwrap();
        wait.await.expect("ready");
    }

    #[tokio::test]
    async fn fails_when_already_exited() {
        let (_ready_tx, ready_rx, exit_tx, exit_rx) = channels();
        exit_tx.send(ExitState::Exited(Some(2))).unwrap();
        let err = wait_for_ready("w", ready_rx, exit_rx, Duration::from_secs(5))
            .await
            .expect_err("should fail fast");
        assert!(matches!(
            err,
            WorkerError::NotReady { code: Some(2), .. }
        ));
    }

    #[tokio::test]
    async fn fails_when_exit_beats_output() {
        let (_ready_tx, ready_rx, exit_tx, exit_rx) = channels();
        let wait = wait_for_ready("w", ready_rx, exit_rx, Duration::from_secs(5));
        exit_tx.send(ExitState::Exited(None)).unwrap();
        let err = wait.await.expect_err("exited before ready");
        assert!(matches!(err, WorkerError::NotReady { code: None, .. }));
    }

    #[tokio::test]
    async fn resolves_best_effort_on_timeout() {
        let (_ready_tx, ready_rx, _exit_tx, exit_rx) = channels();
        wait_for_ready("w", ready_rx, exit_rx, Duration::from_millis(20))
            .await
            .expect("best-effort resolve");
    }

    #[tokio::test]
    async fn exit_before_wait_fails_even_with_ready_set() {
        let (ready_tx, ready_rx, exit_tx, exit_rx) = channels();
        ready_tx.send(true).unwrap();
        exit_tx.send(ExitState::Exited(Some(0))).unwrap();
        // An already-dead worker fails fast regardless of buffered output.
        let err = wait_for_ready("w", ready_rx, exit_rx, Duration::from_secs(5))
            .await
            .expect_err("dead before waiting");
        assert!(matches!(err, WorkerError::NotReady { code: Some(0), .. }));
    }

    #[tokio::test]
    async fn ready_wins_when_signals_race_mid_wait() {
        let (ready_tx, ready_rx, exit_tx, exit_rx) = channels();
        let wait = tokio::spawn(wait_for_ready(
            "w",
            ready_rx,
            exit_rx,
            Duration::from_secs(5),
        ));
        // Let the waiter get past its initial state check and into the race.
        tokio::task::yield_now().await;
        ready_tx.send(true).unwrap();
        exit_tx.send(ExitState::Exited(Some(0))).unwrap();
        wait.await.unwrap().expect("ready takes precedence");
    }
}
