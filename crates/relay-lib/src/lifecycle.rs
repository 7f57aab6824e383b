//! Process lifecycle
//!
//! Converts termination signals into cancellation of a shared token and
//! remembers which signal arrived so the process can pick its exit code.
//! SIGHUP and SIGPIPE are received and dropped so they never terminate
//! the relay. Once a signal is captured it decides the exit status, even
//! when the relay fails or hangs in the call that was in flight.

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time the relay gets to return after a signal before it is abandoned
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Signal that ended the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl TerminationSignal {
    pub fn name(self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
        }
    }

    /// Process exit status for the signal: 128 + signo for SIGINT, 0 for SIGTERM
    pub fn exit_code(self) -> i32 {
        match self {
            TerminationSignal::Interrupt => 130,
            TerminationSignal::Terminate => 0,
        }
    }
}

/// Turns a termination signal into cancellation of the relay
pub struct LifecycleManager {
    shutdown: CancellationToken,
}

impl LifecycleManager {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    /// Install process signal handlers. Must be called inside the runtime.
    pub fn install(self) -> io::Result<LifecycleHandle> {
        ignore(SignalKind::hangup(), "SIGHUP")?;
        ignore(SignalKind::pipe(), "SIGPIPE")?;

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        Ok(self.supervise(async move {
            tokio::select! {
                _ = sigint.recv() => TerminationSignal::Interrupt,
                _ = sigterm.recv() => TerminationSignal::Terminate,
            }
        }))
    }

    /// Cancel the relay once `received` resolves
    pub fn supervise<F>(self, received: F) -> LifecycleHandle
    where
        F: Future<Output = TerminationSignal> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                signal = received => {
                    info!(signal = signal.name(), "Captured signal, exiting");
                    let _ = tx.send(Some(signal));
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested without a signal");
                }
            }
        });

        LifecycleHandle {
            received: rx,
            shutdown: self.shutdown,
            task,
        }
    }
}

/// Running signal supervisor
pub struct LifecycleHandle {
    received: watch::Receiver<Option<TerminationSignal>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl LifecycleHandle {
    /// The termination signal, if one has been captured
    pub fn received(&self) -> Option<TerminationSignal> {
        *self.received.borrow()
    }

    /// Whether the supervisor is still waiting for a signal
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Exit status for the process once the relay has stopped without error
    pub fn exit_code(&self) -> i32 {
        self.received().map_or(0, TerminationSignal::exit_code)
    }

    /// Run the relay until it returns or, after shutdown, until `grace` ends.
    ///
    /// `Ok(None)` means the relay was abandoned or failed after a signal was
    /// captured; [`exit_code`](Self::exit_code) then gives the exit status.
    pub async fn drive<T, E, F>(&self, relay: F, grace: Duration) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let abandon = async {
            self.shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        let result = tokio::select! {
            result = relay => result,
            _ = abandon => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Relay did not stop in time, abandoning it"
                );
                return Ok(None);
            }
        };

        match (result, self.received()) {
            (Ok(value), _) => Ok(Some(value)),
            (Err(e), Some(signal)) => {
                info!(
                    signal = signal.name(),
                    error = %format!("{:#}", anyhow::Error::new(e)),
                    "Relay failed after signal"
                );
                Ok(None)
            }
            (Err(e), None) => Err(e),
        }
    }
}

impl Drop for LifecycleHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Receive and drop a signal for the lifetime of the process
fn ignore(kind: SignalKind, name: &'static str) -> io::Result<()> {
    let mut stream = signal(kind)?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            debug!(signal = name, "Ignoring signal");
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn settle(handle: &LifecycleHandle) {
        for _ in 0..100 {
            if !handle.is_active() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TerminationSignal::Interrupt.exit_code(), 130);
        assert_eq!(TerminationSignal::Terminate.exit_code(), 0);
        assert_eq!(TerminationSignal::Interrupt.name(), "SIGINT");
    }

    #[tokio::test]
    async fn test_interrupt_cancels_relay() {
        let shutdown = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let handle = LifecycleManager::new(shutdown.clone())
            .supervise(async move { rx.await.unwrap_or(TerminationSignal::Terminate) });

        assert!(handle.is_active());
        assert_eq!(handle.received(), None);
        assert!(!shutdown.is_cancelled());

        tx.send(TerminationSignal::Interrupt).unwrap();
        shutdown.cancelled().await;
        settle(&handle).await;

        assert_eq!(handle.received(), Some(TerminationSignal::Interrupt));
        assert_eq!(handle.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_terminate_exits_cleanly() {
        let shutdown = CancellationToken::new();
        let handle = LifecycleManager::new(shutdown.clone())
            .supervise(async { TerminationSignal::Terminate });

        shutdown.cancelled().await;
        settle(&handle).await;

        assert_eq!(handle.received(), Some(TerminationSignal::Terminate));
        assert_eq!(handle.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_stays_active_without_signal() {
        let shutdown = CancellationToken::new();
        let handle = LifecycleManager::new(shutdown.clone())
            .supervise(std::future::pending::<TerminationSignal>());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_active());
        assert_eq!(handle.exit_code(), 0);

        // Shutdown from elsewhere releases the supervisor
        shutdown.cancel();
        settle(&handle).await;
        assert!(!handle.is_active());
        assert_eq!(handle.received(), None);
    }

    #[tokio::test]
    async fn test_install_signal_handlers() {
        let shutdown = CancellationToken::new();
        let handle = LifecycleManager::new(shutdown.clone()).install().unwrap();

        assert!(handle.is_active());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_hangup_and_pipe_are_ignored() {
        let shutdown = CancellationToken::new();
        let handle = LifecycleManager::new(shutdown.clone()).install().unwrap();
        let pid = std::process::id().to_string();

        for signal in ["-HUP", "-PIPE"] {
            let status = std::process::Command::new("kill")
                .args([signal, pid.as_str()])
                .status()
                .unwrap();
            assert!(status.success());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!shutdown.is_cancelled());
        assert!(handle.is_active());
        assert_eq!(handle.received(), None);
        assert_eq!(handle.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_drive_without_signal() {
        let shutdown = CancellationToken::new();
        let handle = LifecycleManager::new(shutdown.clone())
            .supervise(std::future::pending::<TerminationSignal>());

        let done = handle
            .drive(async { Ok::<_, io::Error>(7) }, SHUTDOWN_GRACE)
            .await
            .unwrap();
        assert_eq!(done, Some(7));

        let failed = handle
            .drive(
                async { Err::<(), _>(io::Error::new(io::ErrorKind::Other, "boom")) },
                SHUTDOWN_GRACE,
            )
            .await;
        assert_eq!(failed.unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    async fn test_drive_failure_after_signal_keeps_signal_status() {
        let shutdown = CancellationToken::new();
        let handle = LifecycleManager::new(shutdown.clone())
            .supervise(async { TerminationSignal::Interrupt });
        shutdown.cancelled().await;
        settle(&handle).await;

        let stopped = handle
            .drive(
                async { Err::<(), _>(io::Error::new(io::ErrorKind::Other, "scrape failed")) },
                SHUTDOWN_GRACE,
            )
            .await
            .unwrap();

        assert_eq!(stopped, None);
        assert_eq!(handle.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_drive_abandons_hung_relay() {
        let shutdown = CancellationToken::new();
        let handle = LifecycleManager::new(shutdown.clone())
            .supervise(async { TerminationSignal::Terminate });

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            handle.drive(
                std::future::pending::<Result<(), io::Error>>(),
                Duration::from_millis(50),
            ),
        )
        .await
        .expect("drive did not give up on the relay")
        .unwrap();

        assert_eq!(stopped, None);
        assert_eq!(handle.received(), Some(TerminationSignal::Terminate));
        assert_eq!(handle.exit_code(), 0);
    }
}
