//! Worker supervision and shutdown
//!
//! Every worker runs on one shared [`TaskTracker`] and watches one shared
//! [`CancellationToken`]. The first fatal worker error or the first interrupt
//! cancels the token; the coordinator then races three things and acts on
//! whichever happens first:
//!
//! 1. every worker has finished (graceful, exit code 0)
//! 2. the graceful deadline expires (exit code 1)
//! 3. a second interrupt arrives (exit code 2)

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::Error;

#[derive(Debug)]
pub struct WorkerFailure {
    pub worker: &'static str,
    pub error: Error,
}

/// Non-blocking path for workers to report a fatal error.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<WorkerFailure>,
}

impl ErrorReporter {
    /// Never blocks. Reports beyond the channel capacity are logged and lost;
    /// only the first one triggers shutdown anyway.
    pub fn report(&self, worker: &'static str, error: Error) {
        match self.tx.try_send(WorkerFailure { worker, error }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(failure)) => {
                warn!(worker, error = %failure.error, "Error channel full, dropping report");
            }
            Err(mpsc::error::TrySendError::Closed(failure)) => {
                debug!(worker, error = %failure.error, "Coordinator gone, dropping report");
            }
        }
    }
}

#[derive(Debug)]
pub enum ShutdownTrigger {
    Fatal(WorkerFailure),
    Interrupt,
    /// Every worker returned on its own before anything else happened.
    WorkersExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    DeadlineExceeded,
    ForcedByInterrupt,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Graceful => 0,
            ShutdownOutcome::DeadlineExceeded => 1,
            ShutdownOutcome::ForcedByInterrupt => 2,
        }
    }
}

#[derive(Debug)]
pub struct Shutdown {
    pub trigger: ShutdownTrigger,
    pub outcome: ShutdownOutcome,
}

impl Shutdown {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

pub struct Lifecycle {
    token: CancellationToken,
    tracker: TaskTracker,
    errors_tx: mpsc::Sender<WorkerFailure>,
    errors_rx: mpsc::Receiver<WorkerFailure>,
    graceful_timeout: Duration,
}

impl Lifecycle {
    pub fn new(graceful_timeout: Duration, error_capacity: usize) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(error_capacity.max(1));
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            errors_tx,
            errors_rx,
            graceful_timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn reporter(&self) -> ErrorReporter {
        ErrorReporter {
            tx: self.errors_tx.clone(),
        }
    }

    /// Run an async worker. An error or panic is reported as fatal.
    pub fn spawn<F>(&self, name: &'static str, worker: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let reporter = self.reporter();
        self.tracker.spawn(async move {
            info!(worker = name, "Worker started");
            let result = AssertUnwindSafe(worker).catch_unwind().await;
            settle(name, &reporter, result);
        });
    }

    /// Run a blocking worker on its own thread.
    pub fn spawn_blocking<F>(&self, name: &'static str, worker: F)
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        let reporter = self.reporter();
        self.tracker.spawn_blocking(move || {
            info!(worker = name, "Worker started");
            let result = panic::catch_unwind(AssertUnwindSafe(worker));
            settle(name, &reporter, result);
        });
    }

    /// Wait for a shutdown trigger, cancel every worker and wait for them
    /// within the graceful deadline.
    pub async fn run(mut self, mut interrupts: mpsc::Receiver<()>) -> Shutdown {
        self.tracker.close();

        let trigger = tokio::select! {
            biased;
            Some(failure) = self.errors_rx.recv() => ShutdownTrigger::Fatal(failure),
            Some(()) = interrupts.recv() => ShutdownTrigger::Interrupt,
            _ = self.tracker.wait() => ShutdownTrigger::WorkersExited,
        };

        match &trigger {
            ShutdownTrigger::Fatal(failure) => error!(
                worker = failure.worker,
                error = %failure.error,
                "Fatal worker error, shutting down"
            ),
            ShutdownTrigger::Interrupt => info!("Interrupt received, shutting down"),
            ShutdownTrigger::WorkersExited => warn!("All workers exited, shutting down"),
        }
        info!(
            timeout_secs = self.graceful_timeout.as_secs_f64(),
            "Waiting for workers to stop; interrupt again to force exit"
        );
        self.token.cancel();

        let outcome = tokio::select! {
            biased;
            _ = self.tracker.wait() => ShutdownOutcome::Graceful,
            Some(()) = interrupts.recv() => ShutdownOutcome::ForcedByInterrupt,
            _ = tokio::time::sleep(self.graceful_timeout) => ShutdownOutcome::DeadlineExceeded,
        };

        while let Ok(failure) = self.errors_rx.try_recv() {
            warn!(worker = failure.worker, error = %failure.error, "Additional worker error during shutdown");
        }

        match outcome {
            ShutdownOutcome::Graceful => info!("All workers stopped"),
            ShutdownOutcome::DeadlineExceeded => error!(
                still_running = self.tracker.len(),
                "Workers failed to stop within the graceful timeout"
            ),
            ShutdownOutcome::ForcedByInterrupt => error!("Second interrupt received, forcing exit"),
        }

        Shutdown { trigger, outcome }
    }
}

fn settle(name: &'static str, reporter: &ErrorReporter, result: Result<Result<(), Error>, Box<dyn Any + Send>>) {
    match result {
        Ok(Ok(())) => info!(worker = name, "Worker stopped"),
        Ok(Err(e)) => {
            error!(worker = name, error = %e, "Worker failed");
            reporter.report(name, e);
        }
        Err(_) => {
            error!(worker = name, "Worker panicked");
            reporter.report(name, Error::Panicked(name));
        }
    }
}

/// Forward SIGINT, SIGTERM and SIGQUIT into a channel of interrupt requests.
pub fn forward_os_signals() -> io::Result<mpsc::Receiver<()>> {
    let (tx, rx) = mpsc::channel(2);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => "SIGINT",
                        Err(e) => {
                            warn!(error = %e, "Failed to listen for ctrl-c");
                            return;
                        }
                    },
                    _ = terminate.recv() => "SIGTERM",
                    _ = quit.recv() => "SIGQUIT",
                };
                debug!(signal = name, "Signal received");
                if tx.send(()).await.is_err() {
                    return;
                }
            }
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });

    Ok(rx)
}
