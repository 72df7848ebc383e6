//! Retry-with-backoff policy shared by the settings and query protocols

use crate::storage::error::{StorageError, StorageResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Same delay every time
    Fixed(Duration),
    /// `attempt × unit`
    Linear(Duration),
}

impl Backoff {
    /// Delay after the given 1-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => *d,
            Backoff::Linear(unit) => unit.saturating_mul(attempt.max(1)),
        }
    }
}

/// Verdict of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished successfully
    Done(T),
    /// Try again after the policy's backoff
    Retry(StorageError),
    /// Try again straight away (the attempt already waited)
    RetryNow(StorageError),
    /// Give up with this error
    Fail(StorageError),
}

/// Bounded retry loop with a backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Sleep for the backoff of `attempt`, waking early on cancellation
    pub async fn pause(&self, attempt: u32, cancel: &Cancellation) -> StorageResult<()> {
        sleep_or_cancel(self.backoff.delay(attempt), cancel).await
    }

    /// Drive `op` until it is done, fails, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Cancellation is honored
    /// before every attempt and during backoff. Exhaustion yields
    /// [`StorageError::RetriesExhausted`] carrying the last error.
    pub async fn run<T, Op, Fut>(
        &self,
        operation: &str,
        cancel: &Cancellation,
        mut op: Op,
    ) -> StorageResult<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut last_error: Option<StorageError> = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let (error, wait) = match op(attempt).await {
                Attempt::Done(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Attempt::Fail(error) => return Err(error),
                Attempt::Retry(error) => (error, true),
                Attempt::RetryNow(error) => (error, false),
            };

            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                error = %error,
                "Attempt failed"
            );

            if attempt < self.max_attempts && wait {
                self.pause(attempt, cancel).await?;
            }
            last_error = Some(error);
        }

        Err(StorageError::RetriesExhausted {
            attempts: self.max_attempts,
            last: Box::new(last_error.unwrap_or(StorageError::Cancelled)),
        })
    }
}

/// Caller-side cancellation for long-running storage calls
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

/// Trigger paired with a [`Cancellation`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Cancellation {
    /// A token and the handle that trips it
    pub fn new() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancellation { rx: Some(rx) })
    }

    /// A token that is never cancelled
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancelled; never resolves for [`Cancellation::never`]
    /// or when the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Sleep unless cancelled first
pub async fn sleep_or_cancel(delay: Duration, cancel: &Cancellation) -> StorageResult<()> {
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
    }
}
