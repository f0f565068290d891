//! Bounded polling shared by the provider backends and the orchestrator.
//!
//! A probe is called immediately, then once per `poll_interval` until it
//! yields a value, the deadline passes, the attempt budget runs out or the
//! cancellation token fires. The task sleeps between probes; it never spins.
//!
//! Probes that can fail transiently (connection refused while a service
//! starts, eventual-consistency 404s) should map those failures to "not yet"
//! themselves and only return `Err` for conditions that retrying cannot fix.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    /// Wall-clock deadline. `None` for attempt-counted policies.
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout: Some(timeout),
            max_attempts: None,
        }
    }

    /// `attempts` probes spaced `delay` apart. Time spent inside a probe does
    /// not use up the budget; probes bound their own duration.
    pub fn attempts(attempts: u32, delay: Duration) -> Self {
        let attempts = attempts.max(1);
        Self {
            poll_interval: delay,
            timeout: None,
            max_attempts: Some(attempts),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("condition not met after {attempts} attempts ({elapsed:?})")]
    Timeout { elapsed: Duration, attempts: u32 },
    #[error("wait cancelled")]
    Cancelled,
    #[error("{0}")]
    Predicate(E),
}

impl<E> WaitError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout { .. })
    }
}

/// Poll `probe` until it returns `Some(value)`.
pub async fn wait_for<T, E, F, Fut>(
    policy: WaitPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = policy.timeout.map(|t| started + t);
    let mut attempts: u32 = 0;
    let timed_out = |attempts: u32| WaitError::Timeout {
        elapsed: started.elapsed(),
        attempts,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        attempts += 1;

        let outcome = match deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                outcome = tokio::time::timeout_at(deadline, probe()) => outcome.ok(),
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                outcome = probe() => Some(outcome),
            },
        };

        match outcome {
            Some(Ok(Some(value))) => return Ok(value),
            Some(Ok(None)) => {}
            Some(Err(e)) => return Err(WaitError::Predicate(e)),
            // The probe itself outlived the deadline.
            None => return Err(timed_out(attempts)),
        }

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(timed_out(attempts));
        }

        let mut pause = policy.poll_interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(attempts));
            }
            pause = pause.min(deadline - now);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Poll a boolean predicate until it is true.
pub async fn wait_until<E, F, Fut>(
    policy: WaitPolicy,
    cancel: &CancellationToken,
    mut predicate: F,
) -> Result<(), WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    wait_for(policy, cancel, || {
        let fut = predicate();
        async move { fut.await.map(|ready| ready.then_some(())) }
    })
    .await
}
