//! Bounded polling of cluster state.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::conditions::{Predicate, Verdict};
use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline, poll interval and cancellation for one wait
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
    pub cancel: CancellationToken,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }
}

impl WaitOptions {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of one probe
enum Attempt<T> {
    Done(T),
    Pending(String),
}

/// Poll `probe` until it reports [`Verdict::Met`].
///
/// Transient errors are retried, terminal errors end the wait immediately.
pub async fn until<F, Fut>(what: &str, options: &WaitOptions, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Verdict>>,
{
    poll(what, options, || {
        let attempt = probe();
        async move {
            Ok(match attempt.await? {
                Verdict::Met => Attempt::Done(()),
                Verdict::NotYet(observation) => Attempt::Pending(observation),
            })
        }
    })
    .await
}

/// Fetch an object on every tick and evaluate `predicate` on it.
///
/// Returns the object that satisfied the predicate.
pub async fn for_object<T, F, Fut, P>(
    what: &str,
    options: &WaitOptions,
    mut fetch: F,
    predicate: &P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Predicate<T> + ?Sized,
{
    poll(what, options, || {
        let fetched = fetch();
        async move {
            let obj = fetched.await?;
            Ok(match predicate.check(&obj)? {
                Verdict::Met => Attempt::Done(obj),
                Verdict::NotYet(observation) => Attempt::Pending(observation),
            })
        }
    })
    .await
}

async fn poll<T, F, Fut>(what: &str, options: &WaitOptions, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let start = Instant::now();
    let deadline = start + options.timeout;
    let mut last_observation = String::from("no observation yet");
    debug!("Waiting up to {:?} for {}", options.timeout, what);

    let timed_out = |last_observation: String| Error::Timeout {
        what: what.to_string(),
        elapsed: start.elapsed(),
        last_observation,
    };

    loop {
        if options.cancel.is_cancelled() {
            return Err(Error::cancelled(format!("waiting for {what}")));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(last_observation));
        }

        // a slow API call must not stretch the wait past its deadline
        let attempt = tokio::select! {
            _ = options.cancel.cancelled() => {
                return Err(Error::cancelled(format!("waiting for {what}")));
            }
            attempt = tokio::time::timeout(remaining, probe()) => attempt,
        };

        match attempt {
            Ok(Ok(Attempt::Done(value))) => {
                debug!("{} satisfied after {:?}", what, start.elapsed());
                return Ok(value);
            }
            Ok(Ok(Attempt::Pending(observation))) => {
                trace!("{}: {}", what, observation);
                last_observation = observation;
            }
            Ok(Err(e)) if e.is_transient() => {
                debug!("{}: transient error, retrying: {}", what, e);
                last_observation = e.to_string();
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                last_observation = format!("probe still running at deadline ({last_observation})");
                return Err(timed_out(last_observation));
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(last_observation));
        }
        tokio::select! {
            _ = options.cancel.cancelled() => {
                return Err(Error::cancelled(format!("waiting for {what}")));
            }
            _ = tokio::time::sleep(options.interval.min(remaining)) => {}
        }
    }
}
