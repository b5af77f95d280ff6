//! Cancellable readiness wait with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use stagehand_core::{ApplyError, CancelSignal, ProbeReport};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

/// Poll interval schedule. `STAGEHAND_PROBE_INITIAL_MS` / `STAGEHAND_PROBE_MAX_MS` override the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(10) }
    }
}

impl Backoff {
    pub fn from_env() -> Self {
        let ms = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis);
        let d = Self::default();
        let initial = ms("STAGEHAND_PROBE_INITIAL_MS").unwrap_or(d.initial);
        let max = ms("STAGEHAND_PROBE_MAX_MS").unwrap_or(d.max).max(initial);
        Self { initial, max }
    }

    pub fn next(&self, cur: Duration) -> Duration {
        cur.saturating_mul(2).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("not ready after {waited:?}; last observed: {last_observed}")]
    Timeout { waited: Duration, last_observed: String },
    #[error("readiness wait cancelled")]
    Cancelled,
}

/// Call `probe` until it reports ready, the deadline passes or `cancel` fires.
///
/// Probe errors are treated as transient and retried. Every observation is
/// handed to `on_report` so the caller can record it. The deadline is absolute:
/// the last sleep is cut short and a probe still in flight at the deadline is dropped.
pub async fn wait_ready<F, Fut>(
    mut probe: F,
    timeout: Duration,
    backoff: &Backoff,
    cancel: &mut CancelSignal,
    mut on_report: impl FnMut(&ProbeReport),
) -> Result<ProbeReport, ProbeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ProbeReport, ApplyError>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut delay = backoff.initial;
    let mut last_observed = String::from("not observed yet");

    loop {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            r = timeout_at(deadline, probe()) => r,
        };
        counter!("probe_attempts", 1u64);
        let report = match outcome {
            Err(_) => break,
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                warn!(error = %e, "probe failed; retrying");
                ProbeReport::not_ready(format!("probe error: {}", e))
            }
        };
        on_report(&report);
        if report.ready {
            counter!("probe_ready", 1u64);
            return Ok(report);
        }
        last_observed = report.detail;

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wake = (now + delay).min(deadline);
        debug!(delay_ms = (wake - now).as_millis() as u64, "not ready; backing off");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            _ = sleep_until(wake) => {}
        }
        delay = backoff.next(delay);
    }
    counter!("probe_timeouts", 1u64);
    Err(ProbeError::Timeout { waited: start.elapsed(), last_observed })
}
