//! Exponential backoff with jitter (§5 "Cancellation and timeouts").
//!
//! A reusable helper around a fixed-sleep retry pattern: an initial
//! wait that doubles each attempt up to a configured maximum, jittered
//! to `[wait/2, wait]`, retried up to `retry_count_limit` times.

use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;

use crate::config::Config;

/// Computes the raw (pre-jitter) wait for retry attempt `attempt` (1-based):
/// `initial * 2^(attempt-1)`, capped at `max_wait`.
pub fn backoff_wait(initial: Duration, max_wait: Duration, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(32);
    let scaled = initial.as_secs_f64() * 2f64.powi(doublings as i32);
    Duration::from_secs_f64(scaled.min(max_wait.as_secs_f64()))
}

/// Jitters `wait` to a uniformly random duration in `[wait/2, wait]`, per
/// §5's "wait times are jittered (sleep between w/2 and w)".
pub fn jitter(wait: Duration) -> Duration {
    if wait.is_zero() {
        return wait;
    }
    let half = wait.as_secs_f64() / 2.0;
    let full = wait.as_secs_f64();
    let sampled = rand::thread_rng().gen_range(half..=full);
    Duration::from_secs_f64(sampled)
}

/// Retries `op` up to `config.retry_count_limit` times (so
/// `retry_count_limit + 1` total attempts), sleeping a jittered exponential
/// backoff between attempts. Returns the last error if every attempt fails.
pub async fn with_retry<T, E, F, Fut>(config: &Config, op_name: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let initial = Duration::from_secs(config.wait_time_seconds);
    let max_wait = Duration::from_secs(config.max_wait_time_seconds);

    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt > config.retry_count_limit {
                    warn!("{op_name}: giving up after {attempt} attempts: {e}");
                    return Err(e);
                }
                let wait = jitter(backoff_wait(initial, max_wait, attempt));
                warn!(
                    "{op_name}: attempt {attempt} failed ({e}), retrying in {:.1}s",
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

/// Post-close HEAD retry (§7: separate fixed-delay window distinct from the
/// exponential backoff, to smooth over read-after-write visibility lag).
pub async fn with_head_retry<T, E, F, Fut>(mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    use crate::config::{POST_CLOSE_HEAD_RETRY_COUNT, POST_CLOSE_HEAD_RETRY_DELAY};

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= POST_CLOSE_HEAD_RETRY_COUNT {
                    return Err(e);
                }
                warn!("post-close HEAD attempt {attempt} failed ({e}), retrying");
                tokio::time::sleep(POST_CLOSE_HEAD_RETRY_DELAY).await;
            }
        }
    }
}
