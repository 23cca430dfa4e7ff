//! Long-running background loops that stop on cancellation.
use crate::errors::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Longest period [`Pace::Every`] honours; longer ones are clamped to it.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How a supervised body is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
  /// Run the body once per period, starting one period from now. Errors
  /// are logged and the loop keeps going.
  Every(Duration),
  /// Run the body until it returns `Ok`, waiting `delay` after each error.
  Backoff(Duration),
}

/// Drive `body` according to `pace` until `token` is cancelled.
///
/// Cancellation errors from the body are never logged as failures.
pub async fn run_until_cancelled<F, Fut>(
  token: CancellationToken,
  name: &str,
  pace: Pace,
  mut body: F,
) where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<()>>,
{
  match pace {
    Pace::Every(period) => {
      // Instant + period 不能溢出
      let period = period.min(MAX_PERIOD);
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          biased;
          _ = token.cancelled() => break,
          _ = ticker.tick() => {}
        }
        let result = tokio::select! {
          biased;
          _ = token.cancelled() => break,
          r = body() => r,
        };
        match result {
          Err(e) if e.is_canceled() => break,
          Err(e) => tracing::error!(task = name, error = %e, "task failed"),
          Ok(()) => {}
        }
      }
    }
    Pace::Backoff(delay) => loop {
      let result = tokio::select! {
        biased;
        _ = token.cancelled() => break,
        r = body() => r,
      };
      match result {
        Ok(()) => break,
        Err(e) if e.is_canceled() => break,
        Err(e) => {
          tracing::error!(task = name, error = %e, retry_in = ?delay, "task failed");
          tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
          }
        }
      }
    },
  }
  tracing::info!(task = name, "stopped");
}
