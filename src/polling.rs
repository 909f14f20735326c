//! Bounded polling for asynchronous server-side work.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
  Ready(T),
  Exhausted { attempts: u32 },
}

impl<T> PollOutcome<T> {
  pub fn ready(self) -> Option<T> {
    match self {
      PollOutcome::Ready(value) => Some(value),
      PollOutcome::Exhausted { .. } => None,
    }
  }
}

/// Call `check` until it yields a value, waiting `interval` between
/// attempts, at most `max_attempts` times.
pub async fn poll_until<T, F, Fut>(interval: Duration, max_attempts: u32, mut check: F) -> PollOutcome<T>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Option<T>>,
{
  for attempt in 1..=max_attempts {
    if let Some(value) = check(attempt).await {
      debug!(attempt, "Poll succeeded");
      return PollOutcome::Ready(value);
    }
    if attempt < max_attempts {
      tokio::time::sleep(interval).await;
    }
  }
  debug!(attempts = max_attempts, "Poll exhausted");
  PollOutcome::Exhausted {
    attempts: max_attempts,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_ready_on_third_attempt() {
    let outcome = poll_until(Duration::from_millis(1), 5, |attempt| async move {
      (attempt == 3).then_some(attempt * 10)
    })
    .await;
    assert_eq!(outcome, PollOutcome::Ready(30));
  }

  #[tokio::test]
  async fn test_exhausted() {
    let mut calls = 0;
    let outcome: PollOutcome<()> = poll_until(Duration::from_millis(1), 3, |_| {
      calls += 1;
      async { None }
    })
    .await;
    assert_eq!(outcome, PollOutcome::Exhausted { attempts: 3 });
    assert_eq!(calls, 3);
    assert!(outcome.ready().is_none());
  }

  #[tokio::test]
  async fn test_zero_attempts_never_checks() {
    let outcome: PollOutcome<u32> = poll_until(Duration::from_millis(1), 0, |_| async { Some(1) }).await;
    assert_eq!(outcome, PollOutcome::Exhausted { attempts: 0 });
  }
}
