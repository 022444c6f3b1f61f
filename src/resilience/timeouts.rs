//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap downstream calls with a deadline
//! - Cancel the call cleanly when the deadline passes
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; dropping the future cancels the call
//! - Timeout errors are distinct from other errors
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::dispatch::ForwardError;

/// Time budget of one inbound request, stamped when it enters the router.
#[derive(Debug, Clone, Copy)]
pub struct InboundBudget {
    started: Instant,
    budget: Duration,
}

impl InboundBudget {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// What is left of the budget, zero once it is spent.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }
}

/// Run `call` with `deadline`, mapping expiry to [`ForwardError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, ForwardError>
where
    F: Future<Output = Result<T, ForwardError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(ForwardError::Timeout(deadline.as_millis() as u64)),
    }
}

/// Pick the tighter of the route deadline and what remains of the inbound one.
pub fn effective_deadline(route: Duration, inbound_remaining: Option<Duration>) -> Duration {
    match inbound_remaining {
        Some(remaining) => route.min(remaining),
        None => route,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_is_a_timeout() {
        let result: Result<(), _> = with_deadline(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(ForwardError::Timeout(50)));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok::<_, ForwardError>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn inbound_deadline_can_shorten_route_deadline() {
        let route = Duration::from_millis(500);
        assert_eq!(effective_deadline(route, None), route);
        assert_eq!(effective_deadline(route, Some(Duration::from_millis(80))), Duration::from_millis(80));
        assert_eq!(effective_deadline(route, Some(Duration::from_secs(3))), route);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_budget_shrinks_with_elapsed_time() {
        let budget = InboundBudget::start(Duration::from_secs(1));
        assert_eq!(budget.remaining(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(budget.remaining(), Duration::from_millis(600));
        assert_eq!(
            effective_deadline(Duration::from_secs(3), Some(budget.remaining())),
            Duration::from_millis(600)
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(budget.remaining(), Duration::ZERO);
    }
}
