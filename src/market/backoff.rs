use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    pub current_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn initial_state(&self) -> BackoffState {
        BackoffState {
            current_delay: self.base,
            max_delay: self.max,
        }
    }

    /// Delay before the first attempt after activation.
    pub fn first_delay(&self) -> Duration {
        Duration::ZERO
    }

    pub fn next_delay(&self, state: BackoffState, succeeded: bool) -> (BackoffState, Duration) {
        let current_delay = if succeeded {
            self.base
        } else {
            state
                .current_delay
                .max(self.base)
                .saturating_mul(2)
                .min(state.max_delay)
        };

        let next = BackoffState {
            current_delay,
            max_delay: state.max_delay,
        };
        (next, current_delay)
    }
}

/// Cooperative retry loop: wait, attempt, compute the next wait, repeat.
///
/// The first attempt fires immediately. `attempt` returns `Continue(succeeded)` to keep
/// polling or `Break(())` to finish. Cancellation is observed before every sleep and
/// again after waking, so a cancel lands within one sleep quantum.
pub async fn run_poll_loop<F, Fut>(
    policy: BackoffPolicy,
    cancel_token: &CancellationToken,
    mut attempt: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<(), bool>>,
{
    let mut state = policy.initial_state();
    let mut delay = policy.first_delay();

    loop {
        if cancel_token.is_cancelled() {
            return;
        }

        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "poll loop sleeping");
            tokio::select! {
                _ = cancel_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if cancel_token.is_cancelled() {
            return;
        }

        match attempt().await {
            ControlFlow::Break(()) => return,
            ControlFlow::Continue(succeeded) => {
                let (next_state, next_delay) = policy.next_delay(state, succeeded);
                state = next_state;
                delay = next_delay;
            }
        }
    }
}
