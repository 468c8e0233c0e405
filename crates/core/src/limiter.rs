//! Token-bucket rate limiter with a sliding-window burst guard.
//!
//! Every admission has to pass two independent rules:
//! - the token clock: admissions are spaced `1s / rate` apart on average,
//! - the burst window: at most `max_burst` admissions in any `burst_window`.
//!
//! Both rules are re-checked after every wait since either clock may have
//! moved while the caller slept.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Cancelled, ConfigError};

pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_millis(100);

/// A limiter that fell further behind than this restarts its token clock
/// from `now` instead of granting the backlog.
const MAX_LAG: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateBudget {
    rate_per_second: u32,
    token_interval: Duration,
    burst_window: Duration,
    max_burst: usize,
}

impl RateBudget {
    pub fn new(rate_per_second: u32, burst_window: Duration) -> Result<Self, ConfigError> {
        if rate_per_second == 0 {
            return Err(ConfigError::NonPositiveRate {
                name: "rate",
                value: 0,
            });
        }
        if burst_window.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "burst window",
                value: burst_window,
            });
        }
        let token_interval = Duration::from_secs(1) / rate_per_second;
        // rate * 2 * window, in integer nanos to keep 10/s over 100ms at exactly 2
        let max_burst =
            (rate_per_second as u128 * 2 * burst_window.as_nanos()) / 1_000_000_000;
        Ok(Self {
            rate_per_second,
            token_interval,
            burst_window,
            max_burst: (max_burst as usize).max(1),
        })
    }

    pub fn rate_per_second(&self) -> u32 {
        self.rate_per_second
    }

    pub fn token_interval(&self) -> Duration {
        self.token_interval
    }

    pub fn burst_window(&self) -> Duration {
        self.burst_window
    }

    pub fn max_burst(&self) -> usize {
        self.max_burst
    }
}

#[derive(Debug)]
struct PermissionState {
    next_token_at: Instant,
    /// Admission times inside the current burst window, oldest first.
    window: VecDeque<Instant>,
}

impl PermissionState {
    fn prune(&mut self, now: Instant, burst_window: Duration) {
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(*oldest) >= burst_window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

enum Admission {
    Granted,
    WaitUntil(Instant),
}

#[derive(Debug)]
pub struct RateLimiter {
    budget: RateBudget,
    state: Mutex<PermissionState>,
    issued: AtomicU64,
}

impl RateLimiter {
    pub fn new(budget: RateBudget) -> Self {
        Self {
            budget,
            state: Mutex::new(PermissionState {
                next_token_at: Instant::now(),
                window: VecDeque::with_capacity(budget.max_burst),
            }),
            issued: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    /// Number of permissions granted so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Waits until a permission is granted or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            match self.try_admit(Instant::now()) {
                Admission::Granted => return Ok(()),
                Admission::WaitUntil(deadline) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Cancelled),
                        _ = sleep_until(deadline) => {}
                    }
                }
            }
        }
    }

    /// Grants a permission only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        matches!(self.try_admit(Instant::now()), Admission::Granted)
    }

    fn try_admit(&self, now: Instant) -> Admission {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.prune(now, self.budget.burst_window);

        if state.window.len() >= self.budget.max_burst {
            if let Some(oldest) = state.window.front() {
                let wait_until = *oldest + self.budget.burst_window;
                trace!(
                    in_window = state.window.len(),
                    max_burst = self.budget.max_burst,
                    "burst cap reached"
                );
                return Admission::WaitUntil(wait_until);
            }
        }

        if now < state.next_token_at {
            return Admission::WaitUntil(state.next_token_at);
        }

        state.window.push_back(now);
        let lag = now.saturating_duration_since(state.next_token_at);
        state.next_token_at = if lag > MAX_LAG {
            trace!(lag_ms = lag.as_millis() as u64, "token clock snapped forward");
            now + self.budget.token_interval
        } else {
            state.next_token_at + self.budget.token_interval
        };
        self.issued.fetch_add(1, Ordering::Relaxed);
        Admission::Granted
    }
}
