//! Retry/backoff as an explicit state machine
//!
//! ```text
//! Attempting(n) --ok--------------------------> Succeeded(n)
//! Attempting(n) --retryable, n < max---------> Backoff(n, delay) --resume--> Attempting(n+1)
//! Attempting(n) --retryable, n == max--------> Exhausted(n)
//! Attempting(n) --fatal----------------------> Exhausted(n)
//! ```
//!
//! The machine never sleeps itself. [`drive`] does the sleeping, so a caller
//! wrapping it in a timeout or a `select!` drops it cleanly in any state.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Longest server retry hint honored; larger hints are clamped to this
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(300);

/// Backoff parameters shared by enumeration, fetching and sink writes
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Equal jitter: the delay is drawn from `[d/2, d]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the given (1-based) failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);

        let secs = if self.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(capped / 2.0..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    Succeeded { attempts: u32 },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Exhausted { .. } | RetryState::Succeeded { .. }
        )
    }
}

/// Transition table over [`RetryState`]
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting { attempt: 1 },
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Number of the attempt in progress or last made
    pub fn attempt(&self) -> u32 {
        match self.state {
            RetryState::Attempting { attempt } | RetryState::Backoff { attempt, .. } => attempt,
            RetryState::Exhausted { attempts } | RetryState::Succeeded { attempts } => attempts,
        }
    }

    /// The current attempt failed with something worth retrying.
    ///
    /// A server-supplied `hint` is a floor on the computed delay, clamped to
    /// [`MAX_RETRY_HINT`].
    pub fn fail_retryable(&mut self, hint: Option<Duration>) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = if attempt >= self.policy.max_attempts {
                RetryState::Exhausted { attempts: attempt }
            } else {
                let computed = self.policy.backoff_for(attempt);
                let delay = hint.map_or(computed, |h| h.min(MAX_RETRY_HINT).max(computed));
                RetryState::Backoff { attempt, delay }
            };
        }
        self.state
    }

    /// The current attempt failed in a way retrying cannot fix
    pub fn fail_fatal(&mut self) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = RetryState::Exhausted { attempts: attempt };
        }
        self.state
    }

    /// Leave `Backoff` once the delay has elapsed
    pub fn resume(&mut self) -> RetryState {
        if let RetryState::Backoff { attempt, .. } = self.state {
            self.state = RetryState::Attempting {
                attempt: attempt + 1,
            };
        }
        self.state
    }

    pub fn succeed(&mut self) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = RetryState::Succeeded { attempts: attempt };
        }
        self.state
    }
}

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { hint: Option<Duration> },
    Fatal,
}

/// Last error seen when [`drive`] gave up
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Run `op` under `policy` until it succeeds or the machine is exhausted.
///
/// `op` receives the 1-based attempt number.
pub async fn drive<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    classify: C,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Disposition,
{
    let mut machine = RetryMachine::new(policy.clone());

    loop {
        let attempt = machine.attempt();
        match op(attempt).await {
            Ok(value) => {
                machine.succeed();
                return Ok(value);
            }
            Err(error) => {
                let next = match classify(&error) {
                    Disposition::Retry { hint } => machine.fail_retryable(hint),
                    Disposition::Fatal => machine.fail_fatal(),
                };
                match next {
                    RetryState::Backoff { attempt, delay } => {
                        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                        tokio::time::sleep(delay).await;
                        machine.resume();
                    }
                    _ => {
                        return Err(Exhausted {
                            error,
                            attempts: attempt,
                        })
                    }
                }
            }
        }
    }
}
