//! A generic closed/open/half-open circuit breaker (C5), reusable anywhere a
//! call path to a flaky dependency needs isolation. The token manager keeps
//! one instance per tenant; nothing here is tenant-specific.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

/// Observable state of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Returned by [`CircuitBreaker::allow`]: whether the caller may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Allowed,
    Rejected,
}

/// Tunables for the consecutive-failure trip and the volume/error-rate trip.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
    /// If set, opens when at least `volume_threshold` calls have landed in
    /// `volume_window` and the failure rate exceeds `error_threshold_percentage`.
    pub volume_threshold: Option<u32>,
    pub error_threshold_percentage: Option<f64>,
    pub volume_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 2,
            volume_threshold: None,
            error_threshold_percentage: None,
            volume_window: Duration::from_secs(60),
        }
    }
}

enum Forced {
    None,
    Open,
    Closed,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    volume_window: VecDeque<(Instant, bool)>,
    forced: Forced,
}

/// A single closed/open/half-open gate, guarding calls to one dependency.
pub struct CircuitBreaker {
    config: Config,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                half_open_inflight: 0,
                volume_window: VecDeque::new(),
                forced: Forced::None,
            }),
        }
    }

    /// Asks permission to make a call. In `HalfOpen`, only `half_open_max_calls`
    /// concurrent probes are admitted.
    pub async fn allow(&self) -> Permit {
        let mut inner = self.inner.lock().await;

        if let Forced::Open = inner.forced {
            return Permit::Rejected;
        }
        if let Forced::Closed = inner.forced {
            return Permit::Allowed;
        }

        match inner.state {
            State::Closed => Permit::Allowed,
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    info!("circuit breaker transitioning open -> half-open");
                    inner.state = State::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_inflight = 1;
                    Permit::Allowed
                } else {
                    Permit::Rejected
                }
            }
            State::HalfOpen => {
                if inner.half_open_inflight < self.config.half_open_max_calls {
                    inner.half_open_inflight += 1;
                    Permit::Allowed
                } else {
                    Permit::Rejected
                }
            }
        }
    }

    /// Reports a successful call.
    pub async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        self.record_volume(&mut inner, true);

        match inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
            }
            State::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    info!("circuit breaker transitioning half-open -> closed");
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                }
            }
            State::Open => {}
        }
    }

    /// Reports a failed call.
    pub async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        self.record_volume(&mut inner, false);

        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold || self.volume_tripped(&inner) {
                    self.trip(&mut inner);
                }
            }
            State::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                self.trip(&mut inner);
            }
            State::Open => {}
        }
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    /// Operational override: force the breaker open regardless of call outcomes.
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        inner.forced = Forced::Open;
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Operational override: force the breaker closed regardless of call outcomes.
    pub async fn force_closed(&self) {
        let mut inner = self.inner.lock().await;
        inner.forced = Forced::Closed;
        inner.state = State::Closed;
    }

    /// Clears any forced override and resets counters, returning to `Closed`.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.forced = Forced::None;
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        inner.half_open_inflight = 0;
        inner.volume_window.clear();
    }

    fn trip(&self, inner: &mut Inner) {
        warn!("circuit breaker opening");
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_successes = 0;
    }

    fn record_volume(&self, inner: &mut Inner, success: bool) {
        let now = Instant::now();
        inner.volume_window.push_back((now, success));
        let cutoff = now.checked_sub(self.config.volume_window);
        if let Some(cutoff) = cutoff {
            while matches!(inner.volume_window.front(), Some(&(t, _)) if t < cutoff) {
                inner.volume_window.pop_front();
            }
        }
    }

    fn volume_tripped(&self, inner: &Inner) -> bool {
        let (Some(volume_threshold), Some(error_pct)) =
            (self.config.volume_threshold, self.config.error_threshold_percentage)
        else {
            return false;
        };

        let total = inner.volume_window.len() as u32;
        if total < volume_threshold {
            return false;
        }
        let failures = inner.volume_window.iter().filter(|(_, success)| !success).count() as f64;
        (failures / total as f64) * 100.0 > error_pct
    }
}
