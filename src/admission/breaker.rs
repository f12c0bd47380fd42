//! Error-ratio circuit breaker of one admission scope
//!
//! While closed, finished requests are tallied over a monitoring window. When enough of
//! them failed the breaker opens and the scope turns every request away for the break
//! duration. After that a single trial request is let through (half-open): a successful trial
//! closes the breaker, a failed one starts another break.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::config::BreakerPolicy;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

// tally layout: window start (32 bits) | requests (16 bits) | failures (16 bits)
const COUNT_MAX: u64 = 0xFFFF;

fn pack(start: u64, requests: u64, failures: u64) -> u64 {
    ((start & 0xFFFF_FFFF) << 32) | (requests.min(COUNT_MAX) << 16) | failures.min(COUNT_MAX)
}

fn unpack(tally: u64) -> (u64, u64, u64) {
    (tally >> 32, (tally >> 16) & COUNT_MAX, tally & COUNT_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Decision {
    Allow,
    /// Allowed as the single recovery trial of a half-open breaker
    Trial,
    Reject,
}

pub(super) struct Breaker {
    enabled: AtomicBool,
    error_ratio_percent: AtomicU64,
    min_requests: AtomicU64,
    monitor_secs: AtomicU64,
    break_secs: AtomicU64,
    state: AtomicU8,
    opened_at: AtomicU64,
    tally: AtomicU64,
}

impl Breaker {
    pub(super) fn new(policy: Option<BreakerPolicy>) -> Self {
        let breaker = Self {
            enabled: AtomicBool::new(false),
            error_ratio_percent: AtomicU64::new(0),
            min_requests: AtomicU64::new(0),
            monitor_secs: AtomicU64::new(0),
            break_secs: AtomicU64::new(0),
            state: AtomicU8::new(CLOSED),
            opened_at: AtomicU64::new(0),
            tally: AtomicU64::new(0),
        };
        breaker.set_policy(policy);
        breaker
    }

    /// Swap the thresholds in place. Removing the policy also closes the breaker.
    pub(super) fn set_policy(&self, policy: Option<BreakerPolicy>) {
        match policy {
            Some(policy) => {
                self.error_ratio_percent
                    .store(policy.error_ratio_percent.clamp(1, 100), Ordering::Release);
                self.min_requests
                    .store(policy.min_requests.clamp(1, COUNT_MAX), Ordering::Release);
                self.monitor_secs
                    .store(policy.monitor_secs.max(1), Ordering::Release);
                self.break_secs.store(policy.break_secs.max(1), Ordering::Release);
                self.enabled.store(true, Ordering::Release);
            }
            None => {
                self.enabled.store(false, Ordering::Release);
                self.tally.store(0, Ordering::Release);
                self.state.store(CLOSED, Ordering::Release);
            }
        }
    }

    pub(super) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(super) fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            OPEN => "open",
            HALF_OPEN => "half_open",
            _ => "closed",
        }
    }

    pub(super) fn decide(&self, now: u64) -> Decision {
        if !self.is_enabled() {
            return Decision::Allow;
        }
        match self.state.load(Ordering::Acquire) {
            CLOSED => Decision::Allow,
            OPEN => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                let elapsed = now.saturating_sub(opened_at);
                if elapsed >= self.break_secs.load(Ordering::Acquire)
                    && self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    Decision::Trial
                } else {
                    Decision::Reject
                }
            }
            _ => Decision::Reject,
        }
    }

    /// Tally one finished request. Returns true when this outcome opened the breaker.
    pub(super) fn record(&self, now: u64, success: bool) -> bool {
        if !self.is_enabled() || self.state.load(Ordering::Acquire) != CLOSED {
            return false;
        }

        let monitor = self.monitor_secs.load(Ordering::Acquire);
        let next = |tally: u64| {
            let (start, requests, failures) = unpack(tally);
            let (start, requests, failures) = if (now & 0xFFFF_FFFF).saturating_sub(start) >= monitor
            {
                (now, 0, 0)
            } else {
                (start, requests, failures)
            };
            if requests == COUNT_MAX {
                return pack(start, requests, failures);
            }
            pack(start, requests + 1, failures + u64::from(!success))
        };
        let Ok(previous) = self
            .tally
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(next(t)))
        else {
            return false;
        };

        let (_, requests, failures) = unpack(next(previous));
        let min_requests = self.min_requests.load(Ordering::Acquire);
        let ratio = self.error_ratio_percent.load(Ordering::Acquire);
        if requests < min_requests || failures * 100 < ratio * requests {
            return false;
        }

        self.opened_at.store(now, Ordering::Release);
        self.state
            .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Settle the trial let through by [`Decision::Trial`].
    ///
    /// `None` means the trial never reached a verdict (rejected further on, or abandoned);
    /// the breaker goes back to open without a new break, so the next request becomes the trial.
    pub(super) fn finish_trial(&self, now: u64, outcome: Option<bool>) {
        match outcome {
            Some(true) => {
                self.tally.store(pack(now, 0, 0), Ordering::Release);
                let _ = self.state.compare_exchange(
                    HALF_OPEN,
                    CLOSED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            Some(false) => {
                self.opened_at.store(now, Ordering::Release);
                let _ =
                    self.state
                        .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire);
            }
            None => {
                let _ =
                    self.state
                        .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }
}
