//! Uplink reconnection state machine.
//!
//! The machine decides what the uplink loop does next; it never sleeps or
//! touches the radio, so every transition is testable without a clock.
//!
//! # Algorithm
//!
//! 1. No SSID configured → report down, wait, check again
//! 2. Associated → report up once on the edge, then hold
//! 3. Not associated → attempt association
//! 4. Failed attempt → count it; at `max_retries` the uplink is exhausted
//! 5. Credential update → back to `Idle` with a clean failure count
//!
//! # Example
//!
//! ```
//! use sensor_link::config::ExhaustionPolicy;
//! use sensor_link::uplink::{Action, FailureOutcome, UplinkMachine, UplinkState};
//!
//! let mut machine = UplinkMachine::new(3, ExhaustionPolicy::Stop);
//! assert_eq!(machine.next_action(true, false), Action::Attempt { link_lost: false });
//! assert_eq!(machine.attempt_failed(), FailureOutcome::Retry);
//! assert_eq!(machine.state(), UplinkState::Idle);
//! ```

use crate::config::ExhaustionPolicy;
use std::fmt;
use std::time::Duration;

/// Association state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    /// Not associated, no attempt in progress.
    Idle,
    /// Association attempt in progress.
    Connecting,
    /// Associated.
    Connected,
    /// Too many consecutive failures.
    Exhausted,
}

impl fmt::Display for UplinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// What the loop should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the uplink loop must act on every decision"]
pub enum Action {
    /// No SSID: report the uplink down and wait.
    Unconfigured,
    /// Association just observed: report the uplink up, then wait.
    ReportUp,
    /// Still associated, already reported: wait.
    Hold,
    /// Start an association attempt. `link_lost` is set when an established
    /// association disappeared since the last cycle.
    Attempt { link_lost: bool },
    /// Exhausted: do not touch the radio.
    Halt,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Below the retry limit; try again next cycle.
    Retry,
    /// Retry limit reached and the policy is to stop for good.
    Exhausted,
    /// Retry limit reached; wait this long, then [`UplinkMachine::recover`].
    BackOff(Duration),
}

/// Reconnection bookkeeping for one uplink.
#[derive(Debug, Clone)]
pub struct UplinkMachine {
    state: UplinkState,
    failure_count: u32,
    max_retries: u32,
    policy: ExhaustionPolicy,
    /// Bumped on every credential update so stale attempts can be detected.
    generation: u64,
}

impl UplinkMachine {
    pub fn new(max_retries: u32, policy: ExhaustionPolicy) -> Self {
        Self {
            state: UplinkState::Idle,
            failure_count: 0,
            max_retries,
            policy,
            generation: 0,
        }
    }

    pub fn state(&self) -> UplinkState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Decide the next step from what the radio reports.
    pub fn next_action(&mut self, configured: bool, associated: bool) -> Action {
        if self.state == UplinkState::Exhausted {
            return Action::Halt;
        }
        if !configured {
            self.state = UplinkState::Idle;
            return Action::Unconfigured;
        }
        if associated {
            if self.state == UplinkState::Connected {
                return Action::Hold;
            }
            self.state = UplinkState::Connected;
            self.failure_count = 0;
            return Action::ReportUp;
        }

        let link_lost = self.state == UplinkState::Connected;
        self.state = UplinkState::Connecting;
        Action::Attempt { link_lost }
    }

    /// Record a successful association.
    pub fn attempt_succeeded(&mut self) {
        self.state = UplinkState::Connected;
        self.failure_count = 0;
    }

    /// Record a failed association (timeout or radio error).
    pub fn attempt_failed(&mut self) -> FailureOutcome {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count < self.max_retries {
            self.state = UplinkState::Idle;
            return FailureOutcome::Retry;
        }

        self.state = UplinkState::Exhausted;
        match self.policy {
            ExhaustionPolicy::Stop => FailureOutcome::Exhausted,
            ExhaustionPolicy::Backoff(wait) => FailureOutcome::BackOff(wait),
        }
    }

    /// Leave `Exhausted` after a backoff.
    pub fn recover(&mut self) {
        if self.state == UplinkState::Exhausted {
            self.state = UplinkState::Idle;
            self.failure_count = 0;
        }
    }

    /// New credentials: forget failures and start over from `Idle`.
    ///
    /// This also lifts `Exhausted`, so a loop that is still running (backoff
    /// policy) resumes immediately.
    pub fn reset(&mut self) {
        self.state = UplinkState::Idle;
        self.failure_count = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}
