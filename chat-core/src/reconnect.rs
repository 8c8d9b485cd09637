//! Reconnection scheduling.
//!
//! The scheduler decides whether another automatic attempt is allowed and
//! how long to wait for it. It never sleeps itself: chat-client arms a timer
//! for each [`ReconnectionAttempt`] and hands it back through
//! [`ReconnectScheduler::fire`], which rejects attempts that were cancelled
//! or belong to an older session epoch.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::state::SessionEpoch;

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    /// Nothing scheduled.
    Idle,
    /// A timer is armed for the next attempt.
    Scheduled,
    /// An attempt is running.
    Attempting,
    /// Attempt cap reached; nothing further until forced or reset.
    Exhausted,
}

/// One scheduled attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionAttempt {
    /// 1-based attempt number within the current outage.
    pub attempt_number: u32,
    /// Delay the timer should wait.
    pub scheduled_delay: Duration,
    /// Epoch the attempt was scheduled under.
    pub session_epoch: SessionEpoch,
    ticket: u64,
}

/// Outcome of a scheduling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// A new attempt was scheduled.
    Scheduled(ReconnectionAttempt),
    /// An attempt is already scheduled; nothing changed.
    AlreadyScheduled,
    /// The attempt cap is reached.
    Exhausted {
        /// Attempts made in this outage.
        attempts: u32,
    },
}

/// Bounded retry scheduler.
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    policy: BackoffPolicy,
    phase: ReconnectPhase,
    attempts: u32,
    next_ticket: u64,
    armed: Option<u64>,
}

impl ReconnectScheduler {
    /// Create an idle scheduler.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            phase: ReconnectPhase::Idle,
            attempts: 0,
            next_ticket: 0,
            armed: None,
        }
    }

    /// Schedule the next attempt using the given jitter factor.
    pub fn schedule(&mut self, epoch: SessionEpoch, jitter: f64) -> Schedule {
        match self.phase {
            ReconnectPhase::Scheduled => return Schedule::AlreadyScheduled,
            ReconnectPhase::Exhausted => {
                return Schedule::Exhausted {
                    attempts: self.attempts,
                }
            }
            ReconnectPhase::Idle | ReconnectPhase::Attempting => {}
        }

        if !self.has_retries_left() {
            self.phase = ReconnectPhase::Exhausted;
            self.armed = None;
            return Schedule::Exhausted {
                attempts: self.attempts,
            };
        }

        self.attempts += 1;
        self.next_ticket += 1;
        self.armed = Some(self.next_ticket);
        self.phase = ReconnectPhase::Scheduled;

        Schedule::Scheduled(ReconnectionAttempt {
            attempt_number: self.attempts,
            scheduled_delay: self.policy.delay_for_attempt(self.attempts, jitter),
            session_epoch: epoch,
            ticket: self.next_ticket,
        })
    }

    /// Claim a fired timer.
    ///
    /// Returns true only for the currently armed attempt and only while the
    /// session is still at the epoch it was scheduled under.
    pub fn fire(&mut self, attempt: &ReconnectionAttempt, current: SessionEpoch) -> bool {
        let valid = self.phase == ReconnectPhase::Scheduled
            && self.armed == Some(attempt.ticket)
            && attempt.session_epoch == current;
        if valid {
            self.phase = ReconnectPhase::Attempting;
            self.armed = None;
        }
        valid
    }

    /// Cancel a scheduled attempt. The attempt counter is kept.
    pub fn cancel(&mut self) {
        self.armed = None;
        if matches!(
            self.phase,
            ReconnectPhase::Scheduled | ReconnectPhase::Attempting
        ) {
            self.phase = ReconnectPhase::Idle;
        }
    }

    /// Cancel any scheduled attempt and mark an immediate attempt as running.
    ///
    /// An exhausted counter is cleared so a user-initiated retry is never
    /// blocked by earlier automatic failures.
    pub fn force(&mut self) {
        self.armed = None;
        if self.phase == ReconnectPhase::Exhausted {
            self.attempts = 0;
        }
        self.phase = ReconnectPhase::Attempting;
    }

    /// Zero the attempt counter and return to idle.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.armed = None;
        self.phase = ReconnectPhase::Idle;
    }

    /// Whether another automatic attempt is allowed.
    pub fn has_retries_left(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    /// Attempts made in the current outage.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt cap.
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Current phase.
    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Backoff policy in use.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
