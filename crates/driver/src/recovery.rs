//! Probe error recovery policy
//!
//! A failed probe command is answered with REQUEST SENSE and retried, up to a
//! bounded number of consecutive failures. Phase errors are never retried. A
//! failed class control request is reissued under the same bound.

use protocol::MscStatus;

/// Consecutive probe failures tolerated before giving up
pub const DEFAULT_RETRY_LIMIT: u8 = 10;

/// Bounded count of consecutive probe failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounter {
    count: u8,
    limit: u8,
}

impl Default for ErrorCounter {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_LIMIT)
    }
}

impl ErrorCounter {
    pub const fn new(limit: u8) -> Self {
        Self { count: 0, limit }
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn limit(&self) -> u8 {
        self.limit
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Record one failure; returns `true` while retries remain
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1).min(self.limit);
        self.count < self.limit
    }
}

/// What the state machine does with a probe outcome that is not `Ok`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Still in progress, retry the same state next tick
    NoChange,
    /// Fetch sense data, then resume the failed command
    RequestSense,
    Unrecovered,
}

/// Classify a non-`Ok` probe status, counting failures in `errors`
pub fn classify(status: MscStatus, errors: &mut ErrorCounter) -> Recovery {
    match status {
        MscStatus::Ok | MscStatus::Busy => Recovery::NoChange,
        MscStatus::Fail => {
            if errors.record_failure() {
                Recovery::RequestSense
            } else {
                Recovery::Unrecovered
            }
        }
        MscStatus::PhaseError => Recovery::Unrecovered,
    }
}

/// Classify a class control request that ended in `Fail`, counting it in `errors`
pub fn classify_control_failure(errors: &mut ErrorCounter) -> Recovery {
    if errors.record_failure() {
        Recovery::NoChange
    } else {
        Recovery::Unrecovered
    }
}
