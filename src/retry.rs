//! Retry budget for terminal liveness failures.
//!
//! A flow gets `limit` retries. The coordinator increments the attempt count
//! on every terminal failure and aborts once the count exceeds the limit, so
//! with the default limit of 1 the first failure retries and the second ends
//! the flow. Each flow controller owns its own coordinator.

use crate::{FlowKind, ResultCode};

pub const DEFAULT_RETRY_LIMIT: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminalFailure {
    ColorFlashFailed,
    LightTooHigh,
    MotionTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort(ResultCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RetryState {
    pub attempt_count: u32,
    pub limit: u32,
}

#[derive(Debug)]
pub struct RetryCoordinator {
    kind: FlowKind,
    state: RetryState,
}

impl RetryCoordinator {
    pub fn new(kind: FlowKind, limit: u32) -> Self {
        Self {
            kind,
            state: RetryState {
                attempt_count: 0,
                limit,
            },
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn on_terminal_failure(&mut self, failure: TerminalFailure) -> RetryDecision {
        self.state.attempt_count = self.state.attempt_count.saturating_add(1);
        if self.state.attempt_count > self.state.limit {
            let code = abort_code(self.kind, failure);
            log::info!(
                "{:?} flow: {:?} after {} attempt(s), aborting with {:?}",
                self.kind,
                failure,
                self.state.attempt_count,
                code
            );
            RetryDecision::Abort(code)
        } else {
            log::info!(
                "{:?} flow: {:?}, retry {}/{}",
                self.kind,
                failure,
                self.state.attempt_count,
                self.state.limit
            );
            RetryDecision::Retry
        }
    }
}

/// Result code a flow finishes with when `failure` exhausts its budget.
pub fn abort_code(kind: FlowKind, failure: TerminalFailure) -> ResultCode {
    match (kind, failure) {
        (FlowKind::Liveness, TerminalFailure::ColorFlashFailed) => {
            ResultCode::LivenessColorFlashFailed
        }
        (FlowKind::Liveness, TerminalFailure::MotionTimeout) => ResultCode::LivenessTimeout,
        (_, TerminalFailure::ColorFlashFailed) => ResultCode::ColorFlashFailed,
        (_, TerminalFailure::LightTooHigh) => ResultCode::LightTooHigh,
        (_, TerminalFailure::MotionTimeout) => ResultCode::MotionTimeout,
    }
}
