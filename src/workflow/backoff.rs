//! Exponential polling backoff with an absolute deadline.

use crate::config::MonitorConfig;
use crate::model::MonitorState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub deadline_ms: u64,
}

impl From<&MonitorConfig> for BackoffPolicy {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            initial_interval_ms: config.initial_interval_ms,
            multiplier: config.multiplier,
            max_interval_ms: config.max_interval_ms,
            deadline_ms: config.deadline_ms(),
        }
    }
}

impl BackoffPolicy {
    /// Schedule for a step entering monitoring at `now_ms`; first poll is due immediately.
    pub fn start(&self, now_ms: u64) -> MonitorState {
        MonitorState {
            next_poll_at_ms: now_ms,
            interval_ms: self.initial_interval_ms.clamp(1, self.max_interval_ms.max(1)),
            deadline_at_ms: now_ms.saturating_add(self.deadline_ms),
            polls: 0,
        }
    }

    /// Schedule after a poll at `now_ms` that did not finish the step.
    ///
    /// The next poll never lands past the deadline, so an expired step is
    /// always picked up by the sweep that reaches the deadline.
    pub fn advance(&self, state: &MonitorState, now_ms: u64) -> MonitorState {
        let grown = (state.interval_ms as f64 * self.multiplier).round();
        let cap = self.max_interval_ms.max(1);
        let next_interval = if grown.is_finite() && grown < cap as f64 {
            (grown as u64).max(1)
        } else {
            cap
        };
        MonitorState {
            next_poll_at_ms: now_ms
                .saturating_add(state.interval_ms)
                .min(state.deadline_at_ms),
            interval_ms: next_interval,
            deadline_at_ms: state.deadline_at_ms,
            polls: state.polls.saturating_add(1),
        }
    }
}

pub fn is_expired(state: &MonitorState, now_ms: u64) -> bool {
    now_ms >= state.deadline_at_ms
}

pub fn is_due(state: &MonitorState, now_ms: u64) -> bool {
    now_ms >= state.next_poll_at_ms
}
