//! Per-server failure tracking and ejection.
//!
//! ```text
//!            failure                 failures >= limit
//!   Live ────────────▶ Suspect ───────────────────────▶ Dead
//!    ▲                    │                              │
//!    └──── success ───────┘                              │ retry_timeout elapsed
//!    ▲                                                   ▼
//!    └─────────────────── probe succeeds ─────────── probe due
//!                                                        │ probe fails
//!                                                        └──▶ Dead (dead_since refreshed)
//! ```
//!
//! Ejection only happens with `auto_eject_hosts` and a failure limit. Without
//! them servers accumulate failures but are never removed from routing.

use std::time::{Duration, Instant};

/// Mutable health record for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerState {
    pub consecutive_failures: u32,
    pub dead_since: Option<Instant>,
}

impl ServerState {
    pub fn is_dead(&self) -> bool {
        self.dead_since.is_some()
    }
}

/// Observable health of a server at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Live,
    /// Failed recently but still routable.
    Suspect,
    /// Ejected and excluded from routing.
    Dead,
    /// Ejected, but `retry_timeout` has elapsed: the next request is a probe.
    ProbeDue,
}

/// What a recorded outcome did to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Suspected,
    Ejected,
    ProbeFailed,
    /// Suspect back to live.
    Recovered,
    /// Dead back to live after a successful probe.
    Restored,
}

/// Ejection policy, resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EjectPolicy {
    pub auto_eject: bool,
    /// Consecutive failures that eject a server. Zero disables ejection.
    pub failure_limit: u32,
    pub retry_timeout: Duration,
}

impl EjectPolicy {
    fn ejects(&self) -> bool {
        self.auto_eject && self.failure_limit > 0
    }
}

/// Health records for every server in a pool, indexed like the pool.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    states: Vec<ServerState>,
    policy: EjectPolicy,
}

impl FailureTracker {
    pub fn new(servers: usize, policy: EjectPolicy) -> Self {
        Self {
            states: vec![ServerState::default(); servers],
            policy,
        }
    }

    pub fn policy(&self) -> &EjectPolicy {
        &self.policy
    }

    pub fn state(&self, index: usize) -> ServerState {
        self.states.get(index).copied().unwrap_or_default()
    }

    pub fn health(&self, index: usize, now: Instant) -> Health {
        let state = self.state(index);
        match state.dead_since {
            Some(since) if now.saturating_duration_since(since) >= self.policy.retry_timeout => {
                Health::ProbeDue
            }
            Some(_) => Health::Dead,
            None if state.consecutive_failures > 0 => Health::Suspect,
            None => Health::Live,
        }
    }

    /// Whether requests may be sent to the server, probes included.
    pub fn is_routable(&self, index: usize, now: Instant) -> bool {
        !matches!(self.health(index, now), Health::Dead)
    }

    /// Routability of every server.
    pub fn routable(&self, now: Instant) -> Vec<bool> {
        (0..self.states.len())
            .map(|i| self.is_routable(i, now))
            .collect()
    }

    pub fn record_success(&mut self, index: usize) -> Transition {
        let Some(state) = self.states.get_mut(index) else {
            return Transition::Unchanged;
        };
        let was_dead = state.is_dead();
        let had_failures = state.consecutive_failures > 0;
        *state = ServerState::default();
        if was_dead {
            Transition::Restored
        } else if had_failures {
            Transition::Recovered
        } else {
            Transition::Unchanged
        }
    }

    pub fn record_failure(&mut self, index: usize, now: Instant) -> Transition {
        let ejects = self.policy.ejects();
        let limit = self.policy.failure_limit;
        let Some(state) = self.states.get_mut(index) else {
            return Transition::Unchanged;
        };

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.is_dead() {
            state.dead_since = Some(now);
            return Transition::ProbeFailed;
        }

        if ejects && state.consecutive_failures >= limit {
            state.dead_since = Some(now);
            Transition::Ejected
        } else {
            Transition::Suspected
        }
    }

    /// Forget all failures.
    pub fn reset(&mut self) {
        self.states.fill(ServerState::default());
    }
}
