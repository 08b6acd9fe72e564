//! Circuit breaker (C6).
//!
//! Grounded in `agent_orchestrator/utils/retry.py::CircuitBreaker`: per-agent
//! closed/open/half-open state machine with `failure_threshold=5`,
//! `success_threshold=2`, and a 60s cool-down, guarded independently per
//! agent (no global lock, per §5).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct AgentBreaker {
    failure_count: u32,
    success_count: u32,
    open: bool,
    open_since: Option<Instant>,
}

impl AgentBreaker {
    fn new() -> Self {
        Self {
            failure_count: 0,
            success_count: 0,
            open: false,
            open_since: None,
        }
    }
}

/// Per-agent failure/success counting gating call availability.
pub struct CircuitBreakerRegistry {
    failure_threshold: u32,
    success_threshold: u32,
    cool_down: Duration,
    breakers: RwLock<HashMap<String, AgentBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, success_threshold: u32, cool_down: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            cool_down,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_policy() -> Self {
        Self::new(5, 2, Duration::from_secs(60))
    }

    /// Current externally-observable state for `agent`. A breaker in `Open`
    /// whose cool-down has elapsed reports `HalfOpen` (probes allowed) without
    /// mutating state — the transition is recorded on the next call outcome.
    pub fn state(&self, agent: &str) -> BreakerState {
        let breakers = self.breakers.read().unwrap();
        match breakers.get(agent) {
            None => BreakerState::Closed,
            Some(b) if !b.open => BreakerState::Closed,
            Some(b) => {
                let elapsed = b.open_since.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.cool_down {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    /// Whether `agent` is currently excluded from the available set:
    /// open and the cool-down has not yet elapsed.
    pub fn is_unavailable(&self, agent: &str) -> bool {
        self.state(agent) == BreakerState::Open
    }

    pub fn record_success(&self, agent: &str) {
        let mut breakers = self.breakers.write().unwrap();
        let entry = breakers.entry(agent.to_string()).or_insert_with(AgentBreaker::new);
        if entry.open {
            entry.success_count += 1;
            if entry.success_count >= self.success_threshold {
                entry.open = false;
                entry.open_since = None;
                entry.failure_count = 0;
                entry.success_count = 0;
            }
        } else {
            entry.failure_count = 0;
        }
    }

    pub fn record_failure(&self, agent: &str) {
        let mut breakers = self.breakers.write().unwrap();
        let entry = breakers.entry(agent.to_string()).or_insert_with(AgentBreaker::new);
        if entry.open {
            // A probe failed during half-open: reopen and reset the cool-down.
            entry.open_since = Some(Instant::now());
            entry.success_count = 0;
            return;
        }
        entry.failure_count += 1;
        if entry.failure_count >= self.failure_threshold {
            entry.open = true;
            entry.open_since = Some(Instant::now());
            entry.success_count = 0;
        }
    }

    pub fn reset(&self, agent: &str) {
        self.breakers.write().unwrap().remove(agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let breaker = CircuitBreakerRegistry::default_policy();
        assert_eq!(breaker.state("calculator"), BreakerState::Closed);
        assert!(!breaker.is_unavailable("calculator"));
    }

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreakerRegistry::new(3, 2, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.record_failure("calculator");
        }
        assert_eq!(breaker.state("calculator"), BreakerState::Closed);
        breaker.record_failure("calculator");
        assert_eq!(breaker.state("calculator"), BreakerState::Open);
        assert!(breaker.is_unavailable("calculator"));
    }

    #[test]
    fn success_resets_failure_counter_while_closed() {
        let breaker = CircuitBreakerRegistry::new(3, 2, Duration::from_secs(60));
        breaker.record_failure("calculator");
        breaker.record_failure("calculator");
        breaker.record_success("calculator");
        breaker.record_failure("calculator");
        breaker.record_failure("calculator");
        assert_eq!(breaker.state("calculator"), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_cool_down_elapses() {
        let breaker = CircuitBreakerRegistry::new(1, 2, Duration::from_millis(10));
        breaker.record_failure("calculator");
        assert_eq!(breaker.state("calculator"), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state("calculator"), BreakerState::HalfOpen);
        assert!(!breaker.is_unavailable("calculator"));
    }

    #[test]
    fn closes_after_success_threshold_in_half_open() {
        let breaker = CircuitBreakerRegistry::new(1, 2, Duration::from_millis(10));
        breaker.record_failure("calculator");
        std::thread::sleep(Duration::from_millis(20));
        breaker.record_success("calculator");
        assert_eq!(breaker.state("calculator"), BreakerState::HalfOpen);
        breaker.record_success("calculator");
        assert_eq!(breaker.state("calculator"), BreakerState::Closed);
    }

    #[test]
    fn failed_probe_reopens_and_resets_cool_down() {
        let breaker = CircuitBreakerRegistry::new(1, 2, Duration::from_millis(10));
        breaker.record_failure("calculator");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state("calculator"), BreakerState::HalfOpen);
        breaker.record_failure("calculator");
        assert_eq!(breaker.state("calculator"), BreakerState::Open);
    }
}
