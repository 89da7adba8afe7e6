//! Adaptive view timeout.

use std::time::Duration;

/// Escalation stops growing after this many failed rounds; the timeout is
/// already ~57x base and longer waits only delay recovery further.
const MAX_ESCALATION_CYCLES: u32 = 10;

/// The single consensus timeout with multiplicative escalation.
///
/// Each unsuccessful view-change round multiplies the wait by 1.5 so that
/// nodes with drifting clocks eventually overlap in a round long enough to
/// collect a quorum. Entering a new view resets the escalation.
#[derive(Debug, Clone)]
pub struct AdaptiveTimer {
    base: Duration,
    change_cycle: u32,
}

impl AdaptiveTimer {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            change_cycle: 0,
        }
    }

    /// Timeout for the current escalation cycle: `base * 1.5^cycle`, capped.
    pub fn current_timeout(&self) -> Duration {
        let cycle = self.change_cycle.min(MAX_ESCALATION_CYCLES);
        self.base.mul_f64(1.5f64.powi(cycle as i32))
    }

    /// Record another unsuccessful round.
    pub fn escalate(&mut self) {
        self.change_cycle = self.change_cycle.saturating_add(1);
    }

    /// A new view was entered; start the next round from the base timeout.
    pub fn reset(&mut self) {
        self.change_cycle = 0;
    }

    pub fn change_cycle(&self) -> u32 {
        self.change_cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_multiplies_by_three_halves() {
        let mut timer = AdaptiveTimer::new(Duration::from_secs(2));
        assert_eq!(timer.current_timeout(), Duration::from_secs(2));
        timer.escalate();
        assert_eq!(timer.current_timeout(), Duration::from_secs(3));
        timer.escalate();
        assert_eq!(timer.current_timeout(), Duration::from_millis(4500));
    }

    #[test]
    fn escalation_is_capped() {
        let mut timer = AdaptiveTimer::new(Duration::from_secs(1));
        for _ in 0..100 {
            timer.escalate();
        }
        let capped = timer.current_timeout();
        timer.escalate();
        assert_eq!(timer.current_timeout(), capped);
        assert_eq!(capped, Duration::from_secs(1).mul_f64(1.5f64.powi(10)));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut timer = AdaptiveTimer::new(Duration::from_secs(2));
        timer.escalate();
        timer.escalate();
        timer.reset();
        assert_eq!(timer.current_timeout(), Duration::from_secs(2));
        assert_eq!(timer.change_cycle(), 0);
    }
}
