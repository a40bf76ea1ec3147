//! Escalation policy
//!
//! Decides, tick by tick, whether the worker is healthy, needs a restart, or
//! needs the machine rebooted. The remediation is a function of the state
//! entered: `Restarting` restarts, `RebootPending` reboots.

use crate::manifest::WatchdogConfig;
use crate::sickbay::probe::{HealthSnapshot, Poll};
use crate::sickbay::window::RollingWindow;
use std::time::Duration;
use tracing::debug;

/// Escalation state of a watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    /// Grace period after start, nothing fires
    Warming,
    Monitoring,
    /// Performance below the minimum with enough evidence
    Degraded,
    /// Worker restart in progress
    Restarting,
    /// Machine reboot in progress
    RebootPending { diagnostics: bool },
}

impl EscalationState {
    /// Action carried out on entering this state
    pub fn action(&self) -> Action {
        match self {
            EscalationState::Restarting => Action::Restart,
            EscalationState::RebootPending { diagnostics: true } => Action::RebootWithDiagnostics,
            EscalationState::RebootPending { diagnostics: false } => Action::RebootQuiet,
            _ => Action::None,
        }
    }

    fn is_remediating(&self) -> bool {
        matches!(
            self,
            EscalationState::Restarting | EscalationState::RebootPending { .. }
        )
    }
}

impl std::fmt::Display for EscalationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationState::Warming => write!(f, "warming"),
            EscalationState::Monitoring => write!(f, "monitoring"),
            EscalationState::Degraded => write!(f, "degraded"),
            EscalationState::Restarting => write!(f, "restarting"),
            EscalationState::RebootPending { diagnostics: true } => {
                write!(f, "reboot-pending (diagnostics)")
            }
            EscalationState::RebootPending { diagnostics: false } => write!(f, "reboot-pending"),
        }
    }
}

/// Remediation requested by the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Restart,
    RebootQuiet,
    RebootWithDiagnostics,
}

impl Action {
    pub fn is_remediation(&self) -> bool {
        !matches!(self, Action::None)
    }
}

/// Decision parameters
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Lowest healthy rolling average (equal counts as healthy)
    pub minimal_performance: f64,
    /// Capacity of both rolling windows
    pub samples: usize,
    /// Misses within the window tolerated before a reboot
    pub miss_threshold: u32,
    /// Accepted units that must be exceeded before degradation counts
    pub min_valid: u64,
    pub grace_period: Duration,
    /// Restarts without recovery before escalating to a reboot
    pub max_restarts: u32,
    /// Whether the worker has a restart control channel
    pub can_restart: bool,
}

impl PolicyConfig {
    pub fn from_watchdog(config: &WatchdogConfig) -> Self {
        let family = config.family;
        Self {
            minimal_performance: config.minimal_performance,
            samples: config.samples,
            miss_threshold: config.miss_threshold,
            min_valid: if family.reports_shares() {
                config.min_valid
            } else {
                0
            },
            grace_period: Duration::from_secs(config.grace_period),
            max_restarts: config.max_restarts,
            can_restart: family.can_restart(),
        }
    }
}

/// Rolling evidence the policy decides on
#[derive(Debug, Clone)]
pub struct Evidence {
    pub performance: RollingWindow,
    /// 1.0 per miss, 0.0 per answered poll
    pub misses: RollingWindow,
    /// Restarts issued since the last healthy full window
    pub restarts: u32,
}

impl Evidence {
    /// The miss window always holds at least `miss_threshold + 1` entries,
    /// otherwise its sum could never exceed the threshold.
    pub fn new(samples: usize, miss_threshold: u32) -> Self {
        let miss_capacity = samples.max(miss_threshold as usize + 1);
        Self {
            performance: RollingWindow::new(samples),
            misses: RollingWindow::new(miss_capacity),
            restarts: 0,
        }
    }

    pub fn for_policy(config: &PolicyConfig) -> Self {
        Self::new(config.samples, config.miss_threshold)
    }

    pub fn miss_count(&self) -> u32 {
        self.misses.sum() as u32
    }
}

/// Outcome of one decision
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub state: EscalationState,
    pub action: Action,
    /// Every state change taken during this decision, in order
    pub transitions: Vec<(EscalationState, EscalationState)>,
}

impl Decision {
    fn stay(state: EscalationState) -> Self {
        Self {
            state,
            action: Action::None,
            transitions: Vec::new(),
        }
    }

    fn move_to(&mut self, next: EscalationState) {
        if self.state != next {
            self.transitions.push((self.state, next));
            self.state = next;
        }
        self.action = next.action();
    }
}

/// The escalation policy
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    config: PolicyConfig,
}

impl EscalationPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Fold one poll into the evidence and decide what to do.
    ///
    /// Recording and deciding happen together: whether the performance
    /// window was already full before this sample matters to the decision.
    pub fn decide(
        &self,
        state: EscalationState,
        poll: &Poll,
        evidence: &mut Evidence,
        uptime: Duration,
    ) -> Decision {
        // A remediation is in flight until `settle` runs
        if state.is_remediating() {
            return Decision::stay(state);
        }

        if uptime < self.config.grace_period {
            return Decision::stay(EscalationState::Warming);
        }

        let mut decision = Decision::stay(state);
        if state == EscalationState::Warming {
            decision.move_to(EscalationState::Monitoring);
        }

        let snapshot = match poll {
            Poll::Pending => return decision,
            Poll::Miss(_) => {
                evidence.misses.push(1.0);
                None
            }
            Poll::Snapshot(snapshot) => {
                evidence.misses.push(0.0);
                Some(snapshot)
            }
        };

        if evidence.miss_count() > self.config.miss_threshold {
            decision.move_to(EscalationState::RebootPending { diagnostics: true });
            return decision;
        }

        let Some(snapshot) = snapshot else {
            return decision;
        };

        // Judge only once a full window of history precedes this sample
        let primed = evidence.performance.is_full();
        evidence.performance.push(snapshot.performance);
        if !primed {
            return decision;
        }

        let Some(average) = evidence.performance.average() else {
            debug!("No performance samples yet");
            return decision;
        };

        if average >= self.config.minimal_performance {
            evidence.restarts = 0;
            if decision.state == EscalationState::Degraded {
                decision.move_to(EscalationState::Monitoring);
            }
            return decision;
        }

        if !self.enough_valid_units(snapshot) {
            debug!(
                "Average {:.2} below minimum {:.2}, but too few accepted units to act",
                average, self.config.minimal_performance
            );
            return decision;
        }

        decision.move_to(EscalationState::Degraded);
        if self.config.can_restart && evidence.restarts < self.config.max_restarts {
            decision.move_to(EscalationState::Restarting);
        } else {
            decision.move_to(EscalationState::RebootPending { diagnostics: false });
        }
        decision
    }

    fn enough_valid_units(&self, snapshot: &HealthSnapshot) -> bool {
        match snapshot.accepted {
            Some(accepted) => accepted > self.config.min_valid,
            None => self.config.min_valid == 0,
        }
    }

    /// Reset after a remediation completed; the grace period is not re-applied
    pub fn settle(&self, action: Action, evidence: &mut Evidence) -> EscalationState {
        evidence.performance.clear();
        evidence.misses.clear();
        match action {
            Action::Restart => evidence.restarts += 1,
            Action::RebootQuiet | Action::RebootWithDiagnostics => evidence.restarts = 0,
            Action::None => {}
        }
        EscalationState::Monitoring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PolicyConfig {
        PolicyConfig {
            minimal_performance: 50.0,
            samples: 16,
            miss_threshold: 10,
            min_valid: 10,
            grace_period: Duration::from_secs(60),
            max_restarts: 3,
            can_restart: true,
        }
    }

    fn sample(performance: f64, accepted: u64) -> Poll {
        Poll::Snapshot(HealthSnapshot {
            uptime_secs: Some(600),
            performance,
            accepted: Some(accepted),
            rejected: Some(0),
            ..Default::default()
        })
    }

    const WARM: Duration = Duration::from_secs(120);

    #[test]
    fn test_state_actions() {
        assert_eq!(EscalationState::Restarting.action(), Action::Restart);
        assert_eq!(
            EscalationState::RebootPending { diagnostics: true }.action(),
            Action::RebootWithDiagnostics
        );
        assert_eq!(
            EscalationState::RebootPending { diagnostics: false }.action(),
            Action::RebootQuiet
        );
        assert_eq!(EscalationState::Degraded.action(), Action::None);
        assert_eq!(EscalationState::Warming.to_string(), "warming");
    }

    #[test]
    fn test_grace_period_suppresses_everything() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for i in 0..100 {
            let poll = if i % 2 == 0 {
                Poll::Miss("down".into())
            } else {
                sample(0.0, 1000)
            };
            let d = policy.decide(
                EscalationState::Warming,
                &poll,
                &mut evidence,
                Duration::from_secs(59),
            );
            assert_eq!(d.action, Action::None);
            assert_eq!(d.state, EscalationState::Warming);
        }
        assert!(evidence.misses.is_empty());
        assert!(evidence.performance.is_empty());
    }

    #[test]
    fn test_warming_leaves_after_grace() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        let d = policy.decide(
            EscalationState::Warming,
            &sample(100.0, 20),
            &mut evidence,
            Duration::from_secs(60),
        );
        assert_eq!(d.state, EscalationState::Monitoring);
        assert_eq!(
            d.transitions,
            vec![(EscalationState::Warming, EscalationState::Monitoring)]
        );
    }

    #[test]
    fn test_healthy_window_continues() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        let mut state = EscalationState::Monitoring;
        for _ in 0..16 {
            let d = policy.decide(state, &sample(100.0, 20), &mut evidence, WARM);
            assert_eq!(d.action, Action::None);
            assert_eq!(d.state, EscalationState::Monitoring);
            state = d.state;
        }
    }

    #[test]
    fn test_threshold_is_exclusive_on_the_low_side() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for _ in 0..40 {
            let d = policy.decide(
                EscalationState::Monitoring,
                &sample(50.0, 20),
                &mut evidence,
                WARM,
            );
            assert_eq!(d.action, Action::None);
        }

        let mut evidence = Evidence::new(16, 10);
        let mut last = Action::None;
        for _ in 0..17 {
            last = policy
                .decide(EscalationState::Monitoring, &sample(49.99, 20), &mut evidence, WARM)
                .action;
        }
        assert_eq!(last, Action::Restart);
    }

    #[test]
    fn test_degradation_fires_on_seventeenth_sample() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for tick in 1..=16 {
            let d = policy.decide(EscalationState::Monitoring, &sample(10.0, 20), &mut evidence, WARM);
            assert_eq!(d.action, Action::None, "tick {}", tick);
        }
        let d = policy.decide(EscalationState::Monitoring, &sample(10.0, 20), &mut evidence, WARM);
        assert_eq!(d.action, Action::Restart);
        assert_eq!(d.state, EscalationState::Restarting);
        assert_eq!(
            d.transitions,
            vec![
                (EscalationState::Monitoring, EscalationState::Degraded),
                (EscalationState::Degraded, EscalationState::Restarting),
            ]
        );
        assert_eq!(evidence.performance.len(), 16);
    }

    #[test]
    fn test_idle_worker_without_shares_is_left_alone() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for _ in 0..40 {
            let d = policy.decide(EscalationState::Monitoring, &sample(0.0, 10), &mut evidence, WARM);
            assert_eq!(d.action, Action::None);
        }
    }

    #[test]
    fn test_misses_trigger_reboot_with_diagnostics() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        // Full healthy window does not matter
        for _ in 0..16 {
            policy.decide(EscalationState::Monitoring, &sample(100.0, 20), &mut evidence, WARM);
        }
        for n in 1..=10 {
            let d = policy.decide(
                EscalationState::Monitoring,
                &Poll::Miss("refused".into()),
                &mut evidence,
                WARM,
            );
            assert_eq!(d.action, Action::None, "miss {}", n);
        }
        let d = policy.decide(
            EscalationState::Monitoring,
            &Poll::Miss("refused".into()),
            &mut evidence,
            WARM,
        );
        assert_eq!(d.action, Action::RebootWithDiagnostics);
        assert_eq!(d.state, EscalationState::RebootPending { diagnostics: true });
    }

    #[test]
    fn test_success_does_not_erase_misses() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for _ in 0..10 {
            policy.decide(EscalationState::Monitoring, &Poll::Miss("x".into()), &mut evidence, WARM);
        }
        policy.decide(EscalationState::Monitoring, &sample(100.0, 20), &mut evidence, WARM);
        assert_eq!(evidence.miss_count(), 10);
        let d = policy.decide(EscalationState::Monitoring, &Poll::Miss("x".into()), &mut evidence, WARM);
        assert_eq!(d.action, Action::RebootWithDiagnostics);
    }

    #[test]
    fn test_old_misses_age_out_by_eviction() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for _ in 0..10 {
            policy.decide(EscalationState::Monitoring, &Poll::Miss("x".into()), &mut evidence, WARM);
        }
        for _ in 0..16 {
            policy.decide(EscalationState::Monitoring, &sample(100.0, 20), &mut evidence, WARM);
        }
        assert_eq!(evidence.miss_count(), 0);
    }

    #[test]
    fn test_misses_fire_when_threshold_exceeds_window() {
        let policy = EscalationPolicy::new(PolicyConfig {
            samples: 8,
            ..config()
        });
        let mut evidence = Evidence::for_policy(policy.config());
        assert_eq!(evidence.misses.capacity(), 11);
        assert_eq!(evidence.performance.capacity(), 8);

        let mut actions = Vec::new();
        for _ in 0..11 {
            actions.push(
                policy
                    .decide(EscalationState::Monitoring, &Poll::Miss("refused".into()), &mut evidence, WARM)
                    .action,
            );
        }
        assert!(actions[..10].iter().all(|a| *a == Action::None));
        assert_eq!(actions[10], Action::RebootWithDiagnostics);
    }

    #[test]
    fn test_pending_poll_records_nothing() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for _ in 0..10 {
            policy.decide(EscalationState::Monitoring, &Poll::Miss("x".into()), &mut evidence, WARM);
        }
        for _ in 0..50 {
            let d = policy.decide(EscalationState::Monitoring, &Poll::Pending, &mut evidence, WARM);
            assert_eq!(d.action, Action::None);
        }
        assert_eq!(evidence.miss_count(), 10);
        assert_eq!(evidence.misses.len(), 10);
        assert!(evidence.performance.is_empty());

        let d = policy.decide(EscalationState::Monitoring, &Poll::Miss("x".into()), &mut evidence, WARM);
        assert_eq!(d.action, Action::RebootWithDiagnostics);
    }

    #[test]
    fn test_pending_poll_still_ends_warming() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        let d = policy.decide(EscalationState::Warming, &Poll::Pending, &mut evidence, WARM);
        assert_eq!(d.state, EscalationState::Monitoring);
        assert!(evidence.misses.is_empty());
    }

    #[test]
    fn test_degraded_recovers_on_healthy_window() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for _ in 0..16 {
            evidence.performance.push(100.0);
        }
        let d = policy.decide(EscalationState::Degraded, &sample(100.0, 20), &mut evidence, WARM);
        assert_eq!(d.state, EscalationState::Monitoring);
        assert_eq!(d.action, Action::None);
        assert_eq!(
            d.transitions,
            vec![(EscalationState::Degraded, EscalationState::Monitoring)]
        );
    }

    #[test]
    fn test_no_decision_while_remediating() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        let state = EscalationState::RebootPending { diagnostics: true };
        let d = policy.decide(state, &Poll::Miss("x".into()), &mut evidence, WARM);
        assert_eq!(d.state, state);
        assert_eq!(d.action, Action::None);
    }

    #[test]
    fn test_settle_clears_windows_and_returns_to_monitoring() {
        let policy = EscalationPolicy::new(config());
        let mut evidence = Evidence::new(16, 10);
        for _ in 0..17 {
            policy.decide(EscalationState::Monitoring, &sample(10.0, 20), &mut evidence, WARM);
        }
        let state = policy.settle(Action::Restart, &mut evidence);
        assert_eq!(state, EscalationState::Monitoring);
        assert!(evidence.performance.is_empty());
        assert!(evidence.misses.is_empty());
        assert_eq!(evidence.restarts, 1);
    }

    #[test]
    fn test_repeated_restarts_escalate_to_reboot() {
        let policy = EscalationPolicy::new(PolicyConfig {
            max_restarts: 2,
            ..config()
        });
        let mut evidence = Evidence::new(4, 10);
        let mut actions = Vec::new();
        for _ in 0..3 {
            let mut action = Action::None;
            while action == Action::None {
                action = policy
                    .decide(EscalationState::Monitoring, &sample(1.0, 20), &mut evidence, WARM)
                    .action;
            }
            policy.settle(action, &mut evidence);
            actions.push(action);
        }
        assert_eq!(
            actions,
            vec![Action::Restart, Action::Restart, Action::RebootQuiet]
        );
        assert_eq!(evidence.restarts, 0);
    }

    #[test]
    fn test_without_control_channel_degradation_reboots() {
        let policy = EscalationPolicy::new(PolicyConfig {
            can_restart: false,
            min_valid: 0,
            ..config()
        });
        let mut evidence = Evidence::new(2, 10);
        let load = Poll::Snapshot(HealthSnapshot {
            performance: 5.0,
            ..Default::default()
        });
        let mut last = Action::None;
        for _ in 0..3 {
            last = policy
                .decide(EscalationState::Monitoring, &load, &mut evidence, WARM)
                .action;
        }
        assert_eq!(last, Action::RebootQuiet);
    }
}
