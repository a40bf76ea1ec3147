//! Per-worker watchdog loop
//!
//! Each tick: poll the health source, fold the result into the rolling
//! evidence, ask the escalation policy for a decision and carry out any
//! remediation before sleeping out the rest of the tick.

use crate::error::Result;
use crate::manifest::WatchdogConfig;
use crate::sickbay::policy::{Decision, EscalationPolicy, EscalationState, Evidence, PolicyConfig};
use crate::sickbay::probe::{self, HealthSource, Poll, WorkerFamily};
use crate::sickbay::recovery::{CommandSpec, HostOps, LocalHost, RemediationConfig, RemediationExecutor};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Time source for the loop, replaceable in tests
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock with blocking sleeps
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Watchdog for one worker
pub struct Watchdog<H: HostOps, C: Clock> {
    family: WorkerFamily,
    source: Box<dyn HealthSource>,
    policy: EscalationPolicy,
    evidence: Evidence,
    state: EscalationState,
    executor: RemediationExecutor<H>,
    clock: C,
    started_at: Instant,
    tick: Duration,
}

impl Watchdog<LocalHost, SystemClock> {
    /// Build a watchdog for the real host from configuration
    pub fn from_config(config: &WatchdogConfig) -> Result<Self> {
        let host = LocalHost::new(CommandSpec::from_argv(&config.kernel_log_command)?);
        let executor = RemediationExecutor::new(host, RemediationConfig::from_watchdog(config)?);
        Ok(Self::new(
            config.family,
            probe::source_for(config),
            PolicyConfig::from_watchdog(config),
            executor,
            SystemClock,
            Duration::from_millis(config.tick),
        ))
    }
}

impl<H: HostOps, C: Clock> Watchdog<H, C> {
    pub fn new(
        family: WorkerFamily,
        source: Box<dyn HealthSource>,
        policy: PolicyConfig,
        executor: RemediationExecutor<H>,
        clock: C,
        tick: Duration,
    ) -> Self {
        let started_at = clock.now();
        Self {
            family,
            source,
            evidence: Evidence::for_policy(&policy),
            policy: EscalationPolicy::new(policy),
            state: EscalationState::Warming,
            executor,
            clock,
            started_at,
            tick,
        }
    }

    pub fn state(&self) -> EscalationState {
        self.state
    }

    pub fn evidence(&self) -> &Evidence {
        &self.evidence
    }

    pub fn executor(&self) -> &RemediationExecutor<H> {
        &self.executor
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Run one poll/decide/act cycle
    pub fn tick(&mut self) -> Decision {
        let uptime = self.clock.now().saturating_duration_since(self.started_at);
        let poll = self.source.poll();
        self.report(&poll);

        let decision = self
            .policy
            .decide(self.state, &poll, &mut self.evidence, uptime);
        for (from, to) in &decision.transitions {
            info!("Watchdog state {} -> {}", from, to);
        }
        self.state = decision.state;

        if decision.action.is_remediation() {
            warn!(
                "{} worker needs remediation: {:?}",
                self.family, decision.action
            );
            self.executor
                .act(decision.action, self.source.as_mut(), &self.clock);
            self.state = self.policy.settle(decision.action, &mut self.evidence);
            info!("Remediation finished, watchdog state {}", self.state);
        }

        decision
    }

    fn report(&self, poll: &Poll) {
        match poll {
            Poll::Pending => debug!("Waiting on {}", self.source.describe()),
            Poll::Miss(reason) => {
                if self.state != EscalationState::Warming {
                    warn!("No data from {}: {}", self.source.describe(), reason);
                } else {
                    debug!("No data from {} while warming: {}", self.source.describe(), reason);
                }
            }
            Poll::Snapshot(snapshot) => {
                let minimum = self.policy.config().minimal_performance;
                if self.family == WorkerFamily::GpuLoad {
                    let below = snapshot.devices_below(minimum);
                    if below > 0 {
                        info!(
                            "{} of {} device(s) below {:.0}% load",
                            below,
                            snapshot.devices.len(),
                            minimum
                        );
                    }
                }
                debug!(
                    "Performance {:.2}, uptime {:?}s, accepted {:?}, rejected {:?}, power {:?}",
                    snapshot.performance,
                    snapshot.uptime_secs,
                    snapshot.accepted,
                    snapshot.rejected,
                    snapshot.power_watts
                );
                debug!(
                    "Average {:?}; minimal {:.2}; share rate {:?}/min; misses {}",
                    self.evidence.performance.average(),
                    minimum,
                    snapshot.share_rate(),
                    self.evidence.miss_count()
                );
            }
        }
    }

    /// Tick forever on a fixed cadence. Remediation sleeps are not compensated.
    pub fn run(&mut self) {
        info!(
            "Watchdog started for {} worker ({}), tick {:?}, grace {:?}",
            self.family,
            self.source.describe(),
            self.tick,
            self.policy.config().grace_period
        );
        loop {
            let tick_start = self.clock.now();
            self.tick();
            let spent = self.clock.now().saturating_duration_since(tick_start);
            self.clock.sleep(self.tick.saturating_sub(spent));
        }
    }
}
