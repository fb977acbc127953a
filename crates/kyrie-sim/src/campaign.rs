//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds with the same parameters, collecting pass/fail
//! results and identifying the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use kyrie_core::controller::RollbackPolicy;
use serde::{Deserialize, Serialize};

use crate::network::FaultConfig;
use crate::oracle::{BoardOracle, InvariantViolation, OracleResult};
use crate::{SimulationConfig, SimulationResult, Simulator, WorkloadConfig};

/// Campaign-level configuration: which seeds to run and the simulation
/// parameters shared by every seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    /// Board viewers per seed.
    pub client_count: usize,
    /// Workload rounds per seed, before the drain.
    pub rounds: u64,
    /// Issues in the project when the boards mount.
    pub initial_issues: usize,
    pub rollback_policy: RollbackPolicy,
    pub success_notifications: bool,
    pub workload: WorkloadConfig,
    pub fault: FaultConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..100,
            client_count: sim.client_count,
            rounds: sim.rounds,
            initial_issues: sim.initial_issues,
            rollback_policy: sim.rollback_policy,
            success_notifications: sim.success_notifications,
            workload: sim.workload,
            fault: sim.fault,
        }
    }
}

impl CampaignConfig {
    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            client_count: self.client_count,
            rounds: self.rounds,
            initial_issues: self.initial_issues,
            rollback_policy: self.rollback_policy,
            success_notifications: self.success_notifications,
            workload: self.workload,
            fault: self.fault,
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.client_count == 0 {
            bail!("client_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        let percents = [
            self.workload.move_rate_percent,
            self.workload.create_rate_percent,
            self.workload.delete_rate_percent,
            self.workload.remote_edit_rate_percent,
            self.fault.reject_rate_percent,
            self.fault.transport_failure_percent,
            self.fault.replay_rate_percent,
        ];
        if percents.iter().any(|p| *p > 100) {
            bail!("rates are percentages and must be <= 100");
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds where a failed move raced a remote update.
    pub interesting_states_reached: usize,
    /// Issues left stale by a captured rollback, summed over all seeds.
    pub clobbered_issues: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything a single seed produced, for debugging.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
        clobbered_issues: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let trace = simulate(seed, config)?;

        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        report.clobbered_issues += trace.oracle.clobbered.len();

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            tracing::warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace.oracle.violations.iter().map(format_violation).collect(),
            });
        }
    }

    tracing::info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Run a single seed and return Ok(()) on pass, Err(violations) on failure.
///
/// # Errors
///
/// Returns an `anyhow::Error` if the simulation itself encounters an internal
/// error (invalid config, etc). The inner `Result` distinguishes pass from
/// invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let trace = simulate(seed, config)?;
    if trace.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.oracle.violations))
    }
}

/// Replay a single seed with full trace details for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    simulate(seed, config)
}

fn simulate(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;
    let oracle = BoardOracle::check_all(&result.server, &result.clients, config.success_notifications);
    Ok(DetailedTrace { result, oracle })
}

/// Format an invariant violation into a human-readable string.
#[must_use]
pub fn format_violation(v: &InvariantViolation) -> String {
    match v {
        InvariantViolation::DuplicateId { client, id } => {
            format!("DuplicateId: client {client} holds {id} more than once")
        }
        InvariantViolation::LaneMismatch { client, id, detail } => match id {
            Some(id) => format!("LaneMismatch: client {client}, issue {id}: {detail}"),
            None => format!("LaneMismatch: client {client}: {detail}"),
        },
        InvariantViolation::AssigneeLost {
            client,
            id,
            expected,
            found,
        } => {
            format!(
                "AssigneeLost: client {client}, issue {id} \
                 (expected={expected:?}, found={found:?})"
            )
        }
        InvariantViolation::Divergence { client, id, detail } => {
            format!("Divergence: client {client}, issue {id}: {detail}")
        }
        InvariantViolation::Idempotence { client, id } => match id {
            Some(id) => format!("Idempotence: re-applying the last change to {id} mutated client {client}"),
            None => format!("Idempotence: re-applying the last change mutated client {client}"),
        },
        InvariantViolation::Notifications {
            client,
            expected_failures,
            failures,
            expected_successes,
            successes,
        } => {
            format!(
                "Notifications: client {client} showed {failures} errors (expected \
                 {expected_failures}) and {successes} successes (expected {expected_successes})"
            )
        }
    }
}
