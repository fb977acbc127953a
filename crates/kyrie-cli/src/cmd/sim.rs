//! `kyrie sim`: deterministic simulation campaign commands.
//!
//! `kyrie sim run`: execute a campaign across many seeds.
//! `kyrie sim replay`: replay a single seed with detailed trace output.

use std::process;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use kyrie_core::controller::RollbackPolicy;
use kyrie_sim::TraceEvent;
use kyrie_sim::campaign::{CampaignConfig, format_violation, replay_seed, run_campaign};
use kyrie_sim::network::FaultConfig;
use serde::Serialize;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        long_about = "Execute deterministic board-sync simulations with configurable client counts,\n\
                      rounds, rollback policy and fault injection. Reports pass/fail per seed\n\
                      and identifies the first failure for replay.",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    kyrie sim run --seeds 100\n\n\
                      # Guarded rollbacks under heavy rejection\n    kyrie sim run --policy guarded --reject-rate 50\n\n\
                      # Machine-readable output\n    kyrie sim run --seeds 100 --format json"
    )]
    Run(SimRunArgs),

    #[command(
        about = "Replay a single seed with detailed trace output",
        long_about = "Replay a specific seed to get its execution trace, oracle results and\n\
                      violation details. Use after a campaign failure to debug.",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    kyrie sim replay --seed 42\n\n\
                      # Include every trace event\n    kyrie sim replay --seed 42 --trace"
    )]
    Replay(SimReplayArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Captured,
    Guarded,
}

impl From<PolicyArg> for RollbackPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Captured => Self::Captured,
            PolicyArg::Guarded => Self::Guarded,
        }
    }
}

/// Parameters shared by `run` and `replay`.
#[derive(Args, Debug, Clone)]
pub struct SimParams {
    /// Number of simulated board viewers.
    #[arg(long, default_value = "3")]
    pub clients: usize,

    /// Workload rounds per seed (the drain afterwards is not counted).
    #[arg(long, default_value = "40")]
    pub rounds: u64,

    /// What a failed move restores.
    #[arg(long, value_enum, default_value = "captured")]
    pub policy: PolicyArg,

    /// Percentage of status calls the server rejects.
    #[arg(long, default_value = "20")]
    pub reject_rate: u8,

    /// Maximum extra rounds a change spends in flight.
    #[arg(long, default_value = "3")]
    pub max_delay: u8,
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    pub seeds: u64,

    /// Starting seed value.
    #[arg(long, default_value = "0")]
    pub seed_start: u64,

    #[command(flatten)]
    pub params: SimParams,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    #[arg(long)]
    pub seed: u64,

    /// Include every trace event in the output.
    #[arg(long)]
    pub trace: bool,

    #[command(flatten)]
    pub params: SimParams,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    clobbered_issues: usize,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ClientOutput {
    id: usize,
    issues: usize,
    moves_started: u64,
    moves_confirmed: u64,
    moves_rolled_back: u64,
    moves_superseded: u64,
    moves_removed: u64,
    clobbered: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    rounds_run: u64,
    trace_events: usize,
    server_issues: usize,
    oracle_passed: bool,
    violations: Vec<String>,
    interesting_state_reached: bool,
    clients: Vec<ClientOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Vec<TraceEvent>>,
}

fn build_campaign_config(seed_start: u64, seeds: u64, params: &SimParams) -> CampaignConfig {
    CampaignConfig {
        seed_range: seed_start..seed_start.saturating_add(seeds),
        client_count: params.clients,
        rounds: params.rounds,
        rollback_policy: params.policy.into(),
        fault: FaultConfig {
            reject_rate_percent: params.reject_rate,
            max_delay_rounds: params.max_delay,
            ..FaultConfig::default()
        },
        ..CampaignConfig::default()
    }
}

/// Execute `kyrie sim run`.
pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed_start, args.seeds, &args.params);
    let report = run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        clobbered_issues: report.clobbered_issues,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };
    let params = &args.params;

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "campaign seeds_run={} clients={} rounds={} policy={:?}",
                out.seeds_run, params.clients, params.rounds, params.policy
            )?;
            writeln!(
                w,
                "results passed={} failed={} interesting_states={} clobbered={} all_passed={}",
                out.seeds_passed,
                out.seeds_failed,
                out.interesting_states_reached,
                out.clobbered_issues,
                out.all_passed
            )?;
            for failure in out.failures.iter().take(5) {
                writeln!(
                    w,
                    "failure seed={} violations={}",
                    failure.seed,
                    failure.violations.len()
                )?;
            }
            if let Some(seed) = out.first_failure {
                writeln!(w, "hint replay_seed={seed}")?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, "Simulation Campaign")?;
            pretty_kv(w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(w, "Clients", params.clients.to_string())?;
            pretty_kv(w, "Rounds", params.rounds.to_string())?;
            pretty_kv(w, "Policy", format!("{:?}", params.policy).to_lowercase())?;
            pretty_kv(
                w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting, {} clobbered issues)",
                    out.seeds_passed,
                    out.seeds_failed,
                    out.interesting_states_reached,
                    out.clobbered_issues
                ),
            )?;
            match out.first_failure {
                None => pretty_kv(w, "Status", "all seeds passed"),
                Some(seed) => {
                    pretty_kv(
                        w,
                        "Status",
                        format!("{} failures (first at seed {seed})", out.seeds_failed),
                    )?;
                    writeln!(w)?;
                    pretty_section(w, "Failure Samples")?;
                    for failure in out.failures.iter().take(5) {
                        writeln!(w, "seed {:<8} violations={}", failure.seed, failure.violations.len())?;
                        for violation in &failure.violations {
                            writeln!(w, "  - {violation}")?;
                        }
                    }
                    writeln!(w)?;
                    pretty_kv(w, "Replay", format!("kyrie sim replay --seed {seed}"))
                }
            }
        },
    )?;

    // Exit code 1 on any failure for CI integration
    if !report.all_passed() {
        process::exit(1);
    }
    Ok(())
}

/// Execute `kyrie sim replay`.
pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed, 1, &args.params);
    let detail = replay_seed(args.seed, &config)?;
    let result = detail.result;

    let out = ReplayOutput {
        seed: result.seed,
        rounds_run: result.rounds_run,
        trace_events: result.trace.len(),
        server_issues: result.server.len(),
        oracle_passed: detail.oracle.passed,
        violations: detail.oracle.violations.iter().map(format_violation).collect(),
        interesting_state_reached: result.interesting_state_reached,
        clients: result
            .clients
            .iter()
            .map(|client| ClientOutput {
                id: client.id,
                issues: client.issues.len(),
                moves_started: client.moves.started,
                moves_confirmed: client.moves.confirmed,
                moves_rolled_back: client.moves.rolled_back,
                moves_superseded: client.moves.superseded,
                moves_removed: client.moves.removed,
                clobbered: client.clobbered.iter().map(ToString::to_string).collect(),
            })
            .collect(),
        trace: args.trace.then_some(result.trace),
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "replay seed={} rounds_run={} trace_events={} server_issues={}",
                out.seed, out.rounds_run, out.trace_events, out.server_issues
            )?;
            writeln!(
                w,
                "result oracle_passed={} interesting_state_reached={}",
                out.oracle_passed, out.interesting_state_reached
            )?;
            for violation in &out.violations {
                writeln!(w, "violation={violation}")?;
            }
            for client in &out.clients {
                writeln!(
                    w,
                    "client id={} issues={} started={} confirmed={} rolled_back={} superseded={} clobbered={}",
                    client.id,
                    client.issues,
                    client.moves_started,
                    client.moves_confirmed,
                    client.moves_rolled_back,
                    client.moves_superseded,
                    client.clobbered.join(",")
                )?;
            }
            for event in out.trace.iter().flatten() {
                let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
                writeln!(w, "trace {line}")?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(w, "Rounds", out.rounds_run.to_string())?;
            pretty_kv(w, "Trace", format!("{} events", out.trace_events))?;
            pretty_kv(w, "Server", format!("{} issues", out.server_issues))?;
            pretty_kv(w, "Interesting", out.interesting_state_reached.to_string())?;
            pretty_kv(w, "Oracle", if out.oracle_passed { "passed" } else { "FAILED" })?;
            for violation in &out.violations {
                writeln!(w, "  - {violation}")?;
            }
            writeln!(w)?;
            pretty_section(w, "Clients")?;
            for client in &out.clients {
                writeln!(
                    w,
                    "client {:<3} {} issues, {} moves ({} confirmed, {} rolled back, {} superseded)",
                    client.id,
                    client.issues,
                    client.moves_started,
                    client.moves_confirmed,
                    client.moves_rolled_back,
                    client.moves_superseded
                )?;
                if !client.clobbered.is_empty() {
                    writeln!(w, "            stale after rollback: {}", client.clobbered.join(", "))?;
                }
            }
            if let Some(trace) = &out.trace {
                writeln!(w)?;
                pretty_section(w, "Trace")?;
                for event in trace {
                    writeln!(w, "{:>5}  {:?}", event.round, event.kind)?;
                }
            }
            Ok(())
        },
    )
}
