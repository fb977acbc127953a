//! kyrie-sim library.
//!
//! Deterministic, round-based simulation of several board viewers syncing
//! against one authoritative issue table. A seed fixes every choice: which
//! cards get dragged, which status calls fail, how long each change spends
//! in flight, and when a reconnect replays already-delivered changes.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod campaign;
pub mod client;
pub mod network;
pub mod oracle;
pub mod rng;
pub mod server;

use anyhow::{Context, Result, bail};
use kyrie_core::config::BoardConfig;
use kyrie_core::controller::{MoveOutcome, RollbackPolicy};
use kyrie_core::event::ChangeEvent;
use kyrie_core::model::{Issue, IssueId, ProjectId, Status};
use serde::{Deserialize, Serialize};

use crate::client::{ClientId, ClientState, SimClient};
use crate::network::{FaultConfig, SimulatedNetwork};
use crate::rng::SimRng;
use crate::server::SimServer;

/// Rounds allowed after the workload stops for in-flight traffic to land.
const DRAIN_ROUNDS_LIMIT: u64 = 1_000;

/// Per-round activity percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Chance per client per round of dragging a card.
    pub move_rate_percent: u8,
    /// Chance per round that another user creates an issue.
    pub create_rate_percent: u8,
    /// Chance per round that another user deletes an issue.
    pub delete_rate_percent: u8,
    /// Chance per round that another user changes an issue's status.
    pub remote_edit_rate_percent: u8,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            move_rate_percent: 40,
            create_rate_percent: 15,
            delete_rate_percent: 5,
            remote_edit_rate_percent: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub client_count: usize,
    pub rounds: u64,
    pub initial_issues: usize,
    pub rollback_policy: RollbackPolicy,
    pub success_notifications: bool,
    pub workload: WorkloadConfig,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            client_count: 3,
            rounds: 40,
            initial_issues: 8,
            rollback_policy: RollbackPolicy::Captured,
            success_notifications: true,
            workload: WorkloadConfig::default(),
            fault: FaultConfig::default(),
        }
    }
}

/// What happened, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Created { id: IssueId },
    Deleted { id: IssueId },
    RemoteEdit { id: IssueId, status: Status },
    MoveBegun { client: ClientId, id: IssueId, from: Status, to: Status },
    MoveSettled { client: ClientId, id: IssueId, outcome: String },
    Delivered { client: ClientId, count: usize },
    Replayed { client: ClientId, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub round: u64,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    pub seed: u64,
    /// Rounds executed, including the drain after the workload stopped.
    pub rounds_run: u64,
    pub trace: Vec<TraceEvent>,
    pub server: Vec<Issue>,
    pub clients: Vec<ClientState>,
    /// A failed move raced a remote update at least once.
    pub interesting_state_reached: bool,
}

pub struct Simulator {
    config: SimulationConfig,
    rng: SimRng,
    server: SimServer,
    clients: Vec<SimClient>,
    network: SimulatedNetwork,
    trace: Vec<TraceEvent>,
    raced_moves: usize,
}

impl Simulator {
    /// Seed the server and mount every client from its snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable or a client cannot
    /// subscribe.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.client_count == 0 {
            bail!("client_count must be > 0");
        }

        let mut rng = SimRng::new(config.seed);
        let project_id = ProjectId::new("sim-project");
        let server = SimServer::new(
            project_id.clone(),
            config.initial_issues,
            config.fault.reject_rate_percent,
            &mut rng,
        );

        let board_config = BoardConfig {
            rollback_policy: config.rollback_policy,
            success_notifications: config.success_notifications,
            ..BoardConfig::default()
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .context("failed to build subscription runtime")?;
        let clients = (0..config.client_count)
            .map(|id| {
                SimClient::mount(
                    id,
                    project_id.clone(),
                    server.snapshot(),
                    board_config.clone(),
                    &runtime,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let network = SimulatedNetwork::new(config.client_count, config.fault);
        Ok(Self {
            config,
            rng,
            server,
            clients,
            network,
            trace: Vec::new(),
            raced_moves: 0,
        })
    }

    /// Run the workload, then keep delivering until nothing is in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if traffic is still in flight after the drain limit.
    pub fn run(&mut self) -> Result<SimulationResult> {
        tracing::debug!(seed = self.config.seed, "simulation starting");

        let mut round = 0;
        while round < self.config.rounds {
            self.step(round, true);
            round += 1;
        }

        let drain_until = round.saturating_add(DRAIN_ROUNDS_LIMIT);
        while !self.network.is_quiet() {
            if round >= drain_until {
                bail!(
                    "seed {}: {} messages still in flight after drain",
                    self.config.seed,
                    self.network.in_flight()
                );
            }
            self.step(round, false);
            round += 1;
        }

        let clients: Vec<ClientState> = self.clients.iter().map(SimClient::state).collect();
        tracing::debug!(seed = self.config.seed, rounds = round, "simulation finished");

        Ok(SimulationResult {
            seed: self.config.seed,
            rounds_run: round,
            trace: self.trace.clone(),
            server: self.server.snapshot(),
            interesting_state_reached: self.raced_moves > 0
                || clients.iter().any(|c| !c.clobbered.is_empty()),
            clients,
        })
    }

    fn step(&mut self, round: u64, active: bool) {
        if active {
            self.server_workload(round);
            self.client_moves(round);
        }

        for index in 0..self.clients.len() {
            let changes = self.network.take_changes(index, round);
            if !changes.is_empty() {
                let count = self.clients[index].deliver(changes);
                self.record(round, TraceEventKind::Delivered { client: index, count });
            }

            for reply in self.network.take_replies(index, round) {
                let id = reply.pending.issue_id.clone();
                let outcome = self.clients[index].settle(reply.pending, reply.result);
                if matches!(outcome, MoveOutcome::Superseded(_)) {
                    self.raced_moves += 1;
                }
                self.record(
                    round,
                    TraceEventKind::MoveSettled {
                        client: index,
                        id,
                        outcome: describe_outcome(&outcome).to_string(),
                    },
                );
            }

            if active {
                if let Some(len) = self.network.replay_len(&mut self.rng) {
                    let count = self.clients[index].replay(len);
                    self.record(round, TraceEventKind::Replayed { client: index, count });
                }
            }
        }
    }

    fn server_workload(&mut self, round: u64) {
        let workload = self.config.workload;

        if self.rng.chance(workload.create_rate_percent) {
            let change = self.server.create(round, &mut self.rng);
            if let Ok(event) = ChangeEvent::try_from(&change) {
                self.record(round, TraceEventKind::Created { id: event.issue_id().clone() });
            }
            self.network.broadcast(&change, round, &mut self.rng);
        }

        if self.rng.chance(workload.delete_rate_percent) {
            if let Some(change) = self.server.delete_random(&mut self.rng) {
                if let Ok(event) = ChangeEvent::try_from(&change) {
                    self.record(round, TraceEventKind::Deleted { id: event.issue_id().clone() });
                }
                self.network.broadcast(&change, round, &mut self.rng);
            }
        }

        if self.rng.chance(workload.remote_edit_rate_percent) {
            if let Some(change) = self.server.edit_random(round, &mut self.rng) {
                if let Ok(ChangeEvent::Update(fields)) = ChangeEvent::try_from(&change) {
                    if let Some(status) = fields.status {
                        self.record(round, TraceEventKind::RemoteEdit { id: fields.id, status });
                    }
                }
                self.network.broadcast(&change, round, &mut self.rng);
            }
        }
    }

    fn client_moves(&mut self, round: u64) {
        let move_rate = self.config.workload.move_rate_percent;
        for index in 0..self.clients.len() {
            if !self.rng.chance(move_rate) {
                continue;
            }
            let Some((pending, request)) = self.clients[index].begin_random_move(&mut self.rng) else {
                continue;
            };
            self.record(
                round,
                TraceEventKind::MoveBegun {
                    client: index,
                    id: pending.issue_id.clone(),
                    from: pending.from,
                    to: pending.to,
                },
            );

            let (outcome, echo) = self.server.update_status(&request, round, &mut self.rng);
            if let Some(change) = echo {
                self.network.broadcast(&change, round, &mut self.rng);
            }
            self.network.reply(index, pending, outcome, round, &mut self.rng);
        }
    }

    fn record(&mut self, round: u64, kind: TraceEventKind) {
        self.trace.push(TraceEvent { round, kind });
    }
}

const fn describe_outcome(outcome: &MoveOutcome) -> &'static str {
    match outcome {
        MoveOutcome::Unchanged => "unchanged",
        MoveOutcome::NotOnBoard => "not_on_board",
        MoveOutcome::Confirmed => "confirmed",
        MoveOutcome::RolledBack(_) => "rolled_back",
        MoveOutcome::Superseded(_) => "superseded",
        MoveOutcome::Removed(_) => "removed",
        MoveOutcome::Abandoned => "abandoned",
    }
}
