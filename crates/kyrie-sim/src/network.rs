use std::collections::VecDeque;

use kyrie_core::controller::{PendingMove, TransportError, UpdateOutcome};
use kyrie_core::event::RawChange;
use serde::{Deserialize, Serialize};

use crate::client::ClientId;
use crate::rng::SimRng;

/// Fault injection for change delivery and status calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum extra rounds a change spends in flight to one client.
    pub max_delay_rounds: u8,
    /// Maximum rounds between a status call and its answer.
    pub max_rpc_latency_rounds: u8,
    /// Percentage of status calls the server refuses.
    pub reject_rate_percent: u8,
    /// Percentage of status answers lost in transit, whatever the server did.
    pub transport_failure_percent: u8,
    /// Percentage chance per client per round of a reconnect replay.
    pub replay_rate_percent: u8,
    /// Longest suffix of already-delivered changes a replay redelivers.
    pub max_replay_len: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 3,
            max_rpc_latency_rounds: 3,
            reject_rate_percent: 20,
            transport_failure_percent: 5,
            replay_rate_percent: 5,
            max_replay_len: 4,
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight<T> {
    due: u64,
    payload: T,
}

/// A status answer on its way back to the client that asked.
#[derive(Debug, Clone)]
pub struct Reply {
    pub pending: PendingMove,
    pub result: Result<UpdateOutcome, TransportError>,
}

/// One client's view of the network: a FIFO change link and a FIFO reply link.
#[derive(Debug, Clone)]
struct Link {
    changes: VecDeque<InFlight<RawChange>>,
    replies: VecDeque<InFlight<Reply>>,
    last_change_due: u64,
    last_reply_due: u64,
}

impl Link {
    const fn new() -> Self {
        Self {
            changes: VecDeque::new(),
            replies: VecDeque::new(),
            last_change_due: 0,
            last_reply_due: 0,
        }
    }
}

/// Deterministic network between the server and every client.
///
/// Each link delivers in send order. A delay never lets a later message
/// overtake an earlier one on the same link; different clients see the same
/// change at different rounds.
#[derive(Debug, Clone)]
pub struct SimulatedNetwork {
    links: Vec<Link>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub fn new(clients: usize, fault: FaultConfig) -> Self {
        Self {
            links: (0..clients).map(|_| Link::new()).collect(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Queue `change` for every client.
    pub fn broadcast(&mut self, change: &RawChange, round: u64, rng: &mut SimRng) {
        let max_delay = self.fault.max_delay_rounds;
        for link in &mut self.links {
            let due = round.saturating_add(rng.up_to(max_delay)).max(link.last_change_due);
            link.last_change_due = due;
            link.changes.push_back(InFlight {
                due,
                payload: change.clone(),
            });
        }
    }

    /// Queue the server's answer to `client`, possibly losing it in transit.
    pub fn reply(
        &mut self,
        client: ClientId,
        pending: PendingMove,
        outcome: UpdateOutcome,
        round: u64,
        rng: &mut SimRng,
    ) {
        let latency = rng.up_to(self.fault.max_rpc_latency_rounds);
        let result = if rng.chance(self.fault.transport_failure_percent) {
            Err(TransportError::Request("connection reset".to_string()))
        } else {
            Ok(outcome)
        };
        let Some(link) = self.links.get_mut(client) else {
            return;
        };
        let due = round.saturating_add(latency).max(link.last_reply_due);
        link.last_reply_due = due;
        link.replies.push_back(InFlight {
            due,
            payload: Reply { pending, result },
        });
    }

    /// Changes due for `client` at `round`, in send order.
    pub fn take_changes(&mut self, client: ClientId, round: u64) -> Vec<RawChange> {
        self.links
            .get_mut(client)
            .map(|link| drain_due(&mut link.changes, round))
            .unwrap_or_default()
    }

    /// Replies due for `client` at `round`, in send order.
    pub fn take_replies(&mut self, client: ClientId, round: u64) -> Vec<Reply> {
        self.links
            .get_mut(client)
            .map(|link| drain_due(&mut link.replies, round))
            .unwrap_or_default()
    }

    /// Whether a reconnect replay hits this client this round, and how long it is.
    pub fn replay_len(&self, rng: &mut SimRng) -> Option<usize> {
        if self.fault.max_replay_len == 0 || !rng.chance(self.fault.replay_rate_percent) {
            return None;
        }
        let len = rng.below(u64::from(self.fault.max_replay_len)) + 1;
        usize::try_from(len).ok()
    }

    /// Messages still in flight to anyone.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.links
            .iter()
            .map(|link| link.changes.len() + link.replies.len())
            .sum()
    }

    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.in_flight() == 0
    }
}

fn drain_due<T>(queue: &mut VecDeque<InFlight<T>>, round: u64) -> Vec<T> {
    let mut ready = Vec::new();
    while queue.front().is_some_and(|item| item.due <= round) {
        if let Some(item) = queue.pop_front() {
            ready.push(item.payload);
        }
    }
    ready
}
