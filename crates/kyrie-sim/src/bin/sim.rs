#![forbid(unsafe_code)]

use anyhow::Result;
use kyrie_sim::oracle::BoardOracle;
use kyrie_sim::{SimulationConfig, Simulator};

fn main() -> Result<()> {
    let config = SimulationConfig::default();
    let success_notifications = config.success_notifications;
    let mut simulator = Simulator::new(config)?;
    let result = simulator.run()?;
    let oracle = BoardOracle::check_all(&result.server, &result.clients, success_notifications);

    println!(
        "simulation complete: trace_events={} rounds={} passed={} clobbered={} interesting={}",
        result.trace.len(),
        result.rounds_run,
        oracle.passed,
        oracle.clobbered.len(),
        result.interesting_state_reached
    );

    Ok(())
}
