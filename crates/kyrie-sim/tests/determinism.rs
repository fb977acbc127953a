//! Seed determinism and end-to-end convergence of the board simulation.

use kyrie_core::controller::RollbackPolicy;
use kyrie_sim::campaign::{CampaignConfig, run_campaign};
use kyrie_sim::network::FaultConfig;
use kyrie_sim::oracle::BoardOracle;
use kyrie_sim::{SimulationConfig, Simulator, WorkloadConfig};
use proptest::prelude::*;

fn run(config: SimulationConfig) -> kyrie_sim::SimulationResult {
    Simulator::new(config)
        .expect("simulator")
        .run()
        .expect("run")
}

#[test]
fn same_seed_same_trace() {
    let config = SimulationConfig {
        seed: 99,
        ..SimulationConfig::default()
    };
    let a = run(config.clone());
    let b = run(config);
    assert_eq!(a, b);
}

#[test]
fn different_seeds_diverge() {
    let a = run(SimulationConfig {
        seed: 1,
        ..SimulationConfig::default()
    });
    let b = run(SimulationConfig {
        seed: 2,
        ..SimulationConfig::default()
    });
    assert_ne!(a.trace, b.trace);
}

#[test]
fn fault_free_network_converges_exactly() {
    let config = SimulationConfig {
        seed: 17,
        fault: FaultConfig {
            reject_rate_percent: 0,
            transport_failure_percent: 0,
            ..FaultConfig::default()
        },
        workload: WorkloadConfig {
            delete_rate_percent: 0,
            ..WorkloadConfig::default()
        },
        ..SimulationConfig::default()
    };
    let result = run(config);
    let oracle = BoardOracle::check_all(&result.server, &result.clients, true);
    assert!(oracle.passed, "violations: {:?}", oracle.violations);
    assert!(oracle.clobbered.is_empty());
    for client in &result.clients {
        assert_eq!(client.moves.rolled_back, 0);
        assert_eq!(client.moves.superseded, 0);
    }
}

#[test]
fn silent_success_records_only_failures() {
    let config = CampaignConfig {
        seed_range: 0..5,
        success_notifications: false,
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config).expect("campaign");
    assert!(report.all_passed(), "failures: {:?}", report.failures);
}

#[test]
fn hundred_seed_campaign_passes_under_both_policies() {
    for policy in [RollbackPolicy::Captured, RollbackPolicy::Guarded] {
        let config = CampaignConfig {
            seed_range: 0..100,
            rollback_policy: policy,
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign");
        assert_eq!(report.seeds_run, 100);
        assert!(
            report.all_passed(),
            "{policy:?}: {} failures, first at seed {:?}",
            report.failures.len(),
            report.first_failure,
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_seed_satisfies_the_oracle(seed in any::<u64>(), clients in 1_usize..5) {
        let result = run(SimulationConfig {
            seed,
            client_count: clients,
            rounds: 25,
            ..SimulationConfig::default()
        });
        let oracle = BoardOracle::check_all(&result.server, &result.clients, true);
        prop_assert!(oracle.passed, "seed {}: {:?}", seed, oracle.violations);
    }
}
