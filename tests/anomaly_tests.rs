mod common;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use isoledger::harness::anomalies::{self, Anomaly, Scenario};
use isoledger::prelude::*;

use common::int;

const LEVELS: [IsolationLevel; 4] = [
    IsolationLevel::ReadUncommitted,
    IsolationLevel::ReadCommitted,
    IsolationLevel::RepeatableRead,
    IsolationLevel::Serializable,
];

fn exhibited(scenario: &Scenario, config: LedgerConfig) -> bool {
    let trace = scenario.run(config).unwrap();
    println!("{} at {}:\n{}", scenario.anomaly, scenario.scripts[0].isolation, trace);
    scenario.exhibited(&trace)
}

#[test]
fn test_dirty_read_only_under_read_uncommitted() {
    for level in LEVELS {
        let scenario = anomalies::dirty_read(level);
        let expected = level == IsolationLevel::ReadUncommitted;
        assert_eq!(exhibited(&scenario, LedgerConfig::default()), expected, "{}", level);
    }
}

#[test]
fn test_dirty_read_reverts_after_rollback() {
    let scenario = anomalies::dirty_read(IsolationLevel::ReadUncommitted);
    let trace = scenario.run(LedgerConfig::default()).unwrap();

    assert_eq!(trace.reads(1), vec![int(900), int(1000)]);
    assert_eq!(trace.commit_outcome(0), Some(&Outcome::RolledBack));
    assert_eq!(trace.final_state["balance"], Value::Int(1000));
}

#[test]
fn test_non_repeatable_read_below_repeatable_read() {
    for level in LEVELS {
        let scenario = anomalies::non_repeatable_read(level);
        let expected = !level.uses_snapshot();
        assert_eq!(exhibited(&scenario, LedgerConfig::default()), expected, "{}", level);
    }

    let trace = anomalies::non_repeatable_read(IsolationLevel::ReadCommitted)
        .run(LedgerConfig::default())
        .unwrap();
    assert_eq!(trace.reads(0), vec![int(1000), int(900)]);
}

#[test]
fn test_phantom_read_depends_on_policy() {
    let mysql = LedgerConfig::default().with_phantom_policy(PhantomPolicy::MySql);
    let postgres = LedgerConfig::default().with_phantom_policy(PhantomPolicy::PostgreSql);

    let rr = anomalies::phantom_read(IsolationLevel::RepeatableRead);
    assert!(!exhibited(&rr, mysql.clone()));
    assert!(exhibited(&rr, postgres.clone()));

    let rc = anomalies::phantom_read(IsolationLevel::ReadCommitted);
    assert!(exhibited(&rc, mysql.clone()));

    let ser = anomalies::phantom_read(IsolationLevel::Serializable);
    assert!(!exhibited(&ser, mysql));
    assert!(!exhibited(&ser, postgres));
}

#[test]
fn test_write_skew_prevented_only_by_serializable() {
    for level in LEVELS {
        let scenario = anomalies::write_skew(level);
        let expected = level != IsolationLevel::Serializable;
        assert_eq!(exhibited(&scenario, LedgerConfig::default()), expected, "{}", level);
    }

    let trace = anomalies::write_skew(IsolationLevel::Serializable)
        .run(LedgerConfig::default())
        .unwrap();
    assert!(trace.committed(0));
    assert!(matches!(
        trace.failure(1),
        Some(LedgerError::Conflict {
            reason: ConflictReason::SerializationFailure { .. },
            ..
        })
    ));
}

#[test]
fn test_lost_update_prevented_by_snapshot_levels() {
    for level in LEVELS {
        let scenario = anomalies::lost_update(level);
        let expected = !level.uses_snapshot();
        assert_eq!(exhibited(&scenario, LedgerConfig::default()), expected, "{}", level);
    }

    let trace = anomalies::lost_update(IsolationLevel::RepeatableRead)
        .run(LedgerConfig::default())
        .unwrap();
    assert!(matches!(
        trace.failure(1),
        Some(LedgerError::Conflict {
            reason: ConflictReason::ConcurrentUpdate { .. },
            ..
        })
    ));
    assert_eq!(trace.final_state["balance"], Value::Int(900));
}

#[test]
fn test_serializable_read_then_write_same_key_raises_conflict() {
    let harness = AnomalyHarness::new(LedgerConfig::default());
    harness.seed([("balance", 1000)]).unwrap();

    let withdraw = |name: &str, amount: i64| {
        Script::new(name, IsolationLevel::Serializable)
            .read("balance")
            .add("balance", -amount)
            .commit()
    };
    let scripts = [withdraw("withdraw 100", 100), withdraw("withdraw 200", 200)];

    // Tx1's ADD waits on Tx0's row lock, then retries once Tx0 has committed.
    let trace = harness
        .run_schedule(&scripts, &Interleaving::Explicit(vec![0, 1, 0, 1, 0, 1]))
        .unwrap();
    println!("{}", trace);

    assert!(trace.committed(0));
    assert!(
        trace
            .script_events(1)
            .any(|e| matches!(e.outcome, Outcome::Blocked { .. }))
    );
    let err = trace.failure(1).unwrap();
    assert!(matches!(
        err,
        LedgerError::Conflict {
            reason: ConflictReason::ConcurrentUpdate { .. },
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(trace.final_state["balance"], Value::Int(900));
}

#[test]
fn test_anomaly_names() {
    assert_eq!(Anomaly::WriteSkew.to_string(), "write skew");
    assert_eq!(anomalies::phantom_read(IsolationLevel::ReadCommitted).anomaly, Anomaly::PhantomRead);
}

#[test]
fn test_disjoint_writes_same_result_under_any_interleaving() {
    const SCRIPTS: usize = 3;
    const KEYS: usize = 4;

    let scripts_for = |level: IsolationLevel| -> Vec<Script> {
        (0..SCRIPTS)
            .map(|s| {
                let mut script = Script::new(format!("writer {}", s), level);
                for k in 0..KEYS {
                    let key = format!("s{}:k{}", s, k);
                    script = script.write(key.clone(), (s * 10 + k) as i64).add(key, 1);
                }
                script.commit()
            })
            .collect()
    };

    let mut expected = None;
    for level in LEVELS {
        let scripts = scripts_for(level);
        for seed in 0..16u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut order: Vec<usize> = scripts
                .iter()
                .enumerate()
                .flat_map(|(i, s)| std::iter::repeat_n(i, s.ops.len()))
                .collect();
            order.shuffle(&mut rng);

            let harness = AnomalyHarness::new(LedgerConfig::default());
            let trace = harness
                .run_schedule(&scripts, &Interleaving::Explicit(order))
                .unwrap();

            for s in 0..SCRIPTS {
                assert!(trace.committed(s), "{} seed {}:\n{}", level, seed, trace);
            }
            let state = trace.final_state;
            assert_eq!(state.len(), SCRIPTS * KEYS);
            match &expected {
                None => expected = Some(state),
                Some(first) => assert_eq!(&state, first, "{} seed {}", level, seed),
            }
        }
    }
    assert_eq!(expected.unwrap()["s2:k3"], Value::Int(24));
}

#[test]
fn test_round_robin_and_serial_interleavings() {
    let harness = AnomalyHarness::new(LedgerConfig::default());
    harness.seed([("balance", 1000)]).unwrap();

    let reader = Script::new("reader", IsolationLevel::ReadCommitted)
        .read("balance")
        .read("balance");
    let writer = Script::new("writer", IsolationLevel::ReadCommitted)
        .add("balance", -100)
        .commit();

    // reader.0, writer.0, reader.1, writer.1 (commit), implicit reader commit
    let trace = harness
        .run_schedule(
            &[reader.clone(), writer.clone()],
            &Interleaving::RoundRobin { granularity: 1 },
        )
        .unwrap();
    let steps: Vec<(usize, usize)> = trace.events.iter().map(|e| (e.script, e.step)).collect();
    assert_eq!(steps, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2)]);
    // The writer had not committed yet when the reader read twice.
    assert_eq!(trace.reads(0), vec![int(1000), int(1000)]);

    let trace = harness
        .run_schedule(&[writer, reader], &Interleaving::Serial)
        .unwrap();
    assert_eq!(trace.reads(1), vec![int(800), int(800)]);
    assert_eq!(trace.final_state["balance"], Value::Int(800));
}
