//! Canonical schedules for the classic isolation anomalies.
//!
//! Each constructor takes the isolation level of the transactions under test
//! and returns a [`Scenario`]: seed data, scripts and an interleaving. Running
//! it and asking [`Scenario::exhibited`] tells whether that level let the
//! anomaly through.

use std::fmt;

use super::{AnomalyHarness, Interleaving, Script, Trace};
use crate::config::LedgerConfig;
use crate::data_store::key_range::KeyRange;
use crate::data_store::value::Value;
use crate::errors::Result;
use crate::isolation::IsolationLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anomaly {
    DirtyRead,
    NonRepeatableRead,
    PhantomRead,
    WriteSkew,
    LostUpdate,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Anomaly::DirtyRead => "dirty read",
            Anomaly::NonRepeatableRead => "non-repeatable read",
            Anomaly::PhantomRead => "phantom read",
            Anomaly::WriteSkew => "write skew",
            Anomaly::LostUpdate => "lost update",
        };
        f.write_str(name)
    }
}

/// A ready-to-run anomaly reproduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub anomaly: Anomaly,
    /// Committed before the scripts start.
    pub seed: Vec<(String, Value)>,
    pub scripts: Vec<Script>,
    pub interleaving: Interleaving,
}

impl Scenario {
    /// Runs the scenario on a fresh harness built from `config`.
    pub fn run(&self, config: LedgerConfig) -> Result<Trace> {
        let harness = AnomalyHarness::new(config);
        harness.seed(self.seed.iter().cloned())?;
        harness.run_schedule(&self.scripts, &self.interleaving)
    }

    /// Whether `trace`, produced by running this scenario, shows the anomaly.
    pub fn exhibited(&self, trace: &Trace) -> bool {
        match self.anomaly {
            // The reader saw the value the writer later rolled back.
            Anomaly::DirtyRead => trace
                .reads(1)
                .first()
                .is_some_and(|v| *v == Some(Value::Int(900))),
            Anomaly::NonRepeatableRead => {
                let reads = trace.reads(0);
                reads.len() == 2 && reads[0] != reads[1]
            }
            Anomaly::PhantomRead => {
                let scans = trace.scans(0);
                scans.len() == 2 && scans[0] != scans[1]
            }
            // Both doctors went off call.
            Anomaly::WriteSkew => {
                trace.committed(0)
                    && trace.committed(1)
                    && trace.final_state.get("on_call:alice") == Some(&Value::Int(0))
                    && trace.final_state.get("on_call:bob") == Some(&Value::Int(0))
            }
            // The second withdrawal overwrote the first.
            Anomaly::LostUpdate => trace.committed(0) && trace.committed(1),
        }
    }
}

fn balance_seed() -> Vec<(String, Value)> {
    vec![("balance".to_string(), Value::Int(1000))]
}

/// A writer changes `balance` to 900 and rolls back; the reader, running at
/// `level`, reads `balance` before and after the rollback.
pub fn dirty_read(level: IsolationLevel) -> Scenario {
    let writer = Script::new("writer", IsolationLevel::ReadCommitted)
        .write("balance", 900)
        .rollback();
    let reader = Script::new("reader", level)
        .read("balance")
        .read("balance")
        .commit();
    Scenario {
        anomaly: Anomaly::DirtyRead,
        seed: balance_seed(),
        scripts: vec![writer, reader],
        interleaving: Interleaving::Explicit(vec![0, 1, 0, 1, 1]),
    }
}

/// The reader, at `level`, reads `balance` twice; in between another
/// transaction withdraws 100 and commits.
pub fn non_repeatable_read(level: IsolationLevel) -> Scenario {
    let reader = Script::new("reader", level)
        .read("balance")
        .read("balance")
        .commit();
    let writer = Script::new("writer", IsolationLevel::ReadCommitted)
        .add("balance", -100)
        .commit();
    Scenario {
        anomaly: Anomaly::NonRepeatableRead,
        seed: balance_seed(),
        scripts: vec![reader, writer],
        interleaving: Interleaving::Explicit(vec![0, 1, 1, 0, 0]),
    }
}

/// The reader, at `level`, scans the `acct:` range twice; in between another
/// transaction inserts `acct:3` and commits.
pub fn phantom_read(level: IsolationLevel) -> Scenario {
    let reader = Script::new("reader", level)
        .scan(KeyRange::prefix("acct:"))
        .scan(KeyRange::prefix("acct:"))
        .commit();
    let inserter = Script::new("inserter", IsolationLevel::ReadCommitted)
        .write("acct:3", 300)
        .commit();
    Scenario {
        anomaly: Anomaly::PhantomRead,
        seed: vec![
            ("acct:1".to_string(), Value::Int(100)),
            ("acct:2".to_string(), Value::Int(200)),
        ],
        scripts: vec![reader, inserter],
        interleaving: Interleaving::Explicit(vec![0, 1, 1, 0, 0]),
    }
}

/// Two doctors are on call. Each checks that both are, then takes themself
/// off call. Both scripts run at `level`.
pub fn write_skew(level: IsolationLevel) -> Scenario {
    let doctor = |name: &str, me: &str| {
        Script::new(name, level)
            .read("on_call:alice")
            .read("on_call:bob")
            .write(me, 0)
            .commit()
    };
    Scenario {
        anomaly: Anomaly::WriteSkew,
        seed: vec![
            ("on_call:alice".to_string(), Value::Int(1)),
            ("on_call:bob".to_string(), Value::Int(1)),
        ],
        scripts: vec![
            doctor("alice", "on_call:alice"),
            doctor("bob", "on_call:bob"),
        ],
        interleaving: Interleaving::Explicit(vec![0, 0, 1, 1, 0, 1, 0, 1]),
    }
}

/// Two transactions at `level` read `balance` (1000) and write back their own
/// withdrawal, 100 and 200 respectively.
pub fn lost_update(level: IsolationLevel) -> Scenario {
    let first = Script::new("withdraw 100", level)
        .read("balance")
        .write("balance", 900)
        .commit();
    let second = Script::new("withdraw 200", level)
        .read("balance")
        .write("balance", 800)
        .commit();
    Scenario {
        anomaly: Anomaly::LostUpdate,
        seed: balance_seed(),
        scripts: vec![first, second],
        interleaving: Interleaving::Explicit(vec![0, 1, 0, 0, 1, 1]),
    }
}
