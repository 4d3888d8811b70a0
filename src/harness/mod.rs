//! Deterministic interleaving of transaction scripts.
//!
//! The harness runs several [`Script`]s against one ledger on a single thread,
//! switching between them according to an [`Interleaving`], and records what
//! every operation returned. It exists to reproduce isolation anomalies in
//! tests and demos; it is not part of the data path.

pub mod anomalies;

use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::fmt;

use crate::{CommitSeq, TxnId};
use crate::config::LedgerConfig;
use crate::conflict::lock_table::LockWait;
use crate::data_store::key_range::KeyRange;
use crate::data_store::value::Value;
use crate::errors::{LedgerError, Result};
use crate::isolation::IsolationLevel;
use crate::ledger::Ledger;
use crate::transaction::{Transaction, TxnStatus};

/// One statement of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Read(String),
    /// `SELECT ... FOR UPDATE`
    ReadForUpdate(String),
    Scan(KeyRange),
    Write(String, Value),
    /// Read-modify-write of an integer: reads the key (absent counts as 0)
    /// and writes it back increased by the delta.
    Add(String, i64),
    Delete(String),
    Commit,
    Rollback,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Read(key) => write!(f, "READ {}", key),
            Op::ReadForUpdate(key) => write!(f, "READ {} FOR UPDATE", key),
            Op::Scan(range) => write!(f, "SCAN {}", range),
            Op::Write(key, value) => write!(f, "WRITE {} = {}", key, value),
            Op::Add(key, delta) => write!(f, "ADD {} {:+}", key, delta),
            Op::Delete(key) => write!(f, "DELETE {}", key),
            Op::Commit => f.write_str("COMMIT"),
            Op::Rollback => f.write_str("ROLLBACK"),
        }
    }
}

/// A transaction to run: an isolation level and its statements in order.
///
/// ```
/// use isoledger::{IsolationLevel, Script};
///
/// let script = Script::new("withdraw", IsolationLevel::ReadCommitted)
///     .read("balance")
///     .add("balance", -100)
///     .commit();
/// assert_eq!(script.ops.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub isolation: IsolationLevel,
    pub ops: Vec<Op>,
}

impl Script {
    pub fn new(name: impl Into<String>, isolation: IsolationLevel) -> Self {
        Self {
            name: name.into(),
            isolation,
            ops: Vec::new(),
        }
    }

    pub fn op(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    pub fn read(self, key: impl Into<String>) -> Self {
        self.op(Op::Read(key.into()))
    }

    pub fn read_for_update(self, key: impl Into<String>) -> Self {
        self.op(Op::ReadForUpdate(key.into()))
    }

    pub fn scan(self, range: KeyRange) -> Self {
        self.op(Op::Scan(range))
    }

    pub fn write(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(Op::Write(key.into(), value.into()))
    }

    pub fn add(self, key: impl Into<String>, delta: i64) -> Self {
        self.op(Op::Add(key.into(), delta))
    }

    pub fn delete(self, key: impl Into<String>) -> Self {
        self.op(Op::Delete(key.into()))
    }

    pub fn commit(self) -> Self {
        self.op(Op::Commit)
    }

    pub fn rollback(self) -> Self {
        self.op(Op::Rollback)
    }
}

/// The order in which the statements of several scripts are executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interleaving {
    /// Each script runs to completion, including its final commit, before
    /// the next one begins.
    Serial,
    /// Take `granularity` statements from every unfinished script in turn.
    RoundRobin { granularity: usize },
    /// One statement of the given script per entry. Entries naming a script
    /// with no statements left are ignored, and an entry for a waiting script
    /// retries its blocked statement. Statements the order does not reach
    /// run afterwards, script by script.
    Explicit(Vec<usize>),
}

/// What a single statement produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Result of `Read` or `ReadForUpdate`.
    Read(Option<Value>),
    /// Result of `Scan`.
    Rows(Vec<(String, Value)>),
    /// `Write` or `Delete` succeeded.
    Written,
    Added { before: i64, after: i64 },
    Committed(CommitSeq),
    RolledBack,
    /// The statement needs a lock `holder` has; it is retried on the
    /// script's next turn.
    Blocked { key: String, holder: TxnId },
    /// The statement failed; the script's transaction was rolled back.
    Failed(LedgerError),
    /// Not executed because an earlier statement of the script failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Index of the script in the schedule.
    pub script: usize,
    /// Index of the statement in the script. The implicit commit of a script
    /// that did not end itself has `step == ops.len()`.
    pub step: usize,
    pub op: Op,
    pub outcome: Outcome,
}

/// Everything a schedule run observed, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub events: Vec<TraceEvent>,
    /// Committed state of the ledger once every script has ended.
    pub final_state: BTreeMap<String, Value>,
}

impl Trace {
    /// Events of one script, in execution order.
    pub fn script_events(&self, script: usize) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter().filter(move |e| e.script == script)
    }

    /// Values returned by the script's `Read` and `ReadForUpdate` statements.
    pub fn reads(&self, script: usize) -> Vec<Option<Value>> {
        self.script_events(script)
            .filter_map(|e| match &e.outcome {
                Outcome::Read(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Rows returned by the script's `Scan` statements.
    pub fn scans(&self, script: usize) -> Vec<Vec<(String, Value)>> {
        self.script_events(script)
            .filter_map(|e| match &e.outcome {
                Outcome::Rows(rows) => Some(rows.clone()),
                _ => None,
            })
            .collect()
    }

    /// How the script ended: the outcome of its commit or rollback, or the
    /// failure that aborted it.
    pub fn commit_outcome(&self, script: usize) -> Option<&Outcome> {
        self.script_events(script)
            .filter(|e| {
                matches!(e.outcome, Outcome::Failed(_))
                    || matches!(
                        (&e.op, &e.outcome),
                        (Op::Commit, Outcome::Committed(_)) | (Op::Rollback, Outcome::RolledBack)
                    )
            })
            .map(|e| &e.outcome)
            .last()
    }

    pub fn committed(&self, script: usize) -> bool {
        matches!(self.commit_outcome(script), Some(Outcome::Committed(_)))
    }

    /// The error that aborted the script, if any.
    pub fn failure(&self, script: usize) -> Option<&LedgerError> {
        self.script_events(script).find_map(|e| match &e.outcome {
            Outcome::Failed(err) => Some(err),
            _ => None,
        })
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for event in &self.events {
            writeln!(
                f,
                "T{}.{:<2} {:<32} {:?}",
                event.script,
                event.step,
                event.op.to_string(),
                event.outcome
            )?;
        }
        Ok(())
    }
}

/// Progress of one script during a run.
struct Runner<'a> {
    script: &'a Script,
    txn: Option<Transaction>,
    cursor: usize,
    failed: bool,
    /// Holder of the lock the statement at `cursor` is waiting for.
    waiting_on: Option<TxnId>,
}

impl<'a> Runner<'a> {
    fn new(script: &'a Script) -> Self {
        Self {
            script,
            txn: None,
            cursor: 0,
            failed: false,
            waiting_on: None,
        }
    }

    fn has_next(&self) -> bool {
        self.cursor < self.script.ops.len()
    }

    fn txn_id(&self) -> Option<TxnId> {
        self.txn.as_ref().map(Transaction::id)
    }

    /// Deadlock ordering key: the greatest value is the newest transaction.
    fn age_key(&self) -> Option<(CommitSeq, TxnId)> {
        self.txn.as_ref().map(|txn| (txn.start_seq(), txn.id()))
    }

    /// Executes the next statement, beginning the transaction on first use.
    ///
    /// A statement that finds its lock taken stays at the cursor and is
    /// retried on the script's next turn.
    fn step(&mut self, index: usize, ledger: &Ledger) -> Option<TraceEvent> {
        let op = self.script.ops.get(self.cursor)?;
        let step = self.cursor;

        let outcome = if self.failed {
            Outcome::Skipped
        } else {
            let txn = self
                .txn
                .get_or_insert_with(|| ledger.begin(self.script.isolation));
            match execute(txn, op) {
                Ok(outcome) => outcome,
                Err(LedgerError::LockNotAvailable { key, holder }) => {
                    trace!("T{}.{} {} waits for Tx {}", index, step, op, holder);
                    self.waiting_on = Some(holder);
                    return Some(TraceEvent {
                        script: index,
                        step,
                        op: op.clone(),
                        outcome: Outcome::Blocked { key, holder },
                    });
                }
                Err(e) => {
                    debug!("Script {} ({}) failed at step {}: {}", index, self.script.name, step, e);
                    self.failed = true;
                    // Dropping an active transaction rolls it back.
                    self.txn = None;
                    Outcome::Failed(e)
                }
            }
        };
        self.waiting_on = None;
        self.cursor += 1;
        trace!("T{}.{} {} -> {:?}", index, step, op, outcome);
        Some(TraceEvent {
            script: index,
            step,
            op: op.clone(),
            outcome,
        })
    }

    /// Fails the waiting statement with `DeadlockAbort` and rolls the
    /// transaction back, releasing its locks.
    fn abort_waiting(&mut self, index: usize) -> Option<TraceEvent> {
        let op = self.script.ops.get(self.cursor)?.clone();
        let step = self.cursor;
        self.cursor += 1;
        self.waiting_on = None;
        self.failed = true;
        let txn = self.txn.take().map_or(0, |txn| txn.id());
        debug!("Script {} ({}) chosen as deadlock victim, Tx {}", index, self.script.name, txn);
        Some(TraceEvent {
            script: index,
            step,
            op,
            outcome: Outcome::Failed(LedgerError::DeadlockAbort { txn }),
        })
    }

    /// Commits a transaction the script left open.
    fn finish(&mut self, index: usize) -> Option<TraceEvent> {
        let txn = self.txn.as_mut()?;
        if self.failed || txn.status() != TxnStatus::Active {
            return None;
        }
        let outcome = match txn.commit() {
            Ok(seq) => Outcome::Committed(seq),
            Err(e) => Outcome::Failed(e),
        };
        trace!("T{} implicit COMMIT -> {:?}", index, outcome);
        Some(TraceEvent {
            script: index,
            step: self.script.ops.len(),
            op: Op::Commit,
            outcome,
        })
    }
}

/// One `run_schedule` call in progress.
struct Run<'a> {
    ledger: &'a Ledger,
    runners: Vec<Runner<'a>>,
    events: Vec<TraceEvent>,
}

impl<'a> Run<'a> {
    /// Gives script `index` one statement. Returns `false` when it had
    /// nothing left or is still waiting for a lock.
    fn turn(&mut self, index: usize) -> bool {
        let Some(event) = self.runners[index].step(index, self.ledger) else {
            return false;
        };
        let blocked = matches!(event.outcome, Outcome::Blocked { .. });
        self.events.push(event);
        if !blocked {
            return true;
        }
        match self.wait_cycle(index) {
            Some(cycle) => {
                self.abort_newest(&cycle);
                true
            }
            None => false,
        }
    }

    /// Scripts on the wait-for cycle through `start`, if there is one.
    fn wait_cycle(&self, start: usize) -> Option<Vec<usize>> {
        let mut path = vec![start];
        let mut current = start;
        loop {
            let holder = self.runners[current].waiting_on?;
            let next = self
                .runners
                .iter()
                .position(|r| r.txn_id() == Some(holder))?;
            if next == start {
                return Some(path);
            }
            if path.contains(&next) {
                return None;
            }
            path.push(next);
            current = next;
        }
    }

    fn abort_newest(&mut self, candidates: &[usize]) {
        let Some(&victim) = candidates
            .iter()
            .max_by_key(|&&i| self.runners[i].age_key())
        else {
            return;
        };
        warn!(
            "Deadlock among scripts {:?}; aborting newest script {}",
            candidates, victim
        );
        self.events.extend(self.runners[victim].abort_waiting(victim));
    }

    /// Every script with statements left is waiting for a lock. Scripts
    /// that have run out of statements are committed first, since they may
    /// hold those locks; failing that the newest waiting transaction is
    /// aborted.
    fn resolve_stall(&mut self) {
        let mut committed = false;
        for index in 0..self.runners.len() {
            if !self.runners[index].has_next() {
                if let Some(event) = self.runners[index].finish(index) {
                    self.events.push(event);
                    committed = true;
                }
            }
        }
        if committed {
            return;
        }
        let waiting: Vec<usize> = (0..self.runners.len())
            .filter(|&i| self.runners[i].has_next())
            .collect();
        self.abort_newest(&waiting);
    }

    fn serial(&mut self) {
        for index in 0..self.runners.len() {
            while self.runners[index].has_next() {
                if !self.turn(index) {
                    // Only a transaction outside the schedule can hold the lock.
                    self.resolve_stall();
                }
            }
            self.events.extend(self.runners[index].finish(index));
        }
    }

    fn round_robin(&mut self, granularity: usize) {
        while self.runners.iter().any(Runner::has_next) {
            let mut progressed = false;
            for index in 0..self.runners.len() {
                for _ in 0..granularity {
                    if !self.turn(index) {
                        break;
                    }
                    progressed = true;
                }
            }
            if !progressed {
                self.resolve_stall();
            }
        }
    }

    fn explicit(&mut self, order: &[usize]) {
        for &index in order {
            self.turn(index);
        }
        // Whatever the order did not reach runs script by script.
        while self.runners.iter().any(Runner::has_next) {
            let mut progressed = false;
            for index in 0..self.runners.len() {
                while self.turn(index) {
                    progressed = true;
                }
            }
            if !progressed {
                self.resolve_stall();
            }
        }
    }

    fn into_trace(mut self) -> Trace {
        for index in 0..self.runners.len() {
            self.events.extend(self.runners[index].finish(index));
        }
        Trace {
            events: self.events,
            final_state: self.ledger.committed_state(),
        }
    }
}

fn execute(txn: &mut Transaction, op: &Op) -> Result<Outcome> {
    match op {
        Op::Read(key) => txn.read(key).map(Outcome::Read),
        Op::ReadForUpdate(key) => txn.read_for_update(key).map(Outcome::Read),
        Op::Scan(range) => txn.scan(range).map(Outcome::Rows),
        Op::Write(key, value) => txn
            .write(key.clone(), value.clone())
            .map(|()| Outcome::Written),
        Op::Add(key, delta) => {
            let before = match txn.read(key)? {
                None => 0,
                Some(value) => value.as_int().ok_or_else(|| {
                    LedgerError::InvalidSchedule(format!("'{}' does not hold an integer", key))
                })?,
            };
            let after = before.checked_add(*delta).ok_or_else(|| {
                LedgerError::InvalidSchedule(format!("'{}' overflows on {:+}", key, delta))
            })?;
            txn.write(key.clone(), after)?;
            Ok(Outcome::Added { before, after })
        }
        Op::Delete(key) => txn.delete(key).map(|()| Outcome::Written),
        Op::Commit => txn.commit().map(Outcome::Committed),
        Op::Rollback => txn.rollback().map(|()| Outcome::RolledBack),
    }
}

/// Runs interleaved transaction scripts against a private ledger.
///
/// A single thread drives every transaction, so the ledger never blocks
/// (`LockWait::NoWait`); the harness does the waiting instead. A statement
/// whose lock is taken is recorded as [`Outcome::Blocked`] and retried on
/// the script's next turn. When the waiting scripts form a cycle, the newest
/// transaction on it fails with `DeadlockAbort`.
///
/// ```
/// use isoledger::prelude::*;
///
/// let harness = AnomalyHarness::new(LedgerConfig::default());
/// harness.seed([("balance", 1000)]).unwrap();
///
/// let reader = Script::new("reader", IsolationLevel::ReadCommitted)
///     .read("balance")
///     .read("balance")
///     .commit();
/// let writer = Script::new("writer", IsolationLevel::ReadCommitted)
///     .add("balance", -100)
///     .commit();
///
/// let trace = harness
///     .run_schedule(&[reader, writer], &Interleaving::Explicit(vec![0, 1, 1, 0, 0]))
///     .unwrap();
/// assert_eq!(trace.reads(0), vec![Some(Value::Int(1000)), Some(Value::Int(900))]);
/// ```
pub struct AnomalyHarness {
    ledger: Ledger,
}

impl AnomalyHarness {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            ledger: Ledger::new(config.with_lock_wait(LockWait::NoWait)),
        }
    }

    /// The ledger schedules run against. State persists across runs.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Writes `pairs` in one committed transaction.
    pub fn seed<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<CommitSeq>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut txn = self.ledger.begin(IsolationLevel::ReadCommitted);
        for (key, value) in pairs {
            txn.write(key, value)?;
        }
        txn.commit()
    }

    /// Executes `scripts` in the order given by `interleaving` and returns
    /// what every statement observed.
    ///
    /// Each script runs in its own transaction, begun at its first statement.
    /// When a statement fails the transaction is rolled back and the rest of
    /// the script is recorded as [`Outcome::Skipped`]. If every script with
    /// statements left is waiting and none can be released by committing an
    /// idle script, the newest waiting transaction is aborted. Scripts that end
    /// without `Commit` or `Rollback` are committed at the end of the run
    /// (under [`Interleaving::Serial`], at the end of the script).
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidSchedule` for a zero round-robin
    /// granularity or an explicit entry naming a script that does not exist.
    /// Statement failures are part of the trace, not errors.
    pub fn run_schedule(&self, scripts: &[Script], interleaving: &Interleaving) -> Result<Trace> {
        validate(scripts, interleaving)?;
        let mut run = Run {
            ledger: &self.ledger,
            runners: scripts.iter().map(Runner::new).collect(),
            events: Vec::new(),
        };

        match interleaving {
            Interleaving::Serial => run.serial(),
            Interleaving::RoundRobin { granularity } => run.round_robin(*granularity),
            Interleaving::Explicit(order) => run.explicit(order),
        }

        let trace = run.into_trace();
        debug!(
            "Ran {} scripts: {} events, final state has {} keys",
            scripts.len(),
            trace.events.len(),
            trace.final_state.len()
        );
        Ok(trace)
    }
}

fn validate(scripts: &[Script], interleaving: &Interleaving) -> Result<()> {
    match interleaving {
        Interleaving::RoundRobin { granularity: 0 } => Err(LedgerError::InvalidSchedule(
            "round-robin granularity must be at least 1".to_string(),
        )),
        Interleaving::Explicit(order) => match order.iter().find(|&&i| i >= scripts.len()) {
            Some(index) => Err(LedgerError::InvalidSchedule(format!(
                "script index {} out of range ({} scripts)",
                index,
                scripts.len()
            ))),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}
