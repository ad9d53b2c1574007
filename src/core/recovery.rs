//! Crash recovery from the journal.
//!
//! Replays every change not belonging to an aborted transaction, rebuilds
//! the B-tree branch level from the leaf chain, then undoes the changes of
//! transactions that never committed. The journal is truncated afterwards.

use crate::core::constants::TransactionID;
use crate::core::errors::*;
use crate::core::loggable::{LogEntry, LogRecord};
use crate::core::record_store::RecordStore;
use std::collections::{BTreeSet, HashSet};

/// Outcome of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    /// Journal records read.
    pub records: usize,
    /// Records passed to redo; the page LSN decides whether each applies.
    pub replayed: usize,
    /// Transactions with a commit record.
    pub committed: Vec<TransactionID>,
    /// Transactions rolled back because they neither committed nor aborted.
    pub losers: Vec<TransactionID>,
    /// Records undone on behalf of losers.
    pub undone: usize,
}

/// Committed, aborted and incomplete transactions.
type Outcomes = (
    BTreeSet<TransactionID>,
    HashSet<TransactionID>,
    BTreeSet<TransactionID>,
);

fn classify(records: &[LogRecord]) -> Outcomes {
    let mut committed = BTreeSet::new();
    let mut aborted = HashSet::new();
    let mut active = BTreeSet::new();
    for record in records {
        match record.entry {
            LogEntry::TxnCommit => {
                committed.insert(record.txn_id);
            }
            LogEntry::TxnAbort => {
                aborted.insert(record.txn_id);
            }
            LogEntry::Checkpoint => {}
            _ => {
                active.insert(record.txn_id);
            }
        }
    }
    let losers = active
        .into_iter()
        .filter(|id| !committed.contains(id) && !aborted.contains(id))
        .collect();
    (committed, aborted, losers)
}

/// Brings the store's pages in line with its journal.
pub fn recover(store: &RecordStore) -> Result<RecoveryReport> {
    let journal = match store.journal() {
        Some(journal) => journal,
        None => return Ok(RecoveryReport::default()),
    };
    let records = journal.read_all()?;
    let mut report = RecoveryReport {
        records: records.len(),
        ..Default::default()
    };
    if records.is_empty() {
        return Ok(report);
    }

    let (committed, aborted, losers) = classify(&records);
    log::info!(
        "recovering {}: {} records, {} committed, {} aborted, {} incomplete transactions",
        store.file().path().display(),
        records.len(),
        committed.len(),
        aborted.len(),
        losers.len()
    );

    // Redo
    for record in &records {
        if record.entry.is_control() || aborted.contains(&record.txn_id) {
            continue;
        }
        store.redo(record)?;
        report.replayed += 1;
    }

    // Branch pages are never journaled
    store.index().rebuild(true)?;

    // Undo
    if !losers.is_empty() {
        for record in records.iter().rev() {
            if record.entry.is_control() || !losers.contains(&record.txn_id) {
                continue;
            }
            store.undo(record)?;
            report.undone += 1;
        }
        log::info!(
            "rolled back {} records of {} incomplete transactions",
            report.undone,
            losers.len()
        );
    }

    store.flush()?;
    journal.checkpoint()?;

    report.committed = committed.into_iter().collect();
    report.losers = losers.into_iter().collect();
    log::info!("recovery finished: {} records replayed", report.replayed);
    Ok(report)
}
