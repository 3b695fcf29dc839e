//! Startup recovery
//!
//! Runs once before the engine hands out sessions. Interrupted safe writes are
//! resolved first, then every leftover transaction folder of every partition
//! is either discarded (no decision marker) or replayed to completion.

use crate::journal::Transaction;
use crate::middleware::FileStore;
use crate::safe_io::{integrity_check, remove_all};
use std::fs;
use std::path::Path;
use tessera_common::{Error, Result, TRANSACTIONS_DIR};
use tracing::{debug, info};

/// Outcome of a recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Undecided transactions removed
    pub discarded: usize,
    /// Decided transactions replayed to completion
    pub replayed: usize,
    /// Interrupted safe writes or deletes resolved
    pub repaired: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Recover every partition under `partitions_dir`
///
/// Any failure is reported as [`Error::RecoveryFailed`]; the directory must
/// not be served afterwards.
pub fn recover(partitions_dir: &Path, files: &FileStore) -> Result<RecoveryReport> {
    run(partitions_dir, files).map_err(|e| match e {
        Error::RecoveryFailed(_) => e,
        other => Error::RecoveryFailed(other.to_string()),
    })
}

fn run(partitions_dir: &Path, files: &FileStore) -> Result<RecoveryReport> {
    let mut report = RecoveryReport {
        repaired: integrity_check(partitions_dir)?,
        ..Default::default()
    };

    for entry in fs::read_dir(partitions_dir)? {
        let partition = entry?.path();
        if !partition.is_dir() {
            continue;
        }
        recover_partition(&partition, files, &mut report)?;
    }

    if report.is_clean() {
        debug!("Recovery found nothing to do in {:?}", partitions_dir);
    } else {
        info!(
            "Recovery complete: {} discarded, {} replayed, {} repaired",
            report.discarded, report.replayed, report.repaired
        );
    }
    Ok(report)
}

fn recover_partition(root: &Path, files: &FileStore, report: &mut RecoveryReport) -> Result<()> {
    let transactions = root.join(TRANSACTIONS_DIR);
    if !transactions.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(&transactions)? {
        let dir = entry?.path();

        if !Transaction::is_committed(&dir) {
            debug!("Discarding undecided transaction {:?}", dir);
            remove_all(&dir)?;
            report.discarded += 1;
            continue;
        }

        info!("Replaying committed transaction {:?}", dir);
        let mut txn = Transaction::load(&dir, root, files.clone())?;
        txn.resume()?;
        report.replayed += 1;
    }
    Ok(())
}
