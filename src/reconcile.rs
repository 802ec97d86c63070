//! Two pass conflict resolution for concurrently edited file histories.
//!
//! Remote database versions are applied in their deterministic causal
//! order. The first pass settles divergence inside a single history
//! (two clients extended the same file concurrently), the second pass
//! clears path collisions between distinct histories. Every decision is
//! derived from fields that travel with the versions themselves, so any
//! two clients looking at the same set of versions resolve them the
//! same way, no matter in how many rounds they arrived.

use tracing::{debug, info};

use crate::{
    database::{Database, DatabaseError},
    file::{conflicted_copy_path, FileHistory, FileStatus, FileVersion},
    ids::{ClientId, FileHistoryId},
    version::DatabaseVersion,
};

/// What one merge round did to the database.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Histories accepted without losing anything local.
    pub accepted: usize,
    /// New history ids minted for branched local suffixes.
    pub branched: Vec<FileHistoryId>,
    /// Histories whose divergent suffix was discarded.
    pub pruned: Vec<FileHistoryId>,
    /// Histories renamed to a conflicted copy in the path pass.
    pub renamed: Vec<FileHistoryId>,
    /// Histories demoted to a merged marker in the path pass.
    pub merged: Vec<FileHistoryId>,
}

/// The result of merging remote versions.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Counters and ids of every resolution decision taken.
    pub report: MergeReport,
    /// Partial histories created by resolution that still have to be
    /// published: branched copies and conflicted copy amendments.
    pub pending: Vec<FileHistory>,
}

impl MergeOutcome {
    /// Whether resolution produced anything that needs publishing.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Merge remote database versions into the database.
///
/// `versions` must already be in apply order (see
/// [`crate::branch::sort_causal`]). Entities merge by identity; histories
/// run through conflict resolution first so that the insert below never
/// sees divergence. A failed round is safe to retry: a version only
/// reaches resolution once its references check out, and everything
/// applied before the failure merged idempotently.
pub fn merge_remote(
    db: &mut Database,
    local: &ClientId,
    versions: Vec<DatabaseVersion>,
) -> Result<MergeOutcome, DatabaseError> {
    let mut outcome = MergeOutcome::default();
    for mut version in versions {
        // resolution truncates and branches histories in place, so a
        // version must prove its references before any of that runs
        db.validate_entities(&version)?;
        let histories = version.take_histories();
        let mut admitted = Vec::new();
        for history in histories {
            if let Some(history) = resolve_divergence(db, local, history, &mut outcome)? {
                admitted.push(history);
            }
        }
        version.replace_histories(admitted);
        db.insert(version)?;
    }
    resolve_path_collisions(db, &mut outcome)?;
    Ok(outcome)
}

/// First pass: settle the candidate history against the accepted one.
///
/// Returns the part of the candidate that may be inserted, or `None` if
/// nothing of it survives.
fn resolve_divergence(
    db: &mut Database,
    local: &ClientId,
    mut candidate: FileHistory,
    outcome: &mut MergeOutcome,
) -> Result<Option<FileHistory>, DatabaseError> {
    let id = *candidate.id();
    let Some(accepted) = db.file_history(&id) else {
        outcome.report.accepted += 1;
        return Ok(Some(candidate));
    };

    // first version number present on both sides with different content
    let divergence = candidate
        .versions()
        .find_map(|theirs| match accepted.get(theirs.version) {
            Some(ours) if ours != theirs => Some(theirs.version),
            _ => None,
        });
    let Some(at) = divergence else {
        // pure extension or already known, the insert below unions it
        outcome.report.accepted += 1;
        return Ok(Some(candidate));
    };

    let ours = accepted
        .get(at)
        .cloned()
        .ok_or(DatabaseError::Divergent {
            history: id,
            version: at,
        })?;
    let theirs = candidate
        .get(at)
        .cloned()
        .ok_or(DatabaseError::Divergent {
            history: id,
            version: at,
        })?;

    if first_wins(&theirs, &ours) {
        // the candidate continues this history; our suffix loses
        let removed = db.truncate_history(&id, at);
        settle_losing_suffix(db, local, id, at, removed, outcome)?;
        Ok(Some(candidate))
    } else {
        // our side stands; the candidate keeps only what matches
        let removed = candidate.truncate_from(at);
        settle_losing_suffix(db, local, id, at, removed, outcome)?;
        Ok((!candidate.is_empty()).then_some(candidate))
    }
}

/// Decide what happens to the losing suffix of a divergence.
///
/// A suffix authored entirely by the local client is this client's own
/// work, no matter which side of the divergence carried it, and is kept
/// as a branched copy. Anything else is dropped; its author runs the
/// same resolution and branches it over there.
fn settle_losing_suffix(
    db: &mut Database,
    local: &ClientId,
    id: FileHistoryId,
    at: u64,
    suffix: Vec<FileVersion>,
    outcome: &mut MergeOutcome,
) -> Result<(), DatabaseError> {
    let local_work = !suffix.is_empty()
        && suffix
            .iter()
            .all(|v| v.created_by.as_ref() == Some(local));
    if local_work {
        let branched = branch_suffix(&id, local, suffix)?;
        info!(
            "history {id} lost versions {at}.. to a concurrent edit, branched as {}",
            branched.id()
        );
        outcome.report.branched.push(*branched.id());
        db.adopt_history(branched.clone());
        outcome.pending.push(branched);
    } else {
        debug!("history {id} lost versions {at}.. to a concurrent edit, pruned");
        outcome.report.pruned.push(id);
    }
    Ok(())
}

/// Whether `a` beats `b` in a divergence.
///
/// The earlier `updated` stamp wins. On an exact tie the full field
/// order of [`FileVersion`] decides, so the outcome never depends on
/// which side is evaluated first.
fn first_wins(a: &FileVersion, b: &FileVersion) -> bool {
    a.updated.cmp(&b.updated).then_with(|| a.cmp(b)).is_lt()
}

/// Rewrite a losing local suffix as a new independent file.
///
/// The new id is derived from the origin history, the divergence point
/// and the owning client, so replaying the same resolution mints the
/// same id instead of piling up duplicates.
fn branch_suffix(
    origin: &FileHistoryId,
    local: &ClientId,
    suffix: Vec<FileVersion>,
) -> Result<FileHistory, DatabaseError> {
    let at = suffix.first().map(|v| v.version).unwrap_or(1);
    let mut branched = FileHistory::new(origin.derive_branch(at, local));
    for (offset, mut version) in suffix.into_iter().enumerate() {
        version.version = offset as u64 + 1;
        if offset == 0 {
            version.status = FileStatus::New;
        }
        branched.add(version)?;
    }
    Ok(branched)
}

/// Second pass: no two live histories may own the same path.
///
/// Groups the current last versions by path and demotes everyone but
/// the winner, which is the entry with the smallest `(updated, id)`
/// pair. A loser with the winner's checksum becomes a terminal merged
/// marker whose path and checksum keep pointing at the winning file; a
/// loser with different content is renamed to a conflicted copy and
/// stays live. Renames can collide again (the synthesized name may
/// already be taken), so the sweep repeats until the namespace is
/// clean; every re-rename strictly lengthens the path, which bounds
/// the loop.
fn resolve_path_collisions(
    db: &mut Database,
    outcome: &mut MergeOutcome,
) -> Result<(), DatabaseError> {
    loop {
        let mut groups: std::collections::BTreeMap<String, Vec<(FileHistoryId, FileVersion)>> =
            Default::default();
        for history in db.file_histories() {
            if let Some(last) = history.last() {
                if !last.status.is_terminal() {
                    groups
                        .entry(last.path.clone())
                        .or_default()
                        .push((*history.id(), last.clone()));
                }
            }
        }
        groups.retain(|_, entries| entries.len() > 1);
        if groups.is_empty() {
            return Ok(());
        }

        for (path, mut entries) in groups {
            entries.sort_by(|(id_a, a), (id_b, b)| (a.updated, id_a).cmp(&(b.updated, id_b)));
            let mut entries = entries.into_iter();
            let (winner_id, winner) = match entries.next() {
                Some(entry) => entry,
                None => continue,
            };
            debug!("path {path:?} is contested, history {winner_id} wins");
            for (loser_id, loser) in entries {
                let amendment = if loser.checksum == winner.checksum {
                    info!("history {loser_id} merged into {winner_id} at {path:?}");
                    outcome.report.merged.push(loser_id);
                    FileVersion {
                        version: loser.version + 1,
                        status: FileStatus::Merged,
                        ..loser.clone()
                    }
                } else {
                    let renamed = conflicted_copy_path(&loser);
                    info!("history {loser_id} renamed to conflicted copy {renamed:?}");
                    outcome.report.renamed.push(loser_id);
                    FileVersion {
                        version: loser.version + 1,
                        path: renamed,
                        status: FileStatus::Renamed,
                        ..loser.clone()
                    }
                };
                // the amendment reuses the loser's own stamp and author,
                // so every client synthesizes identical bytes for it
                db.append_version(&loser_id, amendment.clone())?;
                let mut partial = FileHistory::new(loser_id);
                partial.add(amendment)?;
                outcome.pending.push(partial);
            }
        }
    }
}
