//! Diffs a configuration snapshot against the registry.

use super::registry::WorkerMetadata;
use crate::config::{ConfigSnapshot, ConfigSource};
use tracing::{error, info, warn};

/// Counts of the transitions applied by one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub purged: usize,
}

/// Applies `snapshot` to the registry and refills the work queues.
///
/// Jobs keep their runtime state; only `db_state` (and, for updates, the
/// config and restart schedule) changes.
pub fn reconcile(registry: &mut WorkerMetadata, snapshot: ConfigSnapshot) -> ReconcileSummary {
    let mut summary = ReconcileSummary {
        purged: registry.purge_removed_jobs().len(),
        ..ReconcileSummary::default()
    };

    let missing: Vec<_> = registry
        .job_ids()
        .into_iter()
        .filter(|id| !snapshot.contains_key(id))
        .collect();

    for (id, config) in snapshot {
        let previous_mtime = registry.job(id).map(|job| job.config.mtime);
        let result = match previous_mtime {
            None => {
                registry.add_new_job(id, config);
                summary.added += 1;
                Ok(())
            }
            Some(old) if config.mtime > old => {
                summary.updated += 1;
                registry.update_job(id, config)
            }
            Some(_) => {
                summary.unchanged += 1;
                registry.mark_as_unchanged(id)
            }
        };
        if let Err(e) = result {
            error!(job_id = id, error = %e, "reconciliation step failed");
        }
    }

    for id in missing {
        match registry.remove_job(id) {
            Ok(()) => summary.removed += 1,
            Err(e) => error!(job_id = id, error = %e, "reconciliation step failed"),
        }
    }

    registry.update_state_sync_map();
    summary
}

/// Loads a snapshot from `source` and reconciles it.
///
/// A failed load leaves the registry untouched and returns `None`.
pub fn poll_source(
    source: &mut dyn ConfigSource,
    registry: &mut WorkerMetadata,
) -> Option<ReconcileSummary> {
    match source.load_configuration() {
        Ok(snapshot) => {
            let summary = reconcile(registry, snapshot);
            info!(
                added = summary.added,
                updated = summary.updated,
                removed = summary.removed,
                unchanged = summary.unchanged,
                purged = summary.purged,
                "configuration reconciled"
            );
            Some(summary)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(error = %message, "configuration load failed, skipping reconciliation");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
