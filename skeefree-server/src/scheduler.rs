//! The two schedulers that move migrations from queued to ready: the
//! direct scheduler promotes a whole PR's direct migrations as a set, and
//! the online scheduler promotes one ghost migration per tick subject to
//! per-(cluster, shard) exclusivity.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use skeefree_core::{Instance, Migration, MigrationStatus, MigrationStrategy, PullRequest};

use crate::topology::TopologyDb;
use crate::AppState;

#[derive(Default)]
struct PrMigrationStatusCount {
    pr: PullRequest,
    direct_queued: usize,
    direct_ready: usize,
    complete: usize,
    total: usize,
}

impl PrMigrationStatusCount {
    /// A PR is fulfillable by direct migrations iff all of its active
    /// migrations are direct-queued, direct-ready or complete, with at
    /// least one direct-queued among them.
    fn fulfillable_by_direct_migrations(&self) -> bool {
        if self.direct_queued == 0 {
            return false;
        }
        self.direct_queued + self.direct_ready + self.complete == self.total
    }
}

/// PRs (in first-seen order, which is priority desc then id asc) whose
/// pending work consists purely of direct migrations.
fn find_prs_fulfillable_by_direct_migrations(migrations: &[Migration]) -> Vec<PullRequest> {
    let mut pr_count_map: HashMap<i64, PrMigrationStatusCount> = HashMap::new();
    let mut ordered_prs: Vec<i64> = Vec::new();
    for m in migrations {
        let entry = pr_count_map.entry(m.pr.id).or_insert_with(|| {
            ordered_prs.push(m.pr.id);
            PrMigrationStatusCount {
                pr: m.pr.clone(),
                ..Default::default()
            }
        });
        entry.total += 1;
        if m.status == MigrationStatus::Queued && m.strategy == MigrationStrategy::Direct {
            entry.direct_queued += 1;
        }
        if m.status == MigrationStatus::Ready && m.strategy == MigrationStrategy::Direct {
            entry.direct_ready += 1;
        }
        if m.status == MigrationStatus::Complete {
            entry.complete += 1;
        }
    }
    ordered_prs
        .into_iter()
        .filter(|id| pr_count_map[id].fulfillable_by_direct_migrations())
        .map(|id| pr_count_map[&id].pr.clone())
        .collect()
}

/// Promote the first direct-fulfillable PR: all of its direct-queued
/// migrations become ready in one CAS, so a worker never observes a
/// half-ready PR.
pub async fn schedule_next_direct_migrations(state: &Arc<AppState>) -> Result<()> {
    let strategy = MigrationStrategy::Direct;
    let migrations = state.backend.read_non_cancelled_migrations(None)?;
    let fulfillable_prs = find_prs_fulfillable_by_direct_migrations(&migrations);
    let Some(pr) = fulfillable_prs.first() else {
        // No PRs fulfillable by direct migrations.
        return Ok(());
    };
    let rows_affected = state.backend.update_pr_migrations_status(
        pr,
        MigrationStatus::Queued,
        MigrationStatus::Ready,
        strategy,
    )?;
    info!(pr = %pr, strategy = %strategy, affected = rows_affected, "scheduler: scheduled");
    Ok(())
}

/// Whether the given ghost migration conflicts with another migration on
/// the same (cluster, shard). A ready peer may kick in within seconds and
/// a running peer already occupies the topology, so either blocks
/// scheduling.
fn ghost_migration_conflicts(migration: &Migration, migrations: &[Migration]) -> bool {
    for m in migrations {
        if m.id == migration.id {
            // Don't compare a migration against itself.
            continue;
        }
        if m.cluster.name != migration.cluster.name {
            continue;
        }
        if m.shard != migration.shard {
            continue;
        }
        if m.status == MigrationStatus::Ready || m.status == MigrationStatus::Running {
            return true;
        }
    }
    false
}

/// Resolve the master instance behind the migration's cluster: connect to
/// the RW endpoint, ask the server its own hostname, and look that host up
/// in the site inventory.
async fn get_migration_master_instance(
    state: &Arc<AppState>,
    migration: &mut Migration,
) -> Result<Instance> {
    migration.cluster = state
        .mysql_discovery_api
        .get_cluster(&migration.cluster.name)
        .await?;
    let mut topology = TopologyDb::connect(&state.cfg, migration).await?;
    let master_hostname = topology.master_hostname().await?;
    info!(migration = %migration.canonical, master_hostname = %master_hostname, "get_migration_master_instance");
    state.sites_api.get_instance(&master_hostname).await
}

/// Promote at most one queued ghost migration: the first (in priority
/// order) with no (cluster, shard) conflict. Its token hint is set to the
/// master's site before the CAS so workers in that site get first claim.
pub async fn schedule_next_ghost_migration(state: &Arc<AppState>) -> Result<()> {
    let strategy = MigrationStrategy::Ghost;
    let migrations = state.backend.read_non_cancelled_migrations(None)?;
    // The read is in priority desc, id asc order: the perfect order for
    // this scheduler.
    for migration in &migrations {
        if migration.strategy != strategy {
            continue;
        }
        // A "queued" status implicitly means the migration has been
        // approved by DBInfra.
        if migration.status != MigrationStatus::Queued {
            continue;
        }
        if ghost_migration_conflicts(migration, &migrations) {
            continue;
        }
        let mut migration = migration.clone();
        let instance = get_migration_master_instance(state, &mut migration).await?;
        // Looking good! This is the migration we're going to schedule.
        state
            .backend
            .update_migration_token_hint(&migration, &instance.site)?;
        let rows_affected = state.backend.update_migration_status(
            &migration,
            MigrationStatus::Queued,
            MigrationStatus::Ready,
            strategy,
        )?;
        info!(
            pr = %migration.pr, canonical = %migration.canonical,
            strategy = %strategy, affected = rows_affected,
            "scheduler: scheduled"
        );
        return Ok(());
    }
    // Got here? Nothing to schedule.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration_with(pr_id: i64, status: MigrationStatus, strategy: MigrationStrategy) -> Migration {
        let mut m = Migration::default();
        m.pr.id = pr_id;
        m.status = status;
        m.strategy = strategy;
        m
    }

    fn sharded_migration(
        id: i64,
        cluster: &str,
        shard: &str,
        status: MigrationStatus,
    ) -> Migration {
        let mut m = Migration::default();
        m.id = id;
        m.cluster.name = cluster.to_string();
        m.shard = shard.to_string();
        m.status = status;
        m.strategy = MigrationStrategy::Ghost;
        m
    }

    #[test]
    fn test_find_prs_fulfillable_by_direct_migrations() {
        let migrations = vec![
            migration_with(1, MigrationStatus::Queued, MigrationStrategy::Direct),
            migration_with(1, MigrationStatus::Ready, MigrationStrategy::Direct),
            migration_with(1, MigrationStatus::Complete, MigrationStrategy::Ghost),
            //
            migration_with(2, MigrationStatus::Queued, MigrationStrategy::Direct),
            migration_with(2, MigrationStatus::Queued, MigrationStrategy::Ghost),
            migration_with(2, MigrationStatus::Complete, MigrationStrategy::Ghost),
            //
            migration_with(3, MigrationStatus::Queued, MigrationStrategy::Direct),
            migration_with(3, MigrationStatus::Queued, MigrationStrategy::Direct),
        ];
        let prs = find_prs_fulfillable_by_direct_migrations(&migrations);
        assert_eq!(prs.len(), 2);
        assert_eq!(prs[0].id, 1);
        assert_eq!(prs[1].id, 3);
    }

    #[test]
    fn test_not_fulfillable_without_direct_queued() {
        let migrations = vec![
            migration_with(1, MigrationStatus::Ready, MigrationStrategy::Direct),
            migration_with(1, MigrationStatus::Complete, MigrationStrategy::Direct),
        ];
        assert!(find_prs_fulfillable_by_direct_migrations(&migrations).is_empty());
    }

    #[test]
    fn test_ghost_migration_conflicts() {
        let candidate = sharded_migration(1, "main", "0001", MigrationStatus::Queued);
        {
            // Running peer on the same cluster/shard: conflict.
            let peers = vec![
                candidate.clone(),
                sharded_migration(2, "main", "0001", MigrationStatus::Running),
            ];
            assert!(ghost_migration_conflicts(&candidate, &peers));
        }
        {
            // Ready peer on the same cluster/shard: conflict.
            let peers = vec![
                candidate.clone(),
                sharded_migration(2, "main", "0001", MigrationStatus::Ready),
            ];
            assert!(ghost_migration_conflicts(&candidate, &peers));
        }
        {
            // Other shard, other cluster, or non-imminent status: no conflict.
            let peers = vec![
                candidate.clone(),
                sharded_migration(2, "main", "0002", MigrationStatus::Running),
                sharded_migration(3, "other", "0001", MigrationStatus::Running),
                sharded_migration(4, "main", "0001", MigrationStatus::Queued),
                sharded_migration(5, "main", "0001", MigrationStatus::Complete),
            ];
            assert!(!ghost_migration_conflicts(&candidate, &peers));
        }
        {
            // A migration never conflicts with itself.
            let peers = vec![candidate.clone()];
            assert!(!ghost_migration_conflicts(&candidate, &peers));
        }
    }
}
