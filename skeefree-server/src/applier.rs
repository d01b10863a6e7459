//! The direct applier: an internal worker that owns one ready direct
//! migration per tick and runs its DDL against the production master.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{error, info};

use skeefree_core::{MigrationStatus, MigrationStrategy};

use crate::observer::{comment_migration_complete, comment_migration_failed};
use crate::topology::TopologyDb;
use crate::util::pretty_unique_token;
use crate::AppState;

/// Own and apply one ready direct migration, if any. The strategy guards
/// every CAS: if an operator retags the migration mid-flight the update
/// does not apply and the applier bows out.
pub async fn apply_next_migration(state: &Arc<AppState>) -> Result<()> {
    let token = pretty_unique_token();
    let Some(mut migration) = state
        .backend
        .own_ready_migration(MigrationStrategy::Direct, &token)?
    else {
        info!("direct-applier: no migration owned");
        return Ok(());
    };
    info!(
        pr = %migration.pr, canonical = %migration.canonical,
        strategy = %migration.strategy,
        "direct-applier: migration owned"
    );

    state.backend.update_migration_status(
        &migration,
        MigrationStatus::Ready,
        MigrationStatus::Running,
        MigrationStrategy::Direct,
    )?;
    migration.cluster = state
        .mysql_discovery_api
        .get_cluster(&migration.cluster.name)
        .await?;
    info!(
        canonical = %migration.canonical, cluster = %migration.cluster.name,
        rw = %migration.cluster.rw_name,
        "direct-applier: migration cluster"
    );

    let mut topology = TopologyDb::connect(&state.cfg, &migration).await?;
    {
        let running_comment = format!(
            "`skeefree` is running `{}` on `{}/{}` via `{}`",
            migration.canonical,
            migration.cluster.name,
            migration.repo.mysql_schema,
            migration.cluster.rw_name
        );
        if let Err(err) = state
            .github
            .add_pull_request_comment(
                &migration.pr.org,
                &migration.pr.repo,
                migration.pr.number,
                &running_comment,
            )
            .await
        {
            error!(error = %err, "apply_next_migration: comment");
        }
    }

    // Friendly health check before any DDL runs.
    let read_only = topology.ping_read_only().await?;
    if read_only {
        return Err(anyhow!(
            "attempt to run migration: host found to be read only for `{}/{}` via `{}`",
            migration.cluster.name,
            migration.repo.mysql_schema,
            migration.cluster.rw_name
        ));
    }
    info!(canonical = %migration.canonical, read_only, "direct-applier: ping");

    // Actually run the statement.
    if let Err(err) = topology.exec(&migration.pr_statement.statement).await {
        let _ = state.backend.update_migration_status(
            &migration,
            MigrationStatus::Running,
            MigrationStatus::Failed,
            MigrationStrategy::Direct,
        );
        if let Err(comment_err) = comment_migration_failed(state, &migration).await {
            error!(error = %comment_err, "apply_next_migration: comment");
        }
        return Err(err);
    }

    state.backend.update_migration_status(
        &migration,
        MigrationStatus::Running,
        MigrationStatus::Complete,
        MigrationStrategy::Direct,
    )?;
    if let Err(err) = comment_migration_complete(state, &migration).await {
        error!(error = %err, "apply_next_migration: comment");
    }
    Ok(())
}
