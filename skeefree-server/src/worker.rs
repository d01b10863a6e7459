//! Worker ownership commands: the CLI surface an external
//! online-schema-change worker invokes to claim a ready migration and to
//! report its progress. Ownership is exclusive via the token CAS; status
//! updates double as liveness heartbeats.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::info;

use skeefree_core::{Migration, MigrationStatus};

use crate::observer::{
    comment_migration_complete, comment_migration_failed, comment_migration_noop_complete,
    comment_migration_started,
};
use crate::util::hostname_token;
use crate::AppState;

pub const MIGRATION_OWN: &str = "migration-own";
pub const MIGRATION_STARTED: &str = "migration-started";
pub const MIGRATION_RUNNING: &str = "migration-running";
pub const MIGRATION_NOOP_COMPLETE: &str = "migration-noop-complete";
pub const MIGRATION_COMPLETE: &str = "migration-complete";
pub const MIGRATION_FAILED: &str = "migration-failed";

/// The JSON envelope handed to the worker on successful ownership; the
/// worker feeds this into gh-ost.
#[derive(Debug, Serialize)]
pub struct GhostMigration {
    pub cluster: String,
    pub shard: String,
    pub cluster_shard: String,
    pub schema: String,
    pub table: String,
    pub alter: String,
    pub suggestion: String,
    pub token: String,
    pub author: String,
}

pub async fn run_command(state: &Arc<AppState>, command: &str, token: &str) -> Result<()> {
    info!(command, "cli: running command");
    match command {
        MIGRATION_OWN => handle_migration_own(state, token).await,
        MIGRATION_STARTED => handle_migration_started(state, token).await,
        MIGRATION_RUNNING => handle_migration_running(state, token).await,
        MIGRATION_NOOP_COMPLETE => handle_migration_noop_complete(state, token).await,
        MIGRATION_COMPLETE => handle_migration_complete(state, token).await,
        MIGRATION_FAILED => handle_migration_failed(state, token).await,
        other => Err(anyhow!("unknown command: {}", other)),
    }
}

/// Uniformly pick a single migration out of the given slice.
fn pick_migration(migrations: &[Migration]) -> Option<&Migration> {
    migrations.choose(&mut rand::thread_rng())
}

async fn handle_migration_own(state: &Arc<AppState>, token: &str) -> Result<()> {
    if !token.is_empty() {
        return Err(anyhow!(
            "migration-own: generates its own token; received token {}",
            token
        ));
    }
    let token = hostname_token()?;
    let instance = state.sites_api.get_instance(&token).await?;

    if let Some(existing) = state.backend.read_migration_by_token(&token)? {
        return Err(anyhow!(
            "found existing migration with token {}: {}. Will not own a new migration with this token",
            token,
            existing.canonical
        ));
    }
    // Token is valid, no existing migration for this token.

    let migrations = state.backend.read_ghost_ready_migrations(&instance.site)?;
    let Some(picked) = pick_migration(&migrations) else {
        info!("cli: no migration picked");
        return Ok(());
    };

    let Some(migration) = state.backend.own_migration(picked, &token)? else {
        info!("cli: no migration owned");
        return Ok(());
    };
    // Migration is owned!
    info!(
        pr = %migration.pr, canonical = %migration.canonical,
        strategy = %migration.strategy,
        "cli: migration owned"
    );

    let envelope = GhostMigration {
        cluster: migration.cluster.name.clone(),
        shard: migration.shard.clone(),
        cluster_shard: migration.eval_cluster_name(),
        schema: migration.repo.mysql_schema.clone(),
        table: migration.table_name.clone(),
        alter: migration.alter.clone(),
        suggestion: migration.suggestion.clone(),
        token: migration.token.clone(),
        author: migration.pr.author.clone(),
    };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

async fn handle_migration_started(state: &Arc<AppState>, token: &str) -> Result<()> {
    let migration = update_migration_status(
        state,
        token,
        MigrationStatus::Running,
        &[MigrationStatus::Ready, MigrationStatus::Running],
    )?;
    comment_migration_started(state, &migration).await
}

/// A liveness heartbeat: re-asserts `running`, which refreshes the
/// liveness timestamp.
async fn handle_migration_running(state: &Arc<AppState>, token: &str) -> Result<()> {
    update_migration_status(
        state,
        token,
        MigrationStatus::Running,
        &[MigrationStatus::Ready, MigrationStatus::Running],
    )?;
    Ok(())
}

async fn handle_migration_noop_complete(state: &Arc<AppState>, token: &str) -> Result<()> {
    let migration = state
        .backend
        .read_migration_by_token(token)?
        .ok_or_else(|| anyhow!("unknown migration with token {}", token))?;
    comment_migration_noop_complete(state, &migration).await
}

async fn handle_migration_complete(state: &Arc<AppState>, token: &str) -> Result<()> {
    let migration =
        update_migration_status(state, token, MigrationStatus::Complete, &[MigrationStatus::Running])?;
    comment_migration_complete(state, &migration).await
}

async fn handle_migration_failed(state: &Arc<AppState>, token: &str) -> Result<()> {
    let migration = update_migration_status(
        state,
        token,
        MigrationStatus::Failed,
        &[MigrationStatus::Ready, MigrationStatus::Running],
    )?;
    comment_migration_failed(state, &migration).await
}

fn update_migration_status(
    state: &Arc<AppState>,
    token: &str,
    to_status: MigrationStatus,
    from_statuses: &[MigrationStatus],
) -> Result<Migration> {
    let migration = state
        .backend
        .read_migration_by_token(token)?
        .ok_or_else(|| anyhow!("unknown migration with token {}", token))?;
    if !from_statuses.contains(&migration.status) {
        return Err(anyhow!(
            "migration status is {}, cannot update to '{}'",
            migration.status,
            to_status
        ));
    }
    let rows_affected = state.backend.update_migration_status(
        &migration,
        migration.status,
        to_status,
        migration.strategy,
    )?;
    if rows_affected == 0 {
        return Err(anyhow!(
            "no rows affected in updating migration status; token={}",
            token
        ));
    }
    Ok(migration)
}
