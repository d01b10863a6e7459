//! The periodic control loops. Every replica runs the election ticker;
//! all mutating loops are leader-only. Each tick spawns its work as its
//! own task, so a slow tick never delays another timer; the backend CAS
//! discipline absorbs any overlap.

use std::sync::Arc;

use anyhow::Result;
use tokio::time::{interval, Duration};
use tracing::error;

use skeefree_core::MigrationStatus;

use crate::applier::apply_next_migration;
use crate::observer::{detect_and_mark_completed_prs, detect_approved_prs, probe_known_open_prs};
use crate::scheduler::{schedule_next_direct_migrations, schedule_next_ghost_migration};
use crate::AppState;

const ELECTION_INTERVAL: Duration = Duration::from_secs(1);
const STATE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const PR_SEARCH_INTERVAL: Duration = Duration::from_secs(60);
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);
const DIRECT_APPLIER_INTERVAL: Duration = Duration::from_secs(60);

const STALE_MIGRATION_MINUTES: i64 = 10;

/// Reserved for future leader-side checks.
async fn state_check(state: &Arc<AppState>) -> Result<()> {
    if !state.backend.is_leader() {
        return Ok(());
    }
    Ok(())
}

/// Routinely assert and observe leadership state.
pub async fn continuous_elections(state: Arc<AppState>) {
    let mut ticker = interval(ELECTION_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = state.backend.attempt_leadership() {
            error!(error = %err, "attempt_leadership");
        }
        if let Err(err) = state.backend.refresh_leadership() {
            error!(error = %err, "refresh_leadership");
        }
    }
}

/// All periodic mutation loops, each on its own independent ticker.
pub async fn continuous_operations(state: Arc<AppState>) {
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(STATE_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = state_check(&state).await {
                        error!(error = %err, "state_check");
                    }
                });
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(PR_SEARCH_INTERVAL);
            loop {
                ticker.tick().await;
                if !state.backend.is_leader() {
                    continue;
                }
                let state = state.clone();
                tokio::spawn(async move {
                    // Detection, refresh and the completion sweep are
                    // sequential within the tick: a re-evaluation that
                    // inserts rows must not race the sweep on the same PR.
                    if let Err(err) = detect_approved_prs(&state).await {
                        error!(error = %err, "detect_approved_prs");
                    }
                    if let Err(err) = probe_known_open_prs(&state).await {
                        error!(error = %err, "probe_known_open_prs");
                    }
                    if let Err(err) = detect_and_mark_completed_prs(&state).await {
                        error!(error = %err, "detect_and_mark_completed_prs");
                    }
                });
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SCHEDULER_INTERVAL);
            loop {
                ticker.tick().await;
                if !state.backend.is_leader() {
                    continue;
                }
                {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = schedule_next_direct_migrations(&state).await {
                            error!(error = %err, "schedule_next_direct_migrations");
                        }
                    });
                }
                {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = schedule_next_ghost_migration(&state).await {
                            error!(error = %err, "schedule_next_ghost_migration");
                        }
                    });
                }
                {
                    let state = state.clone();
                    tokio::spawn(async move {
                        expire_stale_migrations(&state);
                    });
                }
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(DIRECT_APPLIER_INTERVAL);
            loop {
                ticker.tick().await;
                if !state.backend.is_leader() {
                    continue;
                }
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = apply_next_migration(&state).await {
                        error!(error = %err, "apply_next_migration");
                    }
                });
            }
        });
    }
}

/// The staleness reaper: release orphaned early leases, declare silent
/// workers dead, and double-ensure token cleanup on terminal states.
fn expire_stale_migrations(state: &Arc<AppState>) {
    let sweeps = [
        (MigrationStatus::Ready, MigrationStatus::Ready),
        (MigrationStatus::Running, MigrationStatus::Failed),
        (MigrationStatus::Complete, MigrationStatus::Complete),
        (MigrationStatus::Failed, MigrationStatus::Failed),
    ];
    for (in_status, to_status) in sweeps {
        if let Err(err) =
            state
                .backend
                .expire_stale_migrations(in_status, to_status, STALE_MIGRATION_MINUTES)
        {
            error!(error = %err, "expire_stale_migrations");
        }
    }
}
