//! The PR observer: detects candidate PRs on the host, enriches them with
//! label/review state, evaluates their diffs into migration records, and
//! sweeps completed PRs.
//!
//! Within one tick the phases run sequentially: a re-evaluation that
//! inserts rows must not race the completion sweep on the same PR.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use tracing::{error, info};

use skeefree_core::{
    evaluate_strategy, parse_skeema_diff, requires_per_shard_migration, Migration,
    PullRequest, PullRequestStatus, PullRequestMigrationStatement, Repository,
};

use crate::github::{
    MIGRATION_APPROVED_BY_DB_INFRA_LABEL, MIGRATION_APPROVED_BY_DB_REVIEWERS_LABEL,
    MIGRATION_DETECTED_LABEL, MIGRATION_DIFF_LABEL, MIGRATION_FOR_REVIEW_ALTERNATE_LABEL,
    MIGRATION_FOR_REVIEW_LABEL, MIGRATION_QUEUED_LABEL,
};
use crate::AppState;

const DEFAULT_ACTION_NAME: &str = "skeema-diff";

/// Per-repo override for the skeema CI check-run name.
static SPECIAL_REPOS_ACTION_NAME: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(HashMap::new);

/// Repos that must be approved by the schema reviewers team before a
/// DBInfra review is requested.
static REPOS_REQUIRING_DB_REVIEWERS: Lazy<HashSet<&'static str>> = Lazy::new(HashSet::new);

/// Optional per-repo postscript appended to the completion comment.
static POST_COMPLETE_PR_COMMENTS: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(HashMap::new);

fn get_action_name(repo: &str) -> &str {
    SPECIAL_REPOS_ACTION_NAME
        .get(repo)
        .copied()
        .unwrap_or(DEFAULT_ACTION_NAME)
}

pub(crate) fn repo_requires_db_reviewers(repo: &str) -> bool {
    REPOS_REQUIRING_DB_REVIEWERS.contains(repo)
}

// =============================================================================
// PR comments
// =============================================================================

async fn comment(state: &Arc<AppState>, migration: &Migration, comment: &str) -> Result<()> {
    state
        .github
        .add_pull_request_comment(&migration.pr.org, &migration.pr.repo, migration.pr.number, comment)
        .await
}

pub async fn comment_migration_started(state: &Arc<AppState>, migration: &Migration) -> Result<()> {
    let text = format!(
        "`{}` migration has been started by `skeefree` :crossed_fingers:",
        migration.canonical
    );
    comment(state, migration, &text).await
}

pub async fn comment_migration_noop_complete(
    state: &Arc<AppState>,
    migration: &Migration,
) -> Result<()> {
    let text = format!(
        "`{}` **noop** migration has been executed by `skeefree` successfully :+1:",
        migration.canonical
    );
    comment(state, migration, &text).await
}

pub async fn comment_migration_complete(state: &Arc<AppState>, migration: &Migration) -> Result<()> {
    let text = format!(
        "`{}` migration has been executed by `skeefree` :tada:",
        migration.canonical
    );
    comment(state, migration, &text).await
}

pub async fn comment_migration_failed(state: &Arc<AppState>, migration: &Migration) -> Result<()> {
    let text = format!("`{}` migration has **FAILED** :cry:", migration.canonical);
    comment(state, migration, &text).await
}

// =============================================================================
// Phase A: detect new candidates
// =============================================================================

/// For each registered repository, search the host for open PRs carrying
/// the diff label but not yet detected, and evaluate them.
pub async fn detect_approved_prs(state: &Arc<AppState>) -> Result<()> {
    let repos = state.backend.read_repositories()?;
    for repo in repos {
        if let Err(err) = detect_repo_approved_prs(state, &repo).await {
            error!(org = %repo.org, repo = %repo.repo, error = %err, "detect_approved_prs");
        }
    }
    Ok(())
}

async fn detect_repo_approved_prs(state: &Arc<AppState>, repo: &Repository) -> Result<()> {
    let (numbers, search_string) = state
        .github
        .search_skeema_diff_undetected_prs(&repo.org_repo())
        .await?;
    info!(search = %search_string, count = numbers.len(), "detect_repo_approved_prs");

    // PRs in this list are all "undetected": none carries the detected label.
    for number in numbers {
        // Double check against our own records: a human may have removed
        // the detected label by accident. Completed stays completed.
        let known = state.backend.read_pr(&repo.org, &repo.repo, number).ok();
        if let Some(known) = &known {
            if known.status == PullRequestStatus::Complete {
                info!(org = %repo.org, repo = %repo.repo, pr = number, "silently skipping 'complete' PR");
                continue;
            }
        }
        let approved = state
            .github
            .pull_request_approved_by_someone(&repo.org, &repo.repo, number)
            .await?;
        if !approved {
            // We only consider PRs that have been approved by _someone_.
            continue;
        }
        let mut pr = known.unwrap_or_else(|| PullRequest::new(&repo.org, &repo.repo, number));
        probe_pr(state, &mut pr)
            .await
            .with_context(|| format!("detect_repo_approved_prs {}/{}/{}", repo.org, repo.repo, number))?;
        // A first probe inserts the row; re-read to obtain the backend id.
        let pr = state.backend.read_pr(&repo.org, &repo.repo, number)?;
        analyze_detected_pr(state, pr).await?;
    }
    Ok(())
}

// =============================================================================
// Probing
// =============================================================================

/// Enrich the PR with review/approval and label state from the host, and
/// persist the result.
pub async fn probe_pr(state: &Arc<AppState>, pr: &mut PullRequest) -> Result<()> {
    let github = &state.github;
    pr.requested_review_by_db_reviewers = github
        .team_requested_to_review_pull_request(&pr.org, &pr.repo, pr.number, &state.cfg.db_reviewers_team)
        .await?;
    pr.approved_by_db_reviewers = github
        .pull_request_approved_by_team(&pr.org, &pr.repo, pr.number, &state.cfg.db_reviewers_team)
        .await?;
    pr.requested_review_by_db_infra = github
        .team_requested_to_review_pull_request(&pr.org, &pr.repo, pr.number, &state.cfg.db_infra_team)
        .await?;
    pr.approved_by_db_infra = github
        .pull_request_approved_by_team(&pr.org, &pr.repo, pr.number, &state.cfg.db_infra_team)
        .await?;

    let pull = github.read_pull_request(&pr.org, &pr.repo, pr.number).await?;
    let labels: HashSet<&str> = pull.labels.iter().map(|label| label.name.as_str()).collect();
    pr.labeled_as_diff = labels.contains(MIGRATION_DIFF_LABEL);
    pr.labeled_as_detected = labels.contains(MIGRATION_DETECTED_LABEL);
    pr.labeled_as_queued = labels.contains(MIGRATION_QUEUED_LABEL);
    pr.labeled_for_review = labels.contains(MIGRATION_FOR_REVIEW_LABEL)
        || labels.contains(MIGRATION_FOR_REVIEW_ALTERNATE_LABEL);
    if labels.contains(MIGRATION_APPROVED_BY_DB_REVIEWERS_LABEL) {
        // An alternative method of identifying schema-reviewers approval.
        pr.approved_by_db_reviewers = true;
    }
    if labels.contains(MIGRATION_APPROVED_BY_DB_INFRA_LABEL) {
        // An alternative method of identifying database-team approval.
        pr.approved_by_db_infra = true;
    }

    pr.is_open = pull.state == "open";
    pr.title = pull.title;
    pr.author = pull.user.login;
    state.backend.submit_pr(pr)?;
    Ok(())
}

// =============================================================================
// Phase B: refresh known open PRs
// =============================================================================

/// Probe and analyze every known open PR, in random order for fairness
/// against head-of-line stalls.
pub async fn probe_known_open_prs(state: &Arc<AppState>) -> Result<()> {
    let mut prs = state.backend.read_open_prs()?;
    prs.shuffle(&mut rand::thread_rng());
    for mut pr in prs {
        if let Err(err) = probe_pr(state, &mut pr).await {
            error!(org = %pr.org, repo = %pr.repo, pr = pr.number, error = %err, "probe_pr");
        }
        if let Err(err) = analyze_detected_pr(state, pr.clone()).await {
            error!(org = %pr.org, repo = %pr.repo, pr = pr.number, error = %err, "probe_known_open_prs");
        }
    }
    Ok(())
}

/// Drive a probed PR forward: evaluate its diff when not yet detected,
/// request the DBInfra review when due, and queue its migrations once
/// DBInfra approves.
pub async fn analyze_detected_pr(state: &Arc<AppState>, pr: PullRequest) -> Result<()> {
    if !pr.is_open {
        return Ok(());
    }
    if !pr.labeled_as_diff {
        return Ok(());
    }
    if !pr.labeled_for_review {
        return Ok(());
    }
    match pr.status {
        PullRequestStatus::Complete | PullRequestStatus::Cancelled | PullRequestStatus::Unknown => {
            return Ok(())
        }
        _ => {}
    }
    if !pr.labeled_as_detected {
        evaluate_pr_migration(state, &pr).await?;
    }
    // See if we need to request review from DBInfra.
    if pr.labeled_as_detected
        && pr.labeled_for_review
        && !pr.requested_review_by_db_infra
        && !pr.approved_by_db_infra
        && (pr.approved_by_db_reviewers || !repo_requires_db_reviewers(&pr.repo))
    {
        state
            .github
            .request_pull_request_review(&pr.org, &pr.repo, pr.number, &state.cfg.db_infra_team)
            .await?;
    }
    if pr.labeled_as_detected && pr.approved_by_db_infra {
        queue_pr_migrations(state, &pr).await?;
    }
    Ok(())
}

async fn get_skeema_diff_comment_body(state: &Arc<AppState>, pr: &PullRequest) -> Result<String> {
    if let Ok(comment) = state
        .github
        .read_pull_request_magic_comment(&pr.org, &pr.repo, pr.number)
        .await
    {
        return Ok(comment);
    }
    let pull = state
        .github
        .read_pull_request(&pr.org, &pr.repo, pr.number)
        .await?;
    Ok(pull.body.unwrap_or_default())
}

/// Evaluate a PR's diff into migration records: verify the CI check, parse
/// the magic comment, resolve the production mapping, soft-cancel any
/// prior generation, persist statements and migrations, comment the
/// suggestions, and add the detected label.
pub async fn evaluate_pr_migration(state: &Arc<AppState>, pr: &PullRequest) -> Result<()> {
    let action_name = get_action_name(&pr.repo);
    let check_passing = state
        .github
        .is_skeema_check_passing(&pr.org, &pr.repo, pr.number, action_name)
        .await?;
    if !check_passing {
        return Err(anyhow!(
            "evaluate_pr_migration {}: action is not in successful state",
            pr
        ));
    }

    let comment_body = get_skeema_diff_comment_body(state, pr).await?;
    let mut repo = state.backend.read_repository(&pr.org, &pr.repo)?;
    let mappings = state.backend.read_repository_mappings(&repo)?;
    let diff_info = parse_skeema_diff(&comment_body);
    // A mapping matches on either the file name or the schema name. In
    // practice a repo uses one of the two, not both.
    for mapping in &mappings {
        if mapping.hint == diff_info.file_name || mapping.hint == diff_info.schema_name {
            info!(
                org = %pr.org, repo = %pr.repo, hint = %mapping.hint,
                cluster = %mapping.mysql_cluster, schema = %mapping.mysql_schema,
                "evaluate_pr_migration: mapping match"
            );
            repo.mysql_cluster = mapping.mysql_cluster.clone();
            repo.mysql_schema = mapping.mysql_schema.clone();
        }
    }
    if repo.mysql_cluster.is_empty() {
        return Err(anyhow!(
            "evaluate_pr_migration {}: cannot resolve MySQL cluster for this PR",
            pr
        ));
    }
    if repo.mysql_schema.is_empty() {
        return Err(anyhow!(
            "evaluate_pr_migration {}: cannot resolve MySQL schema for this PR",
            pr
        ));
    }
    if diff_info.statements.is_empty() {
        return Err(anyhow!(
            "evaluate_pr_migration {}: expected migration statements but could find none",
            pr
        ));
    }

    // This PR may already be in our database; re-evaluate from scratch.
    state
        .backend
        .forget_pr_statements_and_migrations(pr)
        .context("error forgetting PR")?;

    state.backend.submit_pr_statements(pr, &diff_info.statements)?;
    // Data is persisted. Now read it back, with ids, as migration seeds.
    let pr_statements = state.backend.read_pull_request_migration_statements(pr)?;
    if pr_statements.is_empty() {
        let msg = "skeefree expected migration statements in backend DB but could find none";
        let _ = state
            .github
            .add_pull_request_comment(&pr.org, &pr.repo, pr.number, msg)
            .await;
        return Err(anyhow!("evaluate_pr_migration {}: {}", pr, msg));
    }

    let migrations = evaluate_migrations(state, &repo, pr, &pr_statements).await?;
    {
        let suggestions: Vec<String> = migrations.iter().map(|m| m.pretty_suggestion()).collect();
        let suggestion_comment = format!(
            "Migration instructions for @{}/{}:{}",
            repo.org,
            state.cfg.db_infra_team,
            suggestions.concat()
        );
        state
            .github
            .add_pull_request_comment(&pr.org, &pr.repo, pr.number, &suggestion_comment)
            .await?;
    }
    let count_submitted = state.backend.submit_migrations(&migrations)?;
    info!(count = count_submitted, "evaluate_pr_migration: submitted migrations");

    state
        .github
        .add_pull_request_label(&pr.org, &pr.repo, pr.number, MIGRATION_DETECTED_LABEL)
        .await?;
    info!(org = %pr.org, repo = %pr.repo, pr = pr.number, label = MIGRATION_DETECTED_LABEL, "evaluate_pr_migration: labeled");
    Ok(())
}

/// Fan statements out into per-shard migration records according to the
/// expansion policy.
async fn evaluate_migrations(
    state: &Arc<AppState>,
    repo: &Repository,
    pr: &PullRequest,
    pr_statements: &[PullRequestMigrationStatement],
) -> Result<Vec<Migration>> {
    let cluster_shards = state
        .sites_api
        .mysql_cluster_shards(&repo.mysql_cluster)
        .await?;
    let cluster = state
        .mysql_discovery_api
        .get_cluster(&repo.mysql_cluster)
        .await?;
    let mut migrations = Vec::new();
    for pr_statement in pr_statements {
        let migration_shards: Vec<String> =
            if requires_per_shard_migration(pr_statement.migration_type()) {
                cluster_shards.clone()
            } else {
                vec![String::new()]
            };
        for shard in &migration_shards {
            let strategy = evaluate_strategy(pr_statement, repo.autorun);
            let mut migration = Migration::new(
                cluster.clone(),
                shard,
                repo.clone(),
                pr.clone(),
                pr_statement.clone(),
                strategy,
            );
            migration.evaluate()?;
            migrations.push(migration);
        }
    }
    Ok(migrations)
}

/// Approve a PR's migrations: flip the three-way state in the backend and
/// ensure the queued label is present.
pub async fn queue_pr_migrations(state: &Arc<AppState>, pr: &PullRequest) -> Result<()> {
    info!(org = %pr.org, repo = %pr.repo, pr = pr.number, "queue_pr_migrations");
    state.backend.queue_pr_migrations(pr)?;
    if !pr.labeled_as_queued {
        state
            .github
            .add_pull_request_label(&pr.org, &pr.repo, pr.number, MIGRATION_QUEUED_LABEL)
            .await?;
    }
    Ok(())
}

// =============================================================================
// Completion sweep
// =============================================================================

/// Mark PRs whose migrations have all reached complete/cancelled; remove
/// the queued label and invite the author to merge.
pub async fn detect_and_mark_completed_prs(state: &Arc<AppState>) -> Result<()> {
    let prs = state.backend.read_non_completed_prs_with_completed_migrations()?;
    for pr in prs {
        let affected = match state.backend.update_pr_status(&pr, PullRequestStatus::Complete) {
            Ok(affected) => affected,
            Err(err) => {
                error!(org = %pr.org, repo = %pr.repo, pr = pr.number, error = %err, "detect_and_mark_completed_prs");
                continue;
            }
        };
        if affected == 0 {
            // Another actor won the race.
            continue;
        }
        info!(org = %pr.org, repo = %pr.repo, pr = pr.number, "detect_and_mark_completed_prs: complete");

        if pr.labeled_as_queued {
            // PR no longer queued.
            if let Err(err) = state
                .github
                .remove_pull_request_label(&pr.org, &pr.repo, pr.number, MIGRATION_QUEUED_LABEL)
                .await
            {
                error!(org = %pr.org, repo = %pr.repo, pr = pr.number, error = %err, "detect_and_mark_completed_prs");
            }
        }

        let mut comment = format!(
            "@{} All migrations in this PR are in `complete` status. Please go ahead and follow your standard deploy/merge flow.",
            pr.author
        );
        if let Some(addendum) = POST_COMPLETE_PR_COMMENTS.get(pr.repo.as_str()) {
            comment = format!("{}\n{}", comment, addendum);
        }
        if let Err(err) = state
            .github
            .add_pull_request_comment(&pr.org, &pr.repo, pr.number, &comment)
            .await
        {
            error!(org = %pr.org, repo = %pr.repo, pr = pr.number, error = %err, "detect_and_mark_completed_prs");
        }
    }
    Ok(())
}

// =============================================================================
// Forget
// =============================================================================

/// Operator-facing forget: remove the PR and its pre-run migrations,
/// strip workflow labels, and leave a comment explaining what happened.
pub async fn forget_pr(
    state: &Arc<AppState>,
    repo: &Repository,
    pr_number: i64,
    pr_comment: &str,
) -> Result<()> {
    let pull = state
        .github
        .read_pull_request(&repo.org, &repo.repo, pr_number)
        .await?;
    let pr = state.backend.read_pr(&repo.org, &repo.repo, pr_number)?;
    state
        .backend
        .forget_pr(&pr)
        .context("error forgetting PR")?;

    for label in &pull.labels {
        if label.name == MIGRATION_DETECTED_LABEL || label.name == MIGRATION_QUEUED_LABEL {
            state
                .github
                .remove_pull_request_label(&pr.org, &pr.repo, pr.number, &label.name)
                .await
                .with_context(|| format!("error removing label {}", label.name))?;
        }
    }

    state
        .github
        .add_pull_request_comment(&repo.org, &repo.repo, pr_number, pr_comment)
        .await?;
    Ok(())
}
