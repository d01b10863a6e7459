//! Operator command surface: synchronous verbs matched by name plus a
//! named-capture regex, mapping onto backend operations and PR-host side
//! effects. Successful commands return JSON or markdown text.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use skeefree_core::{
    evaluate_strategy, map_pr_migrations, Migration, MigrationStatus, MigrationStrategy,
    PullRequest, PullRequestPriority, PullRequestStatus, Repository,
    RepositoryProductionMapping,
};

use crate::github::MIGRATION_DIFF_LABEL;
use crate::observer::{forget_pr, repo_requires_db_reviewers};
use crate::util::parse_org_repo;
use crate::AppState;

#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub pattern: &'static str,
}

/// All registered operator commands. Parameters are extracted via named
/// captures.
pub static COMMAND_SPECS: &[CommandSpec] = &[
    CommandSpec {
        name: "add-repo",
        help: "add-repo <[org/]repo> <team> | add new repository to be managed by skeefree",
        pattern: r"add-repo (?P<repo>[-/_\w]+) (?P<team>[-_\w]+)",
    },
    CommandSpec {
        name: "remove-repo",
        help: "remove-repo <[org/]repo> | DANGER! unlists given repo, skeefree will forget everything about it",
        pattern: r"remove-repo (?P<repo>[-/_\w]+)",
    },
    CommandSpec {
        name: "update-repo",
        help: "update-repo <[org/]repo> <team> | update details for given repository",
        pattern: r"update-repo (?P<repo>[-/_\w]+) (?P<team>[-_\w]+)",
    },
    CommandSpec {
        name: "show-repo",
        help: "show-repo <[org/]repo> | show details of registered repository",
        pattern: r"show-repo (?P<repo>[-/_\w]+)",
    },
    CommandSpec {
        name: "which-repos",
        help: "which-repos | show names of all registered repositories",
        pattern: r"which-repos",
    },
    CommandSpec {
        name: "show-repos",
        help: "show-repos | show details of all registered repositories",
        pattern: r"show-repos",
    },
    CommandSpec {
        name: "repo-map",
        help: "repo-map <[org/]repo> <hint> <cluster> <schema> | map a repo's skeema database to production",
        pattern: r"repo-map (?P<repo>[-/_\w]+) (?P<hint>[-_.:\w]+) (?P<mysql_cluster>[-_\w]+) (?P<schema_name>[_\w]+)",
    },
    CommandSpec {
        name: "repo-unmap",
        help: "repo-unmap <[org/]repo> <hint> | forget a repo-production mapping",
        pattern: r"repo-unmap (?P<repo>[-/_\w]+) (?P<hint>[-_.:\w]+)",
    },
    CommandSpec {
        name: "repo-autorun",
        help: "repo-autorun <enable|disable> <[org/]repo> | enable or disable auto-migration execution for given repo",
        pattern: r"repo-autorun (?P<command>[-_\w]+) (?P<repo>[-/_\w]+)",
    },
    CommandSpec {
        name: "forget-pr",
        help: "forget-pr https://github.com/<org>/<repo>/pull/<number> | forget a detected pull request",
        pattern: r"forget-pr (https://github.com/|)(?P<org>[-_\w]+)/(?P<repo>[-_\w]+)/pull/(?P<pr_number>[0-9]+)",
    },
    CommandSpec {
        name: "prioritize-pr",
        help: "prioritize-pr https://github.com/<org>/<repo>/pull/<number> <urgent|high|normal|low> | set a priority for a pull request",
        pattern: r"prioritize-pr (https://github.com/|)(?P<org>[-_\w]+)/(?P<repo>[-_\w]+)/pull/(?P<pr_number>[0-9]+) (?P<priority>[_\w]+)",
    },
    CommandSpec {
        name: "show-pr",
        help: "show-pr https://github.com/<org>/<repo>/pull/<number> | show details about a pull request",
        pattern: r"show-pr (https://github.com/|)(?P<org>[-_\w]+)/(?P<repo>[-_\w]+)/pull/(?P<pr_number>[0-9]+)",
    },
    CommandSpec {
        name: "approve-autorun",
        help: "approve-autorun https://github.com/<org>/<repo>/pull/<number> <table> | approve auto-execution for a specific migration",
        pattern: r"approve-autorun (https://github.com/|)(?P<org>[-_\w]+)/(?P<repo>[-_\w]+)/pull/(?P<pr_number>[0-9]+) (?P<table_name>[_\w]+)",
    },
    CommandSpec {
        name: "retry-migration",
        help: "retry-migration https://github.com/<org>/<repo>/pull/<number> <table> | retry a failed migration",
        pattern: r"retry-migration (https://github.com/|)(?P<org>[-_\w]+)/(?P<repo>[-_\w]+)/pull/(?P<pr_number>[0-9]+) (?P<table_name>[_\w]+)",
    },
    CommandSpec {
        name: "mark-complete",
        help: "mark-complete https://github.com/<org>/<repo>/pull/<number> <table> | mark a migration as `complete`",
        pattern: r"mark-complete (https://github.com/|)(?P<org>[-_\w]+)/(?P<repo>[-_\w]+)/pull/(?P<pr_number>[0-9]+) (?P<table_name>[_\w]+)",
    },
    CommandSpec {
        name: "sup",
        help: "sup | show human friendly status",
        pattern: r"sup",
    },
    CommandSpec {
        name: "status",
        help: "status | show database-team friendly status",
        pattern: r"status",
    },
];

static COMMAND_REGEXES: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    COMMAND_SPECS
        .iter()
        .map(|spec| (spec.name, Regex::new(spec.pattern).expect("invalid command pattern")))
        .collect()
});

/// Match the command text against the registered specs and extract named
/// parameters.
fn parse_command(text: &str) -> Result<(&'static CommandSpec, HashMap<String, String>)> {
    let text = text.trim();
    let name = text.split_whitespace().next().unwrap_or("");
    let spec = COMMAND_SPECS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| anyhow!("unknown command: {}", name))?;
    let regex = &COMMAND_REGEXES[spec.name];
    let captures = regex
        .captures(text)
        .ok_or_else(|| anyhow!("usage: {}", spec.help))?;
    let mut params = HashMap::new();
    for capture_name in regex.capture_names().flatten() {
        if let Some(value) = captures.name(capture_name) {
            params.insert(capture_name.to_string(), value.as_str().to_string());
        }
    }
    Ok((spec, params))
}

/// Dispatch one operator command; `user` attributes the action in PR
/// comments.
pub async fn handle_command(state: &Arc<AppState>, text: &str, user: &str) -> Result<String> {
    let (spec, params) = parse_command(text)?;
    info!(command = spec.name, ?params, "received operator command");
    match spec.name {
        "add-repo" => add_repo(state, &params).await,
        "remove-repo" => remove_repo(state, &params).await,
        "update-repo" => update_repo(state, &params).await,
        "show-repo" => show_repo(state, &params).await,
        "which-repos" => which_repos(state).await,
        "show-repos" => show_repos(state).await,
        "repo-map" => repo_map(state, &params).await,
        "repo-unmap" => repo_unmap(state, &params).await,
        "repo-autorun" => repo_autorun(state, &params).await,
        "forget-pr" => forget_pr_command(state, &params, user).await,
        "prioritize-pr" => prioritize_pr(state, &params).await,
        "show-pr" => show_pr(state, &params).await,
        "approve-autorun" => approve_autorun(state, &params).await,
        "retry-migration" => retry_migration(state, &params).await,
        "mark-complete" => mark_complete(state, &params).await,
        "sup" => sup(state).await,
        "status" => status(state).await,
        other => Err(anyhow!("unknown command: {}", other)),
    }
}

fn read_repository(state: &AppState, params: &HashMap<String, String>) -> Result<Repository> {
    let (org, repo) = parse_org_repo(params, &state.cfg.default_org)?;
    state.backend.read_repository(&org, &repo)
}

fn read_pull_request(state: &AppState, params: &HashMap<String, String>) -> Result<PullRequest> {
    let pr_number: i64 = params
        .get("pr_number")
        .ok_or_else(|| anyhow!("missing pr_number"))?
        .parse()
        .map_err(|err| anyhow!("failed to parse pr_number: {}", err))?;
    let (org, repo) = parse_org_repo(params, &state.cfg.default_org)?;
    state.backend.read_pr(&org, &repo, pr_number)
}

async fn add_repo(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let (org, repo) = parse_org_repo(params, &state.cfg.default_org)?;
    if org != state.cfg.default_org {
        return Err(anyhow!("the only supported org is {}", state.cfg.default_org));
    }
    state.github.validate_repo(&org, &repo).await?;

    let team_slug = params.get("team").cloned().unwrap_or_default();
    state.github.validate_admin_team(&org, &repo, &team_slug).await?;

    let mut repository = Repository::new(&org, &repo);
    repository.owner = team_slug;
    let added = state.backend.add_repository(&mut repository)?;
    if !added {
        return Err(anyhow!(
            "could not add {}: seems to already exist",
            repository.org_repo()
        ));
    }
    show_repo(state, params).await
}

async fn update_repo(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let mut repo = read_repository(state, params)?;
    if let Some(team) = params.get("team") {
        repo.owner = team.clone();
    }
    let updated = state.backend.update_repository(&repo)?;
    if !updated {
        return Err(anyhow!("could not update {}: does the repo exist?", repo.org_repo()));
    }
    show_repo(state, params).await
}

async fn remove_repo(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let repo = read_repository(state, params)?;
    let deleted = state.backend.delete_repository(&repo)?;
    if !deleted {
        return Err(anyhow!("could not delete {}: does the repo exist?", repo.org_repo()));
    }
    Ok(format!("Repository {} deleted", repo.org_repo()))
}

fn write_repo(state: &AppState, repo: &Repository, buf: &mut String) -> Result<()> {
    let mappings = state.backend.read_repository_mappings(repo)?;
    buf.push_str(&format!(
        "\n\n`{}`: owner: `{}`, autorun: *{}*",
        repo.org_repo(),
        repo.owner,
        repo.autorun
    ));
    for m in &mappings {
        buf.push_str(&format!(
            "\n- `{}` maps to `{}/{}`",
            m.hint, m.mysql_cluster, m.mysql_schema
        ));
    }
    if mappings.is_empty() {
        buf.push_str("\n- *No mapping found for this repo*. Map via `repo-map ...`");
    }
    Ok(())
}

async fn show_repo(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let repo = read_repository(state, params)?;
    let mut buf = String::new();
    write_repo(state, &repo, &mut buf)?;
    Ok(buf.trim().to_string())
}

async fn which_repos(state: &Arc<AppState>) -> Result<String> {
    let repos = state.backend.read_repositories()?;
    let names: Vec<String> = repos.iter().map(|repo| repo.org_repo()).collect();
    Ok(serde_json::to_string_pretty(&names)?)
}

async fn show_repos(state: &Arc<AppState>) -> Result<String> {
    let repos = state.backend.read_repositories()?;
    let mut buf = String::new();
    for repo in &repos {
        write_repo(state, repo, &mut buf)?;
    }
    Ok(buf.trim().to_string())
}

async fn repo_map(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let repo = read_repository(state, params)?;
    let mut m = RepositoryProductionMapping::from_repo(&repo);
    m.hint = params.get("hint").cloned().unwrap_or_default();
    m.mysql_schema = params.get("schema_name").cloned().unwrap_or_default();
    m.mysql_cluster = params.get("mysql_cluster").cloned().unwrap_or_default();
    state.backend.write_repository_mapping(&m)?;
    show_repo(state, params).await
}

async fn repo_unmap(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let repo = read_repository(state, params)?;
    let mut m = RepositoryProductionMapping::from_repo(&repo);
    m.hint = params.get("hint").cloned().unwrap_or_default();
    state.backend.remove_repository_mapping(&m)?;
    show_repo(state, params).await
}

async fn repo_autorun(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let autorun_enable = match params.get("command").map(String::as_str) {
        Some("enable") => true,
        Some("disable") => false,
        _ => {
            return Err(anyhow!("`repo-autorun` command must be either `enable` or `disable`"));
        }
    };
    let mut repo = read_repository(state, params)?;
    repo.autorun = autorun_enable;
    state.backend.update_repository(&repo)?;
    show_repo(state, params).await
}

async fn forget_pr_command(
    state: &Arc<AppState>,
    params: &HashMap<String, String>,
    user: &str,
) -> Result<String> {
    let pr_number: i64 = params
        .get("pr_number")
        .ok_or_else(|| anyhow!("missing pr_number"))?
        .parse()
        .map_err(|err| anyhow!("failed to parse pr_number: {}", err))?;
    let repo = read_repository(state, params)?;
    let pr_comment = format!(
        "This pull request has been forgotten via `forget-pr` by @{}. `skeefree` will detect it again if approved and has `{}` label",
        user, MIGRATION_DIFF_LABEL
    );
    forget_pr(state, &repo, pr_number, &pr_comment).await?;
    Ok(pr_comment)
}

async fn prioritize_pr(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let pr = read_pull_request(state, params)?;
    let priority =
        PullRequestPriority::from_text(params.get("priority").map(String::as_str).unwrap_or(""));
    state.backend.update_pr_priority(&pr, priority)?;
    show_pr(state, params).await
}

async fn show_pr(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let pr = read_pull_request(state, params)?;
    let migrations = state.backend.read_non_cancelled_migrations(Some(&pr))?;

    let mut buf = String::new();
    buf.push_str(&format!("\n[{}]({}): {}\n", pr, pr.url(), pr.title));
    buf.push_str("*pr*: ");
    buf.push_str(if pr.is_open { "open" } else { "closed" });
    buf.push_str(&format!(" *status*: {}", pr.status));
    buf.push_str(&format!(" *priority*: {}\n", pr.priority.to_text()));
    for m in &migrations {
        buf.push_str(&format!("- {}\n", m.description_markdown()));
    }
    Ok(buf.trim().to_string())
}

async fn approve_autorun(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let pr = read_pull_request(state, params)?;
    let table_name = params.get("table_name").cloned().unwrap_or_default();
    let migrations = state.backend.read_non_cancelled_migrations(Some(&pr))?;
    let migration = migrations
        .iter()
        .find(|m| m.table_name == table_name)
        .ok_or_else(|| anyhow!("could not find migration for `{}` in {}", table_name, pr.url()))?;
    if migration.strategy != MigrationStrategy::Manual {
        return Err(anyhow!(
            "strategy for this migration is already `{}`. Can only approve-autorun if the strategy is `{}`",
            migration.strategy,
            MigrationStrategy::Manual
        ));
    }
    // `true`, because that's the point of this command: yes, autorun this
    // migration even though the repo is not normally automatically
    // executed.
    let strategy = evaluate_strategy(&migration.pr_statement, true);
    state
        .backend
        .update_migration_strategy(migration, MigrationStrategy::Manual, strategy)?;
    Ok(format!(
        "new strategy for {} `{}` is `{}`",
        pr, migration.canonical, strategy
    ))
}

async fn retry_migration(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let pr = read_pull_request(state, params)?;
    let table_name = params.get("table_name").cloned().unwrap_or_default();
    let migration = state
        .backend
        .read_migration(&pr, &table_name)?
        .ok_or_else(|| anyhow!("could not find migration for `{}` in {}", table_name, pr.url()))?;
    if migration.status != MigrationStatus::Failed {
        return Err(anyhow!(
            "can only retry migrations in `{}` status. Status for this migration is `{}`.",
            MigrationStatus::Failed,
            migration.status
        ));
    }
    state.backend.update_migration_status(
        &migration,
        migration.status,
        MigrationStatus::Queued,
        migration.strategy,
    )?;
    Ok(format!(
        "new status for {} `{}` is `{}`",
        pr,
        migration.canonical,
        MigrationStatus::Queued
    ))
}

async fn mark_complete(state: &Arc<AppState>, params: &HashMap<String, String>) -> Result<String> {
    let pr = read_pull_request(state, params)?;
    let table_name = params.get("table_name").cloned().unwrap_or_default();
    let migration = state
        .backend
        .read_migration(&pr, &table_name)?
        .ok_or_else(|| anyhow!("could not find migration for `{}` in {}", table_name, pr.url()))?;
    if migration.status == MigrationStatus::Complete {
        return Err(anyhow!("migration is already in `{}` state.", migration.status));
    }
    state.backend.update_migration_status(
        &migration,
        migration.status,
        MigrationStatus::Complete,
        migration.strategy,
    )?;
    Ok(format!(
        "new status for {} `{}` is `{}`",
        pr,
        migration.canonical,
        MigrationStatus::Complete
    ))
}

/// Human-friendly report: PRs bucketed by where they stand in the review
/// and migration flow.
async fn sup(state: &Arc<AppState>) -> Result<String> {
    let migrations = state.backend.read_non_cancelled_migrations(None)?;
    let (pr_migrations_map, ordered_pr_ids) = map_pr_migrations(&migrations);

    let mut buf = String::new();
    let mut printed_prs: HashSet<i64> = HashSet::new();

    let iterate_migrations = |header: &str, filter: &dyn Fn(&PullRequest) -> bool,
                              buf: &mut String,
                              printed_prs: &mut HashSet<i64>| {
        let mut header_printed = false;
        for pr_id in &ordered_pr_ids {
            let pr_migrations = &pr_migrations_map[pr_id];
            let Some(first) = pr_migrations.first() else {
                continue;
            };
            let pr = &first.pr;
            if printed_prs.contains(&pr.id) {
                continue;
            }
            if !filter(pr) {
                continue;
            }
            if !header_printed {
                buf.push_str(&format!("\n\n*{}*\n", header));
                header_printed = true;
            }
            let priority_text = if pr.priority != PullRequestPriority::Normal {
                format!(" [priority={}]", pr.priority.to_text())
            } else {
                String::new()
            };
            buf.push_str(&format!("\n[{}]({}): {}{}\n", pr, pr.url(), pr.title, priority_text));
            for m in pr_migrations {
                buf.push_str(&format!("- {}\n", m.description_markdown()));
            }
            printed_prs.insert(pr.id);
        }
    };

    let reviewers_header = format!("NEEDS REVIEW from {}", state.cfg.db_reviewers_team);
    iterate_migrations(
        &reviewers_header,
        &|pr| {
            pr.is_open
                && pr.status == PullRequestStatus::Detected
                && pr.labeled_for_review
                && !pr.approved_by_db_reviewers
                && repo_requires_db_reviewers(&pr.repo)
        },
        &mut buf,
        &mut printed_prs,
    );
    let infra_header = format!("NEEDS REVIEW from {}", state.cfg.db_infra_team);
    iterate_migrations(
        &infra_header,
        &|pr| {
            if repo_requires_db_reviewers(&pr.repo) {
                pr.is_open
                    && pr.status == PullRequestStatus::Detected
                    && pr.labeled_for_review
                    && pr.approved_by_db_reviewers
                    && !pr.approved_by_db_infra
            } else {
                pr.is_open
                    && pr.status == PullRequestStatus::Detected
                    && pr.labeled_for_review
                    && !pr.approved_by_db_infra
            }
        },
        &mut buf,
        &mut printed_prs,
    );
    iterate_migrations(
        "Approved and queued for migration",
        &|pr| pr.is_open && pr.status == PullRequestStatus::Queued && pr.approved_by_db_infra,
        &mut buf,
        &mut printed_prs,
    );
    iterate_migrations(
        "Complete",
        &|pr| pr.is_open && pr.status == PullRequestStatus::Complete,
        &mut buf,
        &mut printed_prs,
    );
    iterate_migrations(
        "Not labeled for review",
        &|pr| !pr.labeled_for_review,
        &mut buf,
        &mut printed_prs,
    );
    iterate_migrations("Uncategorized", &|_| true, &mut buf, &mut printed_prs);

    Ok(buf.trim().to_string())
}

/// Database-team report: migrations bucketed by status.
async fn status(state: &Arc<AppState>) -> Result<String> {
    let migrations = state.backend.read_non_cancelled_migrations(None)?;

    let mut buf = String::new();
    let mut printed_migrations: HashSet<i64> = HashSet::new();

    let iterate_migrations = |header: &str,
                              filter: &dyn Fn(&Migration) -> bool,
                              buf: &mut String,
                              printed: &mut HashSet<i64>| {
        let mut header_printed = false;
        for m in &migrations {
            if !filter(m) {
                continue;
            }
            if !header_printed {
                buf.push_str(&format!("\n\n*{}*", header));
                header_printed = true;
            }
            let priority_text = if m.pr.priority != PullRequestPriority::Normal {
                format!(" priority={}", m.pr.priority.to_text())
            } else {
                String::new()
            };
            let running_text = if m.status == MigrationStatus::Running {
                format!("\nRunning on `{}`", m.token)
            } else {
                String::new()
            };
            buf.push_str(&format!(
                "\n\n[{}]({}): `{}`{}\n`{}/{}`, {}{}",
                m.pr,
                m.pr.url(),
                m.canonical,
                running_text,
                m.cluster.name,
                m.repo.mysql_schema,
                m.strategy,
                priority_text
            ));
            printed.insert(m.id);
        }
    };

    iterate_migrations(
        "Running",
        &|m| m.status == MigrationStatus::Running,
        &mut buf,
        &mut printed_migrations,
    );
    iterate_migrations(
        "Failed",
        &|m| m.status == MigrationStatus::Failed,
        &mut buf,
        &mut printed_migrations,
    );
    iterate_migrations(
        "Recently completed",
        &|m| m.status == MigrationStatus::Complete,
        &mut buf,
        &mut printed_migrations,
    );
    iterate_migrations(
        "Ready (soon to be migrated)",
        &|m| m.status == MigrationStatus::Ready,
        &mut buf,
        &mut printed_migrations,
    );
    iterate_migrations(
        "Queued",
        &|m| m.status == MigrationStatus::Queued,
        &mut buf,
        &mut printed_migrations,
    );
    iterate_migrations(
        "Proposed",
        &|m| m.status == MigrationStatus::Proposed,
        &mut buf,
        &mut printed_migrations,
    );
    let printed_snapshot = printed_migrations.clone();
    iterate_migrations(
        "Uncategorized",
        &|m| !printed_snapshot.contains(&m.id),
        &mut buf,
        &mut printed_migrations,
    );

    Ok(buf.trim().to_string())
}
