use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cluster::MySQLCluster;
use crate::parse::{
    dissect_alter_database_statement, dissect_alter_table_statement,
    dissect_create_table_statement, dissect_drop_table_statement, get_safe_table_name_with_suffix,
};
use crate::pull_request::PullRequest;
use crate::repository::Repository;
use crate::statement::{MigrationType, PullRequestMigrationStatement};

static RENAME_TABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new("RENAME TABLE `(.*?)`").unwrap());

/// How a migration gets applied: synchronously by the coordinator
/// (`direct`), handed off to an online-schema-change worker (`ghost`), or
/// left to a human (`manual`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStrategy {
    Direct,
    Ghost,
    Manual,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::Direct => "direct",
            MigrationStrategy::Ghost => "ghost",
            MigrationStrategy::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> MigrationStrategy {
        match s {
            "direct" => MigrationStrategy::Direct,
            "ghost" => MigrationStrategy::Ghost,
            _ => MigrationStrategy::Manual,
        }
    }
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationStatus {
    Proposed,
    Queued,
    Ready,
    Running,
    Complete,
    Failed,
    Cancelled,
    Unknown,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Proposed => "proposed",
            MigrationStatus::Queued => "queued",
            MigrationStatus::Ready => "ready",
            MigrationStatus::Running => "running",
            MigrationStatus::Complete => "complete",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
            MigrationStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> MigrationStatus {
        match s {
            "proposed" => MigrationStatus::Proposed,
            "queued" => MigrationStatus::Queued,
            "ready" => MigrationStatus::Ready,
            "running" => MigrationStatus::Running,
            "complete" => MigrationStatus::Complete,
            "failed" => MigrationStatus::Failed,
            "cancelled" => MigrationStatus::Cancelled,
            _ => MigrationStatus::Unknown,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single DDL statement targeted at one (cluster, shard, schema, table),
/// derived from a PR. The central record of the system.
///
/// In-memory values are snapshots read from the backend; the embedded PR,
/// repository, statement and cluster are resolved at read time by joining.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Migration {
    pub id: i64,
    pub pr: PullRequest,
    pub repo: Repository,
    pub pr_statement: PullRequestMigrationStatement,
    pub cluster: MySQLCluster,
    pub shard: String,
    pub table_name: String,
    pub alter: String,
    pub suggestion: String,
    pub canonical: String,
    pub strategy: MigrationStrategy,
    pub status: MigrationStatus,
    pub token: String,
    pub token_hint: String,
    pub time_ready: Option<NaiveDateTime>,
    pub time_started: Option<NaiveDateTime>,
    pub time_liveness: Option<NaiveDateTime>,
    pub time_completed: Option<NaiveDateTime>,
}

impl Default for MigrationStrategy {
    fn default() -> Self {
        MigrationStrategy::Manual
    }
}

impl Default for MigrationStatus {
    fn default() -> Self {
        MigrationStatus::Proposed
    }
}

impl Migration {
    pub fn new(
        cluster: MySQLCluster,
        shard: &str,
        repo: Repository,
        pr: PullRequest,
        pr_statement: PullRequestMigrationStatement,
        strategy: MigrationStrategy,
    ) -> Migration {
        Migration {
            cluster,
            shard: shard.to_string(),
            repo,
            pr,
            pr_statement,
            strategy,
            status: MigrationStatus::Proposed,
            ..Default::default()
        }
    }

    /// `cluster` for unsharded migrations, `cluster-shard` otherwise. Used
    /// for the canonical display string only.
    pub fn eval_cluster_name(&self) -> String {
        if self.shard.is_empty() {
            self.cluster.name.clone()
        } else {
            format!("{}-{}", self.cluster.name, self.shard)
        }
    }

    /// Dissect the statement and fill in the table name, alter clause,
    /// human suggestion, and the canonical identifier.
    pub fn evaluate(&mut self) -> Result<()> {
        let statement = self.pr_statement.statement.clone();
        match self.pr_statement.migration_type() {
            MigrationType::CreateTable => {
                self.table_name = dissect_create_table_statement(&statement)?;
                self.suggestion = statement;
            }
            MigrationType::DropTable => {
                if statement.starts_with("RENAME TABLE") {
                    // Already the safe-drop form.
                    let captures = RENAME_TABLE_RE.captures(&statement).ok_or_else(|| {
                        anyhow::anyhow!("cannot dissect RENAME statement: {}", statement)
                    })?;
                    self.table_name = captures[1].to_string();
                    self.suggestion = statement;
                } else {
                    self.table_name = dissect_drop_table_statement(&statement)?;
                    self.suggestion = format!(
                        "RENAME TABLE `{}` TO `{}`",
                        self.table_name,
                        get_safe_table_name_with_suffix(&self.table_name, "DRP")
                    );
                }
            }
            MigrationType::AlterTable => {
                let (table_name, alter, has_drop_column) =
                    dissect_alter_table_statement(&statement)?;
                self.table_name = table_name;
                self.alter = alter;
                self.suggestion = format!(
                    "gh-ost --database={} --table={} --alter=\"{}\"",
                    self.repo.mysql_schema, self.table_name, self.alter
                );
                if has_drop_column {
                    self.suggestion
                        .push_str("\n-- the ALTER drops a column; data will be discarded");
                }
            }
            MigrationType::AlterDatabase => {
                let (database_name, alter) = dissect_alter_database_statement(&statement)?;
                self.table_name = database_name;
                self.alter = alter;
                self.suggestion = statement;
            }
            MigrationType::Unsupported => {
                bail!("unsupported migration statement: {}", statement);
            }
        }
        self.canonical = format!(
            "{}/{}/{}",
            self.eval_cluster_name(),
            self.repo.mysql_schema,
            self.table_name
        );
        Ok(())
    }

    /// One markdown bullet for the aggregated suggestion comment. Each
    /// suggestion starts on its own line so they concatenate cleanly.
    pub fn pretty_suggestion(&self) -> String {
        format!(
            "\n- `{}` (strategy: `{}`):\n```\n{}\n```",
            self.canonical, self.strategy, self.suggestion
        )
    }

    pub fn description_markdown(&self) -> String {
        format!(
            "`{}`: strategy=`{}`, status=`{}`",
            self.canonical, self.strategy, self.status
        )
    }
}

/// Strategy for a statement given the repository's autorun flag: without
/// autorun everything is manual; with it, CREATE/DROP run directly and
/// ALTER TABLE goes online.
pub fn evaluate_strategy(
    pr_statement: &PullRequestMigrationStatement,
    allow_auto: bool,
) -> MigrationStrategy {
    if allow_auto {
        match pr_statement.migration_type() {
            MigrationType::CreateTable | MigrationType::DropTable => {
                return MigrationStrategy::Direct
            }
            MigrationType::AlterTable => return MigrationStrategy::Ghost,
            _ => {}
        }
    }
    MigrationStrategy::Manual
}

/// Whether a statement of this type fans out to one migration per shard.
/// CREATE TABLE and ALTER DATABASE apply once per cluster.
pub fn requires_per_shard_migration(migration_type: MigrationType) -> bool {
    match migration_type {
        MigrationType::AlterDatabase | MigrationType::CreateTable => false,
        MigrationType::DropTable | MigrationType::AlterTable => true,
        MigrationType::Unsupported => false,
    }
}

/// Group migrations by PR id, preserving first-seen order (callers feed
/// priority-desc, id-asc reads, and that order must survive grouping).
pub fn map_pr_migrations(
    migrations: &[Migration],
) -> (HashMap<i64, Vec<Migration>>, Vec<i64>) {
    let mut pr_migrations_map: HashMap<i64, Vec<Migration>> = HashMap::new();
    let mut ordered_pr_ids: Vec<i64> = Vec::new();
    for m in migrations {
        if !pr_migrations_map.contains_key(&m.pr.id) {
            pr_migrations_map.insert(m.pr.id, Vec::new());
            ordered_pr_ids.push(m.pr.id);
        }
        pr_migrations_map
            .get_mut(&m.pr.id)
            .expect("just inserted")
            .push(m.clone());
    }
    (pr_migrations_map, ordered_pr_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement_of(text: &str) -> PullRequestMigrationStatement {
        PullRequestMigrationStatement::new(text)
    }

    fn migration_for(cluster: &str, shard: &str, statement: &str) -> Migration {
        let mut repo = Repository::new("myorg", "my-repo");
        repo.mysql_schema = "my_schema".to_string();
        Migration::new(
            MySQLCluster::named(cluster),
            shard,
            repo,
            PullRequest::new("myorg", "my-repo", 1),
            statement_of(statement),
            MigrationStrategy::Manual,
        )
    }

    #[test]
    fn test_evaluate_strategy() {
        assert_eq!(
            evaluate_strategy(&statement_of("CREATE TABLE `t`"), true),
            MigrationStrategy::Direct
        );
        assert_eq!(
            evaluate_strategy(&statement_of("DROP TABLE `t`"), true),
            MigrationStrategy::Direct
        );
        assert_eq!(
            evaluate_strategy(&statement_of("ALTER TABLE `t` DROP KEY `i`"), true),
            MigrationStrategy::Ghost
        );
        assert_eq!(
            evaluate_strategy(&statement_of("ALTER TABLE `t` DROP KEY `i`"), false),
            MigrationStrategy::Manual
        );
        assert_eq!(
            evaluate_strategy(&statement_of("DROP TABLE `t`"), false),
            MigrationStrategy::Manual
        );
        assert_eq!(
            evaluate_strategy(&statement_of("TRUNCATE TABLE `t`"), true),
            MigrationStrategy::Manual
        );
    }

    #[test]
    fn test_eval_cluster_name() {
        let m = migration_for("testing", "", "CREATE TABLE `t` (id int)");
        assert_eq!(m.eval_cluster_name(), "testing");

        let m = migration_for("testing", "0080", "CREATE TABLE `t` (id int)");
        assert_eq!(m.eval_cluster_name(), "testing-0080");
    }

    #[test]
    fn test_evaluate_create_table() {
        let mut m = migration_for("main", "", "CREATE TABLE `t0` (id int)");
        m.evaluate().unwrap();
        assert_eq!(m.table_name, "t0");
        assert_eq!(m.alter, "");
        assert_eq!(m.canonical, "main/my_schema/t0");
        assert_eq!(m.suggestion, "CREATE TABLE `t0` (id int)");
    }

    #[test]
    fn test_evaluate_drop_table() {
        let mut m = migration_for("main", "0001", "DROP TABLE `t0`");
        m.evaluate().unwrap();
        assert_eq!(m.table_name, "t0");
        assert_eq!(m.canonical, "main-0001/my_schema/t0");
        assert_eq!(m.suggestion, "RENAME TABLE `t0` TO `t0_DRP`");
    }

    #[test]
    fn test_evaluate_safe_rename() {
        let mut m = migration_for("main", "", "RENAME TABLE `t0` TO t0_DRP");
        m.evaluate().unwrap();
        assert_eq!(m.table_name, "t0");
        assert_eq!(m.suggestion, "RENAME TABLE `t0` TO t0_DRP");
    }

    #[test]
    fn test_evaluate_alter_table() {
        let mut m = migration_for("main", "", "ALTER TABLE `t0` ADD COLUMN c int");
        m.evaluate().unwrap();
        assert_eq!(m.table_name, "t0");
        assert_eq!(m.alter, "ADD COLUMN c int");
        assert_eq!(m.canonical, "main/my_schema/t0");
        assert!(m.suggestion.contains("gh-ost"));
        assert!(!m.suggestion.contains("drops a column"));
    }

    #[test]
    fn test_evaluate_alter_table_drop_column() {
        let mut m = migration_for("main", "", "ALTER TABLE `t0` DROP COLUMN `c`");
        m.evaluate().unwrap();
        assert!(m.suggestion.contains("drops a column"));
    }

    #[test]
    fn test_evaluate_unsupported() {
        let mut m = migration_for("main", "", "TRUNCATE TABLE `t0`");
        assert!(m.evaluate().is_err());
    }

    #[test]
    fn test_requires_per_shard() {
        assert!(!requires_per_shard_migration(MigrationType::CreateTable));
        assert!(!requires_per_shard_migration(MigrationType::AlterDatabase));
        assert!(requires_per_shard_migration(MigrationType::DropTable));
        assert!(requires_per_shard_migration(MigrationType::AlterTable));
    }

    #[test]
    fn test_map_pr_migrations_preserves_order() {
        let mut m1 = migration_for("main", "", "CREATE TABLE `a` (id int)");
        m1.pr.id = 7;
        let mut m2 = migration_for("main", "", "CREATE TABLE `b` (id int)");
        m2.pr.id = 3;
        let mut m3 = migration_for("main", "", "CREATE TABLE `c` (id int)");
        m3.pr.id = 7;

        let (map, ordered) = map_pr_migrations(&[m1, m2, m3]);
        assert_eq!(ordered, vec![7, 3]);
        assert_eq!(map[&7].len(), 2);
        assert_eq!(map[&3].len(), 1);
    }
}
