use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Coarse classification of a DDL statement, by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationType {
    CreateTable,
    DropTable,
    AlterTable,
    AlterDatabase,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementStatus {
    Suggested,
    Approved,
    Cancelled,
}

impl StatementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementStatus::Suggested => "suggested",
            StatementStatus::Approved => "approved",
            StatementStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> StatementStatus {
        match s {
            "approved" => StatementStatus::Approved,
            "cancelled" => StatementStatus::Cancelled,
            _ => StatementStatus::Suggested,
        }
    }
}

impl Default for StatementStatus {
    fn default() -> Self {
        StatementStatus::Suggested
    }
}

/// A single DDL statement extracted from a PR's diff comment; the seed
/// from which zero or more migrations are fanned out by shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestMigrationStatement {
    pub id: i64,
    pub pull_request_id: i64,
    pub statement: String,
    pub status: StatementStatus,
    pub time_added: Option<NaiveDateTime>,
}

impl PullRequestMigrationStatement {
    pub fn new(statement: &str) -> PullRequestMigrationStatement {
        PullRequestMigrationStatement {
            statement: statement.to_string(),
            status: StatementStatus::Suggested,
            ..Default::default()
        }
    }

    /// Case-sensitive prefix typing. The `RENAME TABLE ... _DRP` form is a
    /// safe-drop and counts as a DROP.
    pub fn migration_type(&self) -> MigrationType {
        if self.statement.starts_with("CREATE TABLE") {
            return MigrationType::CreateTable;
        }
        if self.statement.starts_with("DROP TABLE") {
            return MigrationType::DropTable;
        }
        if self.statement.starts_with("RENAME TABLE") && self.statement.ends_with("_DRP") {
            return MigrationType::DropTable;
        }
        if self.statement.starts_with("ALTER TABLE") {
            return MigrationType::AlterTable;
        }
        if self.statement.starts_with("ALTER DATABASE") {
            return MigrationType::AlterDatabase;
        }
        MigrationType::Unsupported
    }
}
