//! Core types and pure logic for skeefree: the skeema diff parser, the
//! migration data model, and the strategy/fan-out evaluation functions.
//! Everything here is synchronous and free of I/O; persistence and API
//! plumbing live in `skeefree-server`.

pub mod cluster;
pub mod migration;
pub mod parse;
pub mod pull_request;
pub mod repository;
pub mod statement;

pub use cluster::{Instance, InstanceAttributes, MySQLCluster};
pub use migration::{
    evaluate_strategy, map_pr_migrations, requires_per_shard_migration, Migration,
    MigrationStatus, MigrationStrategy,
};
pub use parse::{parse_skeema_diff, SkeemaDiffInfo};
pub use pull_request::{PullRequest, PullRequestPriority, PullRequestStatus};
pub use repository::{Repository, RepositoryProductionMapping};
pub use statement::{MigrationType, PullRequestMigrationStatement, StatementStatus};
