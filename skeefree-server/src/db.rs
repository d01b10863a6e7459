//! Backend store: all persistent state and the leader election lease.
//!
//! Every mutating operation is a single SQL statement or an explicit
//! transaction; status transitions are compare-and-set on
//! (id, from_status[, strategy]) and report `rows_affected`, so concurrent
//! attempts lose harmlessly. Lease acquisition is CAS on `token=''`.
//!
//! The store runs on SQLite: compare-and-set and wall-clock TTLs are the
//! only primitives the coordination protocol needs, and `rows_affected`
//! carries the same meaning it does on any transactional backend.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration function in `run_migrations`.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use skeefree_core::{
    Migration, MigrationStatus, MigrationStrategy, MySQLCluster, PullRequest, PullRequestPriority,
    PullRequestStatus, PullRequestMigrationStatement, Repository, RepositoryProductionMapping,
    StatementStatus,
};

use crate::util::hostname_token;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// A leader lease older than this is up for grabs.
const ELECTION_EXPIRE_SECONDS: i64 = 5;

/// Site-affinity on ghost-ready migrations expires after this long; past
/// it, any worker may claim the migration.
const TOKEN_HINT_GRACE_SECONDS: i64 = 300;

/// Backend takes care of all backend database requests. All queries go
/// through here.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not
/// `Sync`. Operations are short single statements or small transactions;
/// the busy timeout absorbs concurrent access from the CLI mode.
pub struct Backend {
    /// Exposed as `pub(crate)` for test access to manipulate timestamps
    /// when testing expiry behavior.
    pub(crate) conn: Mutex<Connection>,

    service_id: String,
    leader_state: AtomicI64,
    health_state: AtomicI64,
}

impl Backend {
    /// Open (or create) the backend database at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        Self::new_with_service_id(path, &hostname_token()?)
    }

    /// Open the backend with an explicit election service id.
    pub fn new_with_service_id(path: &Path, service_id: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open backend database at {:?}", path))?;
        Self::from_connection(conn, service_id)
    }

    /// In-memory backend (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory backend database")?;
        Self::from_connection(conn, "test-service")
    }

    fn from_connection(conn: Connection, service_id: &str) -> Result<Self> {
        // journal_mode returns the resulting mode as a row; in-memory
        // databases report "memory", which is fine.
        let _journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to set journal_mode")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("Failed to configure pragmas")?;

        let backend = Self {
            conn: Mutex::new(conn),
            service_id: service_id.to_string(),
            leader_state: AtomicI64::new(0),
            health_state: AtomicI64::new(0),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org TEXT NOT NULL,
                repo TEXT NOT NULL,
                owner TEXT NOT NULL DEFAULT '',
                autorun INTEGER NOT NULL DEFAULT 0,
                added_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                updated_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (org, repo)
            );

            CREATE TABLE IF NOT EXISTS repo_production_mapping (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org TEXT NOT NULL,
                repo TEXT NOT NULL,
                hint TEXT NOT NULL,
                mysql_cluster TEXT NOT NULL,
                mysql_schema TEXT NOT NULL,
                added_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                updated_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (org, repo, hint)
            );

            CREATE TABLE IF NOT EXISTS pull_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org TEXT NOT NULL,
                repo TEXT NOT NULL,
                pull_request_number INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'detected',
                is_open INTEGER NOT NULL DEFAULT 0,
                requested_review_by_db_reviewers INTEGER NOT NULL DEFAULT 0,
                approved_by_db_reviewers INTEGER NOT NULL DEFAULT 0,
                requested_review_by_db_infra INTEGER NOT NULL DEFAULT 0,
                approved_by_db_infra INTEGER NOT NULL DEFAULT 0,
                label_diff INTEGER NOT NULL DEFAULT 0,
                label_detected INTEGER NOT NULL DEFAULT 0,
                label_queued INTEGER NOT NULL DEFAULT 0,
                label_for_review INTEGER NOT NULL DEFAULT 0,
                added_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                probed_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (org, repo, pull_request_number)
            );

            CREATE TABLE IF NOT EXISTS pull_request_migration_statements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pull_requests_id INTEGER NOT NULL,
                migration_statement TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'suggested',
                added_timestamp TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_statements_pr
                ON pull_request_migration_statements (pull_requests_id);

            CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org TEXT NOT NULL,
                repo TEXT NOT NULL,
                pull_request_number INTEGER NOT NULL,
                pull_requests_id INTEGER NOT NULL,
                pull_request_migration_statements_id INTEGER NOT NULL,
                mysql_cluster TEXT NOT NULL,
                mysql_shard TEXT NOT NULL DEFAULT '',
                mysql_schema TEXT NOT NULL,
                mysql_table TEXT NOT NULL,
                migration_statement TEXT NOT NULL,
                alter_statement TEXT NOT NULL DEFAULT '',
                suggestion TEXT NOT NULL DEFAULT '',
                canonical TEXT NOT NULL DEFAULT '',
                strategy TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'proposed',
                token TEXT NOT NULL DEFAULT '',
                token_hint TEXT NOT NULL DEFAULT '',
                ready_timestamp TEXT,
                started_timestamp TEXT,
                liveness_timestamp TEXT,
                completed_timestamp TEXT,
                assigned_timestamp TEXT,
                added_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (pull_requests_id, pull_request_migration_statements_id, mysql_shard)
            );
            CREATE INDEX IF NOT EXISTS idx_migrations_pr ON migrations (pull_requests_id);
            CREATE INDEX IF NOT EXISTS idx_migrations_token ON migrations (token);

            CREATE TABLE IF NOT EXISTS service_election (
                anchor INTEGER PRIMARY KEY CHECK (anchor = 1),
                service_id TEXT NOT NULL,
                last_seen_active TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    // =========================================================================
    // Leader election
    // =========================================================================

    /// One election attempt: the current holder refreshes its lease; an
    /// expired lease may be taken over.
    ///
    /// SQLite evaluates every SET expression against the pre-update row,
    /// so the takeover branch must refresh `last_seen_active` explicitly
    /// (on MySQL the assignments are sequential and the second sees the
    /// first's result).
    pub fn attempt_leadership(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let expire_modifier = format!("-{} seconds", ELECTION_EXPIRE_SECONDS);
        conn.execute(
            r#"
            INSERT INTO service_election (anchor, service_id, last_seen_active)
            VALUES (1, ?1, datetime('now'))
            ON CONFLICT (anchor) DO UPDATE SET
                service_id = CASE
                    WHEN last_seen_active < datetime('now', ?2) THEN excluded.service_id
                    ELSE service_id END,
                last_seen_active = CASE
                    WHEN service_id = excluded.service_id THEN excluded.last_seen_active
                    WHEN last_seen_active < datetime('now', ?2) THEN excluded.last_seen_active
                    ELSE last_seen_active END
            "#,
            params![self.service_id, expire_modifier],
        )
        .context("Failed to attempt leadership")?;
        Ok(())
    }

    /// Read the election row and return `(leader_state, leader)`.
    pub fn read_leadership(&self) -> Result<(i64, String)> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let leader: String = conn
            .query_row(
                "SELECT IFNULL(MAX(service_id), '') FROM service_election",
                [],
                |row| row.get(0),
            )
            .context("Failed to read leadership")?;
        let leader_state = i64::from(leader == self.service_id);
        Ok((leader_state, leader))
    }

    /// Refresh the in-memory leader/health flags from the election row.
    /// On a read failure the leader flag is left untouched: a transient
    /// backend blip must not cause leader loss.
    pub fn refresh_leadership(&self) -> Result<()> {
        match self.read_leadership() {
            Ok((new_leader_state, _)) => {
                self.health_state.store(1, Ordering::SeqCst);
                let old_leader_state = self.leader_state.load(Ordering::SeqCst);
                if new_leader_state != old_leader_state {
                    info!(
                        service_id = %self.service_id,
                        leader = new_leader_state > 0,
                        "leader state change"
                    );
                    self.leader_state.store(new_leader_state, Ordering::SeqCst);
                }
                Ok(())
            }
            Err(err) => {
                self.health_state.store(0, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader_state.load(Ordering::SeqCst) > 0
    }

    pub fn is_healthy(&self) -> bool {
        self.health_state.load(Ordering::SeqCst) > 0
    }

    pub fn state_description(&self) -> &'static str {
        if self.is_leader() {
            "Leader"
        } else if self.is_healthy() {
            "Healthy"
        } else {
            "Unhealthy"
        }
    }

    // =========================================================================
    // Repositories and production mappings
    // =========================================================================

    /// Insert-ignore on (org, repo); returns whether a new row was
    /// inserted, filling in the repository id when so.
    pub fn add_repository(&self, r: &mut Repository) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO repositories
                    (org, repo, owner, autorun, added_timestamp, updated_timestamp)
                VALUES
                    (?1, ?2, ?3, ?4, datetime('now'), datetime('now'))
                "#,
                params![r.org, r.repo, r.owner, r.autorun],
            )
            .context("Failed to add repository")?;
        if affected > 0 {
            r.id = conn.last_insert_rowid();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn update_repository(&self, r: &Repository) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                r#"
                UPDATE repositories SET
                    owner = ?1,
                    autorun = ?2,
                    updated_timestamp = datetime('now')
                WHERE
                    org = ?3
                    AND repo = ?4
                "#,
                params![r.owner, r.autorun, r.org, r.repo],
            )
            .context("Failed to update repository")?;
        Ok(affected > 0)
    }

    /// Hard delete; id, org and repo must all match.
    pub fn delete_repository(&self, r: &Repository) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                "DELETE FROM repositories WHERE id = ?1 AND org = ?2 AND repo = ?3",
                params![r.id, r.org, r.repo],
            )
            .context("Failed to delete repository")?;
        Ok(affected > 0)
    }

    pub fn read_repository(&self, org: &str, repo: &str) -> Result<Repository> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            r#"
            SELECT id, org, repo, owner, autorun, added_timestamp, updated_timestamp
            FROM repositories WHERE org = ?1 AND repo = ?2
            "#,
            params![org, repo],
            Self::repository_from_row,
        )
        .optional()
        .context("Failed to read repository")?
        .ok_or_else(|| anyhow!("repository {}/{} not found", org, repo))
    }

    pub fn read_repository_by_id(&self, id: i64) -> Result<Repository> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            r#"
            SELECT id, org, repo, owner, autorun, added_timestamp, updated_timestamp
            FROM repositories WHERE id = ?1
            "#,
            params![id],
            Self::repository_from_row,
        )
        .optional()
        .context("Failed to read repository")?
        .ok_or_else(|| anyhow!("repository id={} not found", id))
    }

    pub fn read_repositories(&self) -> Result<Vec<Repository>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, org, repo, owner, autorun, added_timestamp, updated_timestamp
            FROM repositories ORDER BY org, repo
            "#,
        )?;
        let rows = stmt
            .query_map([], Self::repository_from_row)
            .context("Failed to read repositories")?;
        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("Failed to read repository row")?);
        }
        Ok(repos)
    }

    fn repository_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
        Ok(Repository {
            id: row.get(0)?,
            org: row.get(1)?,
            repo: row.get(2)?,
            owner: row.get(3)?,
            autorun: row.get(4)?,
            mysql_cluster: String::new(),
            mysql_schema: String::new(),
            time_added: row.get(5)?,
            time_updated: row.get(6)?,
        })
    }

    /// Replace-semantics on (org, repo, hint).
    pub fn write_repository_mapping(&self, m: &RepositoryProductionMapping) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            REPLACE INTO repo_production_mapping
                (org, repo, hint, mysql_cluster, mysql_schema, added_timestamp, updated_timestamp)
            VALUES
                (?1, ?2, ?3, ?4, ?5, datetime('now'), datetime('now'))
            "#,
            params![m.org, m.repo, m.hint, m.mysql_cluster, m.mysql_schema],
        )
        .context("Failed to write repository mapping")?;
        Ok(())
    }

    pub fn remove_repository_mapping(&self, m: &RepositoryProductionMapping) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM repo_production_mapping WHERE org = ?1 AND repo = ?2 AND hint = ?3",
            params![m.org, m.repo, m.hint],
        )
        .context("Failed to remove repository mapping")?;
        Ok(())
    }

    pub fn read_repository_mappings(
        &self,
        r: &Repository,
    ) -> Result<Vec<RepositoryProductionMapping>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, org, repo, hint, mysql_cluster, mysql_schema, added_timestamp, updated_timestamp
            FROM repo_production_mapping
            WHERE org = ?1 AND repo = ?2
            ORDER BY hint
            "#,
        )?;
        let rows = stmt.query_map(params![r.org, r.repo], |row| {
            Ok(RepositoryProductionMapping {
                id: row.get(0)?,
                org: row.get(1)?,
                repo: row.get(2)?,
                hint: row.get(3)?,
                mysql_cluster: row.get(4)?,
                mysql_schema: row.get(5)?,
                time_added: row.get(6)?,
                time_updated: row.get(7)?,
            })
        })?;
        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row.context("Failed to read mapping row")?);
        }
        Ok(mappings)
    }

    // =========================================================================
    // Pull requests
    // =========================================================================

    /// Update-then-insert; the probed timestamp is refreshed on either
    /// path.
    pub fn submit_pr(&self, pr: &PullRequest) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let affected = conn
            .execute(
                r#"
                UPDATE pull_requests SET
                    title = ?1,
                    author = ?2,
                    priority = ?3,
                    status = ?4,
                    is_open = ?5,
                    requested_review_by_db_reviewers = ?6,
                    approved_by_db_reviewers = ?7,
                    requested_review_by_db_infra = ?8,
                    approved_by_db_infra = ?9,
                    label_diff = ?10,
                    label_detected = ?11,
                    label_queued = ?12,
                    label_for_review = ?13,
                    probed_timestamp = datetime('now')
                WHERE
                    org = ?14
                    AND repo = ?15
                    AND pull_request_number = ?16
                "#,
                params![
                    pr.title,
                    pr.author,
                    pr.priority.to_i64(),
                    pr.status.as_str(),
                    pr.is_open,
                    pr.requested_review_by_db_reviewers,
                    pr.approved_by_db_reviewers,
                    pr.requested_review_by_db_infra,
                    pr.approved_by_db_infra,
                    pr.labeled_as_diff,
                    pr.labeled_as_detected,
                    pr.labeled_as_queued,
                    pr.labeled_for_review,
                    pr.org,
                    pr.repo,
                    pr.number,
                ],
            )
            .context("Failed to update pull request")?;
        if affected > 0 {
            return Ok(());
        }
        // No rows affected? Try and insert the row.
        conn.execute(
            r#"
            INSERT INTO pull_requests (
                org, repo, pull_request_number, title, author, priority, status, is_open,
                requested_review_by_db_reviewers,
                approved_by_db_reviewers,
                requested_review_by_db_infra,
                approved_by_db_infra,
                label_diff,
                label_detected,
                label_queued,
                label_for_review,
                probed_timestamp
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16,
                datetime('now')
            )
            "#,
            params![
                pr.org,
                pr.repo,
                pr.number,
                pr.title,
                pr.author,
                pr.priority.to_i64(),
                pr.status.as_str(),
                pr.is_open,
                pr.requested_review_by_db_reviewers,
                pr.approved_by_db_reviewers,
                pr.requested_review_by_db_infra,
                pr.approved_by_db_infra,
                pr.labeled_as_diff,
                pr.labeled_as_detected,
                pr.labeled_as_queued,
                pr.labeled_for_review,
            ],
        )
        .context("Failed to insert pull request")?;
        Ok(())
    }

    pub fn read_pr(&self, org: &str, repo: &str, number: i64) -> Result<PullRequest> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            &format!("{} WHERE org = ?1 AND repo = ?2 AND pull_request_number = ?3", Self::PR_SELECT),
            params![org, repo, number],
            Self::pr_from_row,
        )
        .optional()
        .context("Failed to read pull request")?
        .ok_or_else(|| {
            anyhow!(
                "PR https://github.com/{}/{}/pull/{} not found in database",
                org,
                repo,
                number
            )
        })
    }

    pub fn read_open_prs(&self) -> Result<Vec<PullRequest>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(&format!("{} WHERE is_open = 1", Self::PR_SELECT))?;
        let rows = stmt
            .query_map([], Self::pr_from_row)
            .context("Failed to read open PRs")?;
        let mut prs = Vec::new();
        for row in rows {
            prs.push(row.context("Failed to read PR row")?);
        }
        Ok(prs)
    }

    /// Open, not-yet-complete PRs whose migrations (at least one) are all
    /// in {complete, cancelled}: candidates for the completion sweep.
    pub fn read_non_completed_prs_with_completed_migrations(&self) -> Result<Vec<PullRequest>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let query = format!(
            r#"
            {}
            JOIN migrations ON (pull_requests.id = migrations.pull_requests_id)
            WHERE
                pull_requests.is_open = 1
                AND pull_requests.status != 'complete'
            GROUP BY
                pull_requests.id
            HAVING
                COUNT(*) > 0
                AND SUM(migrations.status IN ('complete', 'cancelled')) = COUNT(*)
            "#,
            Self::PR_SELECT_QUALIFIED
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map([], Self::pr_from_row)
            .context("Failed to read completable PRs")?;
        let mut prs = Vec::new();
        for row in rows {
            prs.push(row.context("Failed to read PR row")?);
        }
        Ok(prs)
    }

    pub fn update_pr_status(&self, pr: &PullRequest, to_status: PullRequestStatus) -> Result<usize> {
        if pr.id == 0 {
            return Err(anyhow!("update_pr_status: pr.id == 0"));
        }
        let conn = self.conn.lock().expect("mutex poisoned");
        // Guard on the destination so a concurrent identical update
        // reports zero rows affected and the caller skips its side
        // effects.
        conn.execute(
            "UPDATE pull_requests SET status = ?1 WHERE id = ?2 AND status != ?1",
            params![to_status.as_str(), pr.id],
        )
        .context("Failed to update PR status")
    }

    pub fn update_pr_priority(
        &self,
        pr: &PullRequest,
        priority: PullRequestPriority,
    ) -> Result<usize> {
        if pr.id == 0 {
            return Err(anyhow!("update_pr_priority: pr.id == 0"));
        }
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE pull_requests SET priority = ?1 WHERE id = ?2",
            params![priority.to_i64(), pr.id],
        )
        .context("Failed to update PR priority")
    }

    const PR_SELECT: &'static str = r#"
        SELECT
            id, org, repo, pull_request_number, title, author, priority, status, is_open,
            requested_review_by_db_reviewers,
            approved_by_db_reviewers,
            requested_review_by_db_infra,
            approved_by_db_infra,
            label_diff, label_detected, label_queued, label_for_review,
            added_timestamp, probed_timestamp
        FROM pull_requests"#;

    const PR_SELECT_QUALIFIED: &'static str = r#"
        SELECT
            pull_requests.id, pull_requests.org, pull_requests.repo,
            pull_requests.pull_request_number, pull_requests.title, pull_requests.author,
            pull_requests.priority, pull_requests.status, pull_requests.is_open,
            pull_requests.requested_review_by_db_reviewers,
            pull_requests.approved_by_db_reviewers,
            pull_requests.requested_review_by_db_infra,
            pull_requests.approved_by_db_infra,
            pull_requests.label_diff, pull_requests.label_detected,
            pull_requests.label_queued, pull_requests.label_for_review,
            pull_requests.added_timestamp, pull_requests.probed_timestamp
        FROM pull_requests"#;

    fn pr_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PullRequest> {
        let priority: i64 = row.get(6)?;
        let status: String = row.get(7)?;
        Ok(PullRequest {
            id: row.get(0)?,
            org: row.get(1)?,
            repo: row.get(2)?,
            number: row.get(3)?,
            title: row.get(4)?,
            author: row.get(5)?,
            priority: PullRequestPriority::from_i64(priority),
            status: PullRequestStatus::from_str(&status),
            is_open: row.get(8)?,
            requested_review_by_db_reviewers: row.get(9)?,
            approved_by_db_reviewers: row.get(10)?,
            requested_review_by_db_infra: row.get(11)?,
            approved_by_db_infra: row.get(12)?,
            labeled_as_diff: row.get(13)?,
            labeled_as_detected: row.get(14)?,
            labeled_as_queued: row.get(15)?,
            labeled_for_review: row.get(16)?,
            time_added: row.get(17)?,
            time_probed: row.get(18)?,
        })
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Transactional batch insert with status=suggested.
    pub fn submit_pr_statements(&self, pr: &PullRequest, statements: &[String]) -> Result<()> {
        if pr.id == 0 {
            return Err(anyhow!("submit_pr_statements: pr.id == 0"));
        }
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;
        for statement in statements {
            tx.execute(
                r#"
                INSERT INTO pull_request_migration_statements
                    (pull_requests_id, migration_statement, status)
                VALUES (?1, ?2, ?3)
                "#,
                params![pr.id, statement, StatementStatus::Suggested.as_str()],
            )
            .context("Failed to insert PR statement")?;
        }
        tx.commit().context("Failed to commit PR statements")
    }

    /// Non-cancelled statements for the PR, with their backend ids.
    pub fn read_pull_request_migration_statements(
        &self,
        pr: &PullRequest,
    ) -> Result<Vec<PullRequestMigrationStatement>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, pull_requests_id, migration_statement, status, added_timestamp
            FROM pull_request_migration_statements
            WHERE pull_requests_id = ?1 AND status != 'cancelled'
            "#,
        )?;
        let rows = stmt.query_map(params![pr.id], |row| {
            let status: String = row.get(3)?;
            Ok(PullRequestMigrationStatement {
                id: row.get(0)?,
                pull_request_id: row.get(1)?,
                statement: row.get(2)?,
                status: StatementStatus::from_str(&status),
                time_added: row.get(4)?,
            })
        })?;
        let mut statements = Vec::new();
        for row in rows {
            statements.push(row.context("Failed to read statement row")?);
        }
        Ok(statements)
    }

    // =========================================================================
    // Forget
    // =========================================================================

    /// Hard-forget a PR: delete the PR, its statements and its migrations.
    /// Aborts (rolling back) when any migration is imminent, running, or
    /// already complete.
    pub fn forget_pr(&self, pr: &PullRequest) -> Result<()> {
        if pr.id == 0 {
            return Err(anyhow!("cannot forget PR {} as it has no internal id", pr));
        }
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("SELECT status FROM migrations WHERE pull_requests_id = ?1")?;
            let rows = stmt.query_map(params![pr.id], |row| row.get::<_, String>(0))?;
            for row in rows {
                let status = MigrationStatus::from_str(&row.context("Failed to read status")?);
                match status {
                    MigrationStatus::Ready
                    | MigrationStatus::Running
                    | MigrationStatus::Complete
                    | MigrationStatus::Unknown => {
                        // Transaction is rolled back on drop.
                        return Err(anyhow!(
                            "cannot forget PR: migration found with '{}' status",
                            status
                        ));
                    }
                    _ => {}
                }
            }
        }
        tx.execute("DELETE FROM pull_requests WHERE id = ?1", params![pr.id])?;
        tx.execute(
            "DELETE FROM pull_request_migration_statements WHERE pull_requests_id = ?1",
            params![pr.id],
        )?;
        tx.execute(
            "DELETE FROM migrations WHERE pull_requests_id = ?1",
            params![pr.id],
        )?;
        tx.commit().context("Failed to commit forget-pr")
    }

    /// Soft-cancel a PR's current generation: statements become cancelled,
    /// and migrations still in {proposed, queued} become cancelled. Used on
    /// re-evaluation.
    pub fn forget_pr_statements_and_migrations(&self, pr: &PullRequest) -> Result<()> {
        if pr.id == 0 {
            return Err(anyhow!(
                "cannot forget statements and migrations for PR {} as it has no internal id",
                pr
            ));
        }
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE pull_request_migration_statements SET status = 'cancelled' WHERE pull_requests_id = ?1",
            params![pr.id],
        )?;
        tx.execute(
            "UPDATE migrations SET status = 'cancelled' WHERE pull_requests_id = ?1 AND status IN ('proposed', 'queued')",
            params![pr.id],
        )?;
        tx.commit()
            .context("Failed to commit forget-pr-statements-and-migrations")
    }

    // =========================================================================
    // Migrations
    // =========================================================================

    /// Per-record insert-ignore; the business key is
    /// (pr, statement, shard). Returns the count of newly inserted rows.
    pub fn submit_migrations(&self, migrations: &[Migration]) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut count_submitted = 0;
        for m in migrations {
            let affected = conn
                .execute(
                    r#"
                    INSERT OR IGNORE INTO migrations (
                        org, repo, pull_request_number, pull_requests_id,
                        pull_request_migration_statements_id,
                        mysql_cluster, mysql_shard, mysql_schema, mysql_table,
                        migration_statement, alter_statement, suggestion, canonical,
                        strategy, token, status, added_timestamp
                    ) VALUES (
                        ?1, ?2, ?3, ?4,
                        ?5, ?6, ?7, ?8,
                        ?9, ?10, ?11, ?12,
                        ?13, ?14, ?15, ?16,
                        datetime('now')
                    )
                    "#,
                    params![
                        m.pr.org,
                        m.pr.repo,
                        m.pr.number,
                        m.pr.id,
                        m.pr_statement.id,
                        m.cluster.name,
                        m.shard,
                        m.repo.mysql_schema,
                        m.table_name,
                        m.pr_statement.statement,
                        m.alter,
                        m.suggestion,
                        m.canonical,
                        m.strategy.as_str(),
                        m.token,
                        m.status.as_str(),
                    ],
                )
                .context("Failed to submit migration")?;
            count_submitted += affected;
        }
        Ok(count_submitted)
    }

    const MIGRATION_SELECT: &'static str = r#"
        SELECT
            pull_requests.id,
            pull_requests.org,
            pull_requests.repo,
            pull_requests.pull_request_number,
            pull_requests.title,
            pull_requests.author,
            pull_requests.priority,
            pull_requests.status,
            pull_requests.is_open,
            pull_requests.requested_review_by_db_reviewers,
            pull_requests.approved_by_db_reviewers,
            pull_requests.requested_review_by_db_infra,
            pull_requests.approved_by_db_infra,
            pull_requests.label_diff,
            pull_requests.label_detected,
            pull_requests.label_queued,
            pull_requests.label_for_review,

            migrations.id,
            migrations.pull_request_migration_statements_id,
            migrations.mysql_cluster,
            migrations.mysql_shard,
            migrations.mysql_schema,
            migrations.mysql_table,
            migrations.migration_statement,
            migrations.alter_statement,
            migrations.suggestion,
            migrations.canonical,
            migrations.strategy,
            migrations.token,
            migrations.token_hint,
            migrations.status,
            migrations.ready_timestamp,
            migrations.started_timestamp,
            migrations.liveness_timestamp,
            migrations.completed_timestamp
        FROM
            pull_requests
            JOIN migrations ON (pull_requests.id = migrations.pull_requests_id)
        WHERE
            migrations.status != 'cancelled'"#;

    fn migration_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Migration> {
        let priority: i64 = row.get(6)?;
        let pr_status: String = row.get(7)?;
        let pr = PullRequest {
            id: row.get(0)?,
            org: row.get(1)?,
            repo: row.get(2)?,
            number: row.get(3)?,
            title: row.get(4)?,
            author: row.get(5)?,
            priority: PullRequestPriority::from_i64(priority),
            status: PullRequestStatus::from_str(&pr_status),
            is_open: row.get(8)?,
            requested_review_by_db_reviewers: row.get(9)?,
            approved_by_db_reviewers: row.get(10)?,
            requested_review_by_db_infra: row.get(11)?,
            approved_by_db_infra: row.get(12)?,
            labeled_as_diff: row.get(13)?,
            labeled_as_detected: row.get(14)?,
            labeled_as_queued: row.get(15)?,
            labeled_for_review: row.get(16)?,
            time_added: None,
            time_probed: None,
        };
        let strategy: String = row.get(27)?;
        let status: String = row.get(30)?;
        let mut repo = Repository::new(&pr.org, &pr.repo);
        repo.mysql_schema = row.get(21)?;
        Ok(Migration {
            id: row.get(17)?,
            pr_statement: PullRequestMigrationStatement {
                id: row.get(18)?,
                pull_request_id: row.get(0)?,
                statement: row.get(23)?,
                status: StatementStatus::Suggested,
                time_added: None,
            },
            cluster: MySQLCluster::named(&row.get::<_, String>(19)?),
            shard: row.get(20)?,
            table_name: row.get(22)?,
            alter: row.get(24)?,
            suggestion: row.get(25)?,
            canonical: row.get(26)?,
            strategy: MigrationStrategy::from_str(&strategy),
            token: row.get(28)?,
            token_hint: row.get(29)?,
            status: MigrationStatus::from_str(&status),
            time_ready: row.get(31)?,
            time_started: row.get(32)?,
            time_liveness: row.get(33)?,
            time_completed: row.get(34)?,
            pr,
            repo,
        })
    }

    fn read_migrations(&self, condition: &str, args: &[&dyn ToSql]) -> Result<Vec<Migration>> {
        let query = format!(
            r#"{}
            {}
            ORDER BY
                pull_requests.priority DESC,
                pull_requests.id ASC
            "#,
            Self::MIGRATION_SELECT,
            condition
        );
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(args, Self::migration_from_row)
            .context("Failed to read migrations")?;
        let mut migrations = Vec::new();
        for row in rows {
            migrations.push(row.context("Failed to read migration row")?);
        }
        Ok(migrations)
    }

    /// All non-cancelled migrations, ordered by PR priority desc then PR
    /// id asc; for all open PRs when `pr` is `None`, else for the given
    /// PR.
    pub fn read_non_cancelled_migrations(&self, pr: Option<&PullRequest>) -> Result<Vec<Migration>> {
        match pr {
            None => self.read_migrations("AND pull_requests.is_open = 1", &[]),
            Some(pr) => {
                if pr.id == 0 {
                    return Err(anyhow!("given pull request has no id"));
                }
                self.read_migrations("AND migrations.pull_requests_id = ?1", &[&pr.id])
            }
        }
    }

    /// Unowned ghost-ready migrations claimable under the given site hint.
    /// The hint is soft affinity: once a migration has been ready for five
    /// minutes, any site may claim it.
    pub fn read_ghost_ready_migrations(&self, token_hint: &str) -> Result<Vec<Migration>> {
        let grace_modifier = format!("-{} seconds", TOKEN_HINT_GRACE_SECONDS);
        self.read_migrations(
            r#"AND migrations.token = ''
               AND migrations.strategy = 'ghost'
               AND migrations.status = 'ready'
               AND (migrations.token_hint = ?1 OR migrations.ready_timestamp <= datetime('now', ?2))"#,
            &[&token_hint, &grace_modifier],
        )
    }

    pub fn read_migration_by_token(&self, token: &str) -> Result<Option<Migration>> {
        if token.is_empty() {
            return Err(anyhow!("empty token in read_migration_by_token"));
        }
        let migrations = self.read_migrations("AND migrations.token = ?1", &[&token])?;
        Ok(migrations.into_iter().next())
    }

    pub fn read_migration(&self, pr: &PullRequest, table_name: &str) -> Result<Option<Migration>> {
        let migrations = self.read_migrations(
            r#"AND migrations.org = ?1 AND migrations.repo = ?2
               AND migrations.pull_request_number = ?3 AND migrations.mysql_table = ?4"#,
            &[&pr.org, &pr.repo, &pr.number, &table_name],
        )?;
        Ok(migrations.into_iter().next())
    }

    /// Transactional approval: the PR moves detected → queued, suggested
    /// statements become approved, proposed migrations become queued.
    /// Returns the count of migrations affected.
    pub fn queue_pr_migrations(&self, pr: &PullRequest) -> Result<usize> {
        if pr.id == 0 {
            return Err(anyhow!("queue_pr_migrations: pr.id == 0"));
        }
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE pull_requests SET status = 'queued' WHERE status = 'detected' AND id = ?1",
            params![pr.id],
        )?;
        tx.execute(
            "UPDATE pull_request_migration_statements SET status = 'approved' WHERE pull_requests_id = ?1 AND status = 'suggested'",
            params![pr.id],
        )?;
        let count_affected = tx.execute(
            "UPDATE migrations SET status = 'queued' WHERE pull_requests_id = ?1 AND status = 'proposed'",
            params![pr.id],
        )?;
        tx.commit().context("Failed to commit queue-pr-migrations")?;
        Ok(count_affected)
    }

    /// CAS all of a PR's migrations matching (from_status, strategy) to
    /// to_status; used for PR-atomic direct promotion.
    pub fn update_pr_migrations_status(
        &self,
        pr: &PullRequest,
        from_status: MigrationStatus,
        to_status: MigrationStatus,
        with_strategy: MigrationStrategy,
    ) -> Result<usize> {
        if pr.id == 0 {
            return Err(anyhow!("update_pr_migrations_status: pr.id == 0"));
        }
        let side_effects = Self::status_side_effects(to_status);
        let query = format!(
            "UPDATE migrations SET status = ?1{} WHERE pull_requests_id = ?2 AND status = ?3 AND strategy = ?4",
            side_effects
        );
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            &query,
            params![
                to_status.as_str(),
                pr.id,
                from_status.as_str(),
                with_strategy.as_str()
            ],
        )
        .context("Failed to update PR migrations status")
    }

    /// The side-columns each destination status carries along.
    fn status_side_effects(to_status: MigrationStatus) -> &'static str {
        match to_status {
            MigrationStatus::Ready => ", ready_timestamp = datetime('now')",
            MigrationStatus::Running => {
                ", liveness_timestamp = datetime('now'), started_timestamp = COALESCE(started_timestamp, datetime('now'))"
            }
            MigrationStatus::Complete => {
                ", liveness_timestamp = datetime('now'), completed_timestamp = datetime('now'), token = ''"
            }
            MigrationStatus::Failed => ", token = ''",
            _ => "",
        }
    }

    /// CAS on (id, from_status, strategy) → to_status.
    pub fn update_migration_status(
        &self,
        migration: &Migration,
        from_status: MigrationStatus,
        to_status: MigrationStatus,
        with_strategy: MigrationStrategy,
    ) -> Result<usize> {
        if migration.id == 0 {
            return Err(anyhow!("update_migration_status: migration.id == 0"));
        }
        let side_effects = Self::status_side_effects(to_status);
        let query = format!(
            "UPDATE migrations SET status = ?1{} WHERE id = ?2 AND status = ?3 AND strategy = ?4",
            side_effects
        );
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            &query,
            params![
                to_status.as_str(),
                migration.id,
                from_status.as_str(),
                with_strategy.as_str()
            ],
        )
        .context("Failed to update migration status")
    }

    /// CAS on strategy alone.
    pub fn update_migration_strategy(
        &self,
        migration: &Migration,
        from_strategy: MigrationStrategy,
        to_strategy: MigrationStrategy,
    ) -> Result<usize> {
        if migration.id == 0 {
            return Err(anyhow!("update_migration_strategy: migration.id == 0"));
        }
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE migrations SET strategy = ?1 WHERE id = ?2 AND strategy = ?3",
            params![to_strategy.as_str(), migration.id, from_strategy.as_str()],
        )
        .context("Failed to update migration strategy")
    }

    pub fn update_migration_token_hint(&self, migration: &Migration, token_hint: &str) -> Result<()> {
        if migration.id == 0 {
            return Err(anyhow!("update_migration_token_hint: migration.id == 0"));
        }
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE migrations SET token_hint = ?1 WHERE id = ?2",
            params![token_hint, migration.id],
        )
        .context("Failed to update migration token hint")?;
        Ok(())
    }

    /// Claim a specific migration: CAS-write the token where it is empty.
    /// At most one claimant wins; the caller learns the outcome by reading
    /// the token back.
    pub fn own_migration(&self, migration: &Migration, token: &str) -> Result<Option<Migration>> {
        {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                r#"
                UPDATE migrations SET
                    token = ?1,
                    assigned_timestamp = datetime('now'),
                    liveness_timestamp = datetime('now')
                WHERE
                    id = ?2
                    AND token = ''
                "#,
                params![token, migration.id],
            )
            .context("Failed to own migration")?;
        }
        self.read_migration_by_token(token)
    }

    /// Claim any one ready migration of the given strategy.
    pub fn own_ready_migration(
        &self,
        with_strategy: MigrationStrategy,
        token: &str,
    ) -> Result<Option<Migration>> {
        {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                r#"
                UPDATE migrations SET
                    token = ?1,
                    assigned_timestamp = datetime('now'),
                    liveness_timestamp = datetime('now')
                WHERE
                    id = (
                        SELECT id FROM migrations
                        WHERE token = '' AND status = 'ready' AND strategy = ?2
                        LIMIT 1
                    )
                    AND token = ''
                "#,
                params![token, with_strategy.as_str()],
            )
            .context("Failed to own ready migration")?;
        }
        self.read_migration_by_token(token)
    }

    /// Reap rows whose worker stopped heartbeating: any row holding a
    /// token in `in_status` whose liveness is older than `stale_minutes`
    /// loses the token and moves to `to_status`.
    pub fn expire_stale_migrations(
        &self,
        in_status: MigrationStatus,
        to_status: MigrationStatus,
        stale_minutes: i64,
    ) -> Result<()> {
        let stale_modifier = format!("-{} minutes", stale_minutes);
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            UPDATE migrations SET
                token = '',
                status = ?1
            WHERE
                token != ''
                AND status = ?2
                AND liveness_timestamp < datetime('now', ?3)
            "#,
            params![to_status.as_str(), in_status.as_str(), stale_modifier],
        )
        .context("Failed to expire stale migrations")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skeefree_core::{evaluate_strategy, Migration};

    fn backend() -> Backend {
        Backend::new_in_memory().expect("should create in-memory backend")
    }

    fn seed_repository(backend: &Backend, org: &str, repo: &str, autorun: bool) -> Repository {
        let mut r = Repository::new(org, repo);
        r.owner = "dba-team".to_string();
        r.autorun = autorun;
        assert!(backend.add_repository(&mut r).expect("should add repo"));
        r
    }

    fn seed_pr(backend: &Backend, org: &str, repo: &str, number: i64) -> PullRequest {
        let mut pr = PullRequest::new(org, repo, number);
        pr.is_open = true;
        pr.author = "someone".to_string();
        backend.submit_pr(&pr).expect("should submit pr");
        backend.read_pr(org, repo, number).expect("should read pr")
    }

    /// Seed one migration via the real submit flow and return it as read
    /// back from the store.
    fn seed_migration(
        backend: &Backend,
        pr: &PullRequest,
        table: &str,
        statement: &str,
        autorun: bool,
    ) -> Migration {
        backend
            .submit_pr_statements(pr, &[statement.to_string()])
            .expect("should submit statements");
        let statements = backend
            .read_pull_request_migration_statements(pr)
            .expect("should read statements");
        let pr_statement = statements
            .iter()
            .find(|s| s.statement == statement)
            .expect("statement present")
            .clone();
        let mut repo = Repository::new(&pr.org, &pr.repo);
        repo.mysql_schema = "my_schema".to_string();
        let strategy = evaluate_strategy(&pr_statement, autorun);
        let mut m = Migration::new(
            MySQLCluster::named("main"),
            "",
            repo,
            pr.clone(),
            pr_statement,
            strategy,
        );
        m.evaluate().expect("should evaluate");
        assert_eq!(
            backend.submit_migrations(&[m]).expect("should submit"),
            1
        );
        backend
            .read_migration(pr, table)
            .expect("should read migration")
            .expect("migration present")
    }

    fn force_status(backend: &Backend, migration_id: i64, status: &str, token: &str) {
        let conn = backend.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE migrations SET status = ?1, token = ?2, liveness_timestamp = datetime('now') WHERE id = ?3",
            params![status, token, migration_id],
        )
        .expect("should force status");
    }

    fn rewind_timestamp(backend: &Backend, migration_id: i64, column: &str, minutes: i64) {
        let conn = backend.conn.lock().expect("mutex poisoned");
        conn.execute(
            &format!(
                "UPDATE migrations SET {} = datetime('now', '-{} minutes') WHERE id = ?1",
                column, minutes
            ),
            params![migration_id],
        )
        .expect("should rewind timestamp");
    }

    #[test]
    fn test_add_and_read_repository() {
        let backend = backend();
        let r = seed_repository(&backend, "myorg", "my-repo", false);
        assert!(r.id > 0);

        let read = backend.read_repository("myorg", "my-repo").unwrap();
        assert_eq!(read.id, r.id);
        assert_eq!(read.owner, "dba-team");
        assert!(!read.autorun);

        let by_id = backend.read_repository_by_id(r.id).unwrap();
        assert_eq!(by_id.org_repo(), "myorg/my-repo");

        // Insert-ignore: adding again is not an insert.
        let mut again = Repository::new("myorg", "my-repo");
        assert!(!backend.add_repository(&mut again).unwrap());
    }

    #[test]
    fn test_read_repositories_is_alphabetical() {
        let backend = backend();
        seed_repository(&backend, "myorg", "zebra", false);
        seed_repository(&backend, "myorg", "aardvark", false);
        seed_repository(&backend, "another", "middle", false);

        let repos = backend.read_repositories().unwrap();
        let names: Vec<String> = repos.iter().map(|r| r.org_repo()).collect();
        assert_eq!(names, vec!["another/middle", "myorg/aardvark", "myorg/zebra"]);
    }

    #[test]
    fn test_update_and_delete_repository() {
        let backend = backend();
        let mut r = seed_repository(&backend, "myorg", "my-repo", false);

        r.autorun = true;
        r.owner = "other-team".to_string();
        assert!(backend.update_repository(&r).unwrap());
        let read = backend.read_repository("myorg", "my-repo").unwrap();
        assert!(read.autorun);
        assert_eq!(read.owner, "other-team");

        assert!(!backend
            .update_repository(&Repository::new("myorg", "no-such"))
            .unwrap());

        assert!(backend.delete_repository(&read).unwrap());
        assert!(backend.read_repository("myorg", "my-repo").is_err());
        assert!(!backend.delete_repository(&read).unwrap());
    }

    #[test]
    fn test_repository_mapping_replace_semantics() {
        let backend = backend();
        let r = seed_repository(&backend, "myorg", "my-repo", false);

        let mut m = RepositoryProductionMapping::from_repo(&r);
        m.hint = "myfile.sql".to_string();
        m.mysql_cluster = "main".to_string();
        m.mysql_schema = "my_schema".to_string();
        backend.write_repository_mapping(&m).unwrap();

        m.mysql_cluster = "other".to_string();
        backend.write_repository_mapping(&m).unwrap();

        let mappings = backend.read_repository_mappings(&r).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].mysql_cluster, "other");

        backend.remove_repository_mapping(&m).unwrap();
        assert!(backend.read_repository_mappings(&r).unwrap().is_empty());
    }

    #[test]
    fn test_submit_pr_update_then_insert() {
        let backend = backend();
        let mut pr = seed_pr(&backend, "myorg", "my-repo", 42);
        assert!(pr.id > 0);
        assert_eq!(pr.status, PullRequestStatus::Detected);

        pr.title = "add a table".to_string();
        pr.labeled_as_diff = true;
        backend.submit_pr(&pr).unwrap();

        let read = backend.read_pr("myorg", "my-repo", 42).unwrap();
        assert_eq!(read.id, pr.id);
        assert_eq!(read.title, "add a table");
        assert!(read.labeled_as_diff);
        assert!(read.time_probed.is_some());
    }

    #[test]
    fn test_read_open_prs() {
        let backend = backend();
        seed_pr(&backend, "myorg", "my-repo", 1);
        let mut closed = PullRequest::new("myorg", "my-repo", 2);
        closed.is_open = false;
        backend.submit_pr(&closed).unwrap();

        let open = backend.read_open_prs().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].number, 1);
    }

    #[test]
    fn test_statements_lifecycle() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);

        backend
            .submit_pr_statements(
                &pr,
                &[
                    "CREATE TABLE `a` (id int)".to_string(),
                    "DROP TABLE `b`".to_string(),
                ],
            )
            .unwrap();
        let statements = backend.read_pull_request_migration_statements(&pr).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|s| s.status == StatementStatus::Suggested));

        backend.forget_pr_statements_and_migrations(&pr).unwrap();
        assert!(backend
            .read_pull_request_migration_statements(&pr)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_submit_migrations_is_idempotent() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "CREATE TABLE `t0` (id int)", false);
        assert_eq!(m.strategy, MigrationStrategy::Manual);
        assert_eq!(m.status, MigrationStatus::Proposed);
        assert_eq!(m.canonical, "main/my_schema/t0");

        // Same (pr, statement, shard): insert-ignore.
        assert_eq!(backend.submit_migrations(&[m]).unwrap(), 0);
    }

    #[test]
    fn test_queue_pr_migrations() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        seed_migration(&backend, &pr, "t0", "CREATE TABLE `t0` (id int)", true);

        let count = backend.queue_pr_migrations(&pr).unwrap();
        assert_eq!(count, 1);

        let read = backend.read_pr("myorg", "my-repo", 1).unwrap();
        assert_eq!(read.status, PullRequestStatus::Queued);
        let statements = backend.read_pull_request_migration_statements(&pr).unwrap();
        assert!(statements.iter().all(|s| s.status == StatementStatus::Approved));
        let migrations = backend.read_non_cancelled_migrations(Some(&pr)).unwrap();
        assert!(migrations.iter().all(|m| m.status == MigrationStatus::Queued));

        // Second call is a no-op.
        assert_eq!(backend.queue_pr_migrations(&pr).unwrap(), 0);
    }

    #[test]
    fn test_update_migration_status_side_columns() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "CREATE TABLE `t0` (id int)", true);
        backend.queue_pr_migrations(&pr).unwrap();

        // CAS miss: wrong from-status.
        assert_eq!(
            backend
                .update_migration_status(
                    &m,
                    MigrationStatus::Proposed,
                    MigrationStatus::Ready,
                    MigrationStrategy::Direct,
                )
                .unwrap(),
            0
        );

        assert_eq!(
            backend
                .update_migration_status(
                    &m,
                    MigrationStatus::Queued,
                    MigrationStatus::Ready,
                    MigrationStrategy::Direct,
                )
                .unwrap(),
            1
        );
        let read = backend.read_migration(&pr, "t0").unwrap().unwrap();
        assert_eq!(read.status, MigrationStatus::Ready);
        assert!(read.time_ready.is_some());

        assert_eq!(
            backend
                .update_migration_status(
                    &m,
                    MigrationStatus::Ready,
                    MigrationStatus::Running,
                    MigrationStrategy::Direct,
                )
                .unwrap(),
            1
        );
        let read = backend.read_migration(&pr, "t0").unwrap().unwrap();
        assert_eq!(read.status, MigrationStatus::Running);
        assert!(read.time_started.is_some());
        assert!(read.time_liveness.is_some());

        assert_eq!(
            backend
                .update_migration_status(
                    &m,
                    MigrationStatus::Running,
                    MigrationStatus::Complete,
                    MigrationStrategy::Direct,
                )
                .unwrap(),
            1
        );
        let read = backend.read_migration(&pr, "t0").unwrap().unwrap();
        assert_eq!(read.status, MigrationStatus::Complete);
        assert!(read.time_completed.is_some());
        assert!(read.time_started.is_some());
        assert_eq!(read.token, "");
    }

    #[test]
    fn test_update_migration_status_guards_on_strategy() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "CREATE TABLE `t0` (id int)", true);
        backend.queue_pr_migrations(&pr).unwrap();

        // The migration is direct; a ghost-guarded CAS must not apply.
        assert_eq!(
            backend
                .update_migration_status(
                    &m,
                    MigrationStatus::Queued,
                    MigrationStatus::Ready,
                    MigrationStrategy::Ghost,
                )
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_update_migration_strategy() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "ALTER TABLE `t0` ADD COLUMN c int", false);
        assert_eq!(m.strategy, MigrationStrategy::Manual);

        assert_eq!(
            backend
                .update_migration_strategy(&m, MigrationStrategy::Manual, MigrationStrategy::Ghost)
                .unwrap(),
            1
        );
        // CAS miss on a second identical call.
        assert_eq!(
            backend
                .update_migration_strategy(&m, MigrationStrategy::Manual, MigrationStrategy::Ghost)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_own_migration_is_exclusive() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "ALTER TABLE `t0` ADD COLUMN c int", true);
        backend.queue_pr_migrations(&pr).unwrap();
        backend
            .update_migration_status(
                &m,
                MigrationStatus::Queued,
                MigrationStatus::Ready,
                MigrationStrategy::Ghost,
            )
            .unwrap();

        let owned = backend.own_migration(&m, "worker-a").unwrap();
        assert!(owned.is_some());
        assert_eq!(owned.unwrap().token, "worker-a");

        // Second claimant loses: token is no longer empty.
        let not_owned = backend.own_migration(&m, "worker-b").unwrap();
        assert!(not_owned.is_none());
    }

    #[test]
    fn test_own_ready_migration_picks_matching_strategy_only() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let ghost = seed_migration(&backend, &pr, "t0", "ALTER TABLE `t0` ADD COLUMN c int", true);
        backend.queue_pr_migrations(&pr).unwrap();
        backend
            .update_migration_status(
                &ghost,
                MigrationStatus::Queued,
                MigrationStatus::Ready,
                MigrationStrategy::Ghost,
            )
            .unwrap();

        // No ready direct migration exists.
        assert!(backend
            .own_ready_migration(MigrationStrategy::Direct, "token-1")
            .unwrap()
            .is_none());
        let owned = backend
            .own_ready_migration(MigrationStrategy::Ghost, "token-2")
            .unwrap();
        assert!(owned.is_some());
        assert_eq!(owned.unwrap().id, ghost.id);
    }

    #[test]
    fn test_read_ghost_ready_migrations_site_hint_and_grace() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "ALTER TABLE `t0` ADD COLUMN c int", true);
        backend.queue_pr_migrations(&pr).unwrap();
        backend.update_migration_token_hint(&m, "site-a").unwrap();
        backend
            .update_migration_status(
                &m,
                MigrationStatus::Queued,
                MigrationStatus::Ready,
                MigrationStrategy::Ghost,
            )
            .unwrap();

        // Matching hint: claimable.
        assert_eq!(backend.read_ghost_ready_migrations("site-a").unwrap().len(), 1);
        // Mismatched hint within the grace period: not claimable.
        assert!(backend.read_ghost_ready_migrations("site-b").unwrap().is_empty());
        // Past the grace period any site may claim.
        rewind_timestamp(&backend, m.id, "ready_timestamp", 6);
        assert_eq!(backend.read_ghost_ready_migrations("site-b").unwrap().len(), 1);
    }

    #[test]
    fn test_expire_stale_running_migration() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "ALTER TABLE `t0` ADD COLUMN c int", true);
        force_status(&backend, m.id, "running", "worker-a");
        rewind_timestamp(&backend, m.id, "liveness_timestamp", 11);

        backend
            .expire_stale_migrations(MigrationStatus::Running, MigrationStatus::Failed, 10)
            .unwrap();

        let read = backend.read_migration(&pr, "t0").unwrap().unwrap();
        assert_eq!(read.status, MigrationStatus::Failed);
        assert_eq!(read.token, "");
    }

    #[test]
    fn test_expire_stale_leaves_live_migrations_alone() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "ALTER TABLE `t0` ADD COLUMN c int", true);
        force_status(&backend, m.id, "running", "worker-a");

        backend
            .expire_stale_migrations(MigrationStatus::Running, MigrationStatus::Failed, 10)
            .unwrap();

        let read = backend.read_migration(&pr, "t0").unwrap().unwrap();
        assert_eq!(read.status, MigrationStatus::Running);
        assert_eq!(read.token, "worker-a");
    }

    #[test]
    fn test_forget_pr_rejected_while_running() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "CREATE TABLE `t0` (id int)", true);
        force_status(&backend, m.id, "running", "worker-a");

        let err = backend.forget_pr(&pr).unwrap_err();
        assert!(err.to_string().contains("running"));

        // Nothing was deleted.
        assert!(backend.read_pr("myorg", "my-repo", 1).is_ok());
        assert!(backend.read_migration(&pr, "t0").unwrap().is_some());
    }

    #[test]
    fn test_forget_pr_deletes_pre_run_state() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        seed_migration(&backend, &pr, "t0", "CREATE TABLE `t0` (id int)", true);

        backend.forget_pr(&pr).unwrap();

        assert!(backend.read_pr("myorg", "my-repo", 1).is_err());
        assert!(backend.read_non_cancelled_migrations(Some(&pr)).unwrap().is_empty());
    }

    #[test]
    fn test_read_non_cancelled_migrations_ordering() {
        let backend = backend();
        let low = seed_pr(&backend, "myorg", "my-repo", 1);
        seed_migration(&backend, &low, "a", "CREATE TABLE `a` (id int)", true);
        let urgent = seed_pr(&backend, "myorg", "my-repo", 2);
        seed_migration(&backend, &urgent, "b", "CREATE TABLE `b` (id int)", true);
        backend
            .update_pr_priority(&urgent, PullRequestPriority::Urgent)
            .unwrap();

        let migrations = backend.read_non_cancelled_migrations(None).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].pr.number, 2);
        assert_eq!(migrations[1].pr.number, 1);
    }

    #[test]
    fn test_completion_sweep_candidates() {
        let backend = backend();
        let pr = seed_pr(&backend, "myorg", "my-repo", 1);
        let m = seed_migration(&backend, &pr, "t0", "CREATE TABLE `t0` (id int)", true);

        assert!(backend
            .read_non_completed_prs_with_completed_migrations()
            .unwrap()
            .is_empty());

        force_status(&backend, m.id, "complete", "");
        let candidates = backend
            .read_non_completed_prs_with_completed_migrations()
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].number, 1);

        backend
            .update_pr_status(&pr, PullRequestStatus::Complete)
            .unwrap();
        assert!(backend
            .read_non_completed_prs_with_completed_migrations()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_leadership_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.db");
        let a = Backend::new_with_service_id(&path, "service-a").unwrap();
        let b = Backend::new_with_service_id(&path, "service-b").unwrap();

        a.attempt_leadership().unwrap();
        a.refresh_leadership().unwrap();
        assert!(a.is_leader());

        b.attempt_leadership().unwrap();
        b.refresh_leadership().unwrap();
        assert!(!b.is_leader());
        assert!(b.is_healthy());
        assert_eq!(b.state_description(), "Healthy");
        assert_eq!(a.state_description(), "Leader");
    }

    #[test]
    fn test_leadership_takeover_after_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.db");
        let a = Backend::new_with_service_id(&path, "service-a").unwrap();
        let b = Backend::new_with_service_id(&path, "service-b").unwrap();

        a.attempt_leadership().unwrap();

        // Expire the lease.
        {
            let conn = a.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE service_election SET last_seen_active = datetime('now', '-10 seconds')",
                [],
            )
            .unwrap();
        }

        b.attempt_leadership().unwrap();
        b.refresh_leadership().unwrap();
        assert!(b.is_leader());

        a.refresh_leadership().unwrap();
        assert!(!a.is_leader());

        // The takeover refreshed the lease: a cannot immediately reclaim.
        a.attempt_leadership().unwrap();
        a.refresh_leadership().unwrap();
        assert!(!a.is_leader());
    }
}
