//! Topology access: direct connections to production masters for running
//! DDL and for master-instance discovery.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor, MySqlConnection, Row};

use skeefree_core::Migration;

use crate::config::Config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to the RW endpoint of the migration's cluster, using the
/// dedicated DDL account.
pub struct TopologyDb {
    conn: MySqlConnection,
}

impl TopologyDb {
    pub async fn connect(cfg: &Config, migration: &Migration) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&migration.cluster.rw_name)
            .port(migration.cluster.port)
            .username(&cfg.ddl_user)
            .password(&cfg.ddl_pass)
            .database(&migration.repo.mysql_schema)
            .disable_statement_logging();
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, options.connect())
            .await
            .with_context(|| {
                format!(
                    "timed out connecting to {}:{}",
                    migration.cluster.rw_name, migration.cluster.port
                )
            })?
            .with_context(|| {
                format!(
                    "failed to connect to {}:{}",
                    migration.cluster.rw_name, migration.cluster.port
                )
            })?;
        Ok(Self { conn })
    }

    /// Friendly health check: is the host read-only? A read-only master
    /// means we looked up the wrong host, or a failover is in flight.
    pub async fn ping_read_only(&mut self) -> Result<bool> {
        let row = sqlx::query("SELECT @@global.read_only")
            .fetch_one(&mut self.conn)
            .await
            .context("failed to read @@global.read_only")?;
        let read_only: i64 = row.try_get(0)?;
        Ok(read_only != 0)
    }

    /// The master's own hostname, for site resolution.
    pub async fn master_hostname(&mut self) -> Result<String> {
        let row = sqlx::query("SELECT @@hostname")
            .fetch_one(&mut self.conn)
            .await
            .context("failed to read @@hostname")?;
        let hostname: String = row.try_get(0)?;
        Ok(hostname)
    }

    /// Execute one DDL statement.
    pub async fn exec(&mut self, statement: &str) -> Result<u64> {
        let result = self
            .conn
            .execute(statement)
            .await
            .with_context(|| format!("failed to execute statement: {}", statement))?;
        Ok(result.rows_affected())
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await.context("failed to close connection")
    }
}
