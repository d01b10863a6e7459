use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Clone)]
pub struct Config {
    /// Listen address for the HTTP surface. HTTP_ADDR, default ":8080".
    pub http_addr: String,
    /// Informational internal address; logged at boot. INTERNAL_ADDR.
    pub internal_addr: Option<String>,
    /// Directory for the backend state database.
    /// Defaults to current working directory.
    pub state_dir: PathBuf,

    /// Account with DDL privileges on all production masters.
    pub ddl_user: String,
    pub ddl_pass: String,

    /// Token used to examine the org, teams, and manipulate PRs.
    pub github_api_token: String,

    /// Site/host inventory service.
    pub sites_api_url: String,
    pub sites_api_password: String,
    /// MySQL fleet inventory service.
    pub mysql_discovery_api_url: String,

    /// Currently a single org is supported.
    pub default_org: String,

    /// Team slugs; both must exist in the org.
    pub db_infra_team: String,
    pub db_reviewers_team: String,
}

/// Read a required config value.
///
/// For a key like "SKEEFREE_DDL_PASS":
/// 1. Check if SKEEFREE_DDL_PASS_FILE is set - if so, read from that file path
/// 2. Otherwise, check SKEEFREE_DDL_PASS env var directly
fn read_secret(key: &str) -> Result<String> {
    let file_key = format!("{}_FILE", key);

    if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        // Trim trailing whitespace (files often have trailing newlines)
        Ok(contents.trim_end().to_string())
    } else {
        env::var(key)
            .with_context(|| format!("{} or {} environment variable is required", key, file_key))
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let http_addr = env::var("HTTP_ADDR").unwrap_or_else(|_| ":8080".to_string());
        let internal_addr = env::var("INTERNAL_ADDR").ok().filter(|s| !s.is_empty());

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let ddl_user = read_secret("SKEEFREE_DDL_USER")?;
        let ddl_pass = read_secret("SKEEFREE_DDL_PASS")?;

        let github_api_token = read_secret("GITHUB_API_TOKEN")?;

        let sites_api_url = env::var("SITES_API_URL").context("SITES_API_URL is required")?;
        let sites_api_password = read_secret("SITES_API_PASSWORD")?;
        let mysql_discovery_api_url =
            env::var("MYSQL_DISCOVERY_API_URL").context("MYSQL_DISCOVERY_API_URL is required")?;

        let default_org = env::var("SKEEFREE_DEFAULT_ORG").context("SKEEFREE_DEFAULT_ORG is required")?;

        let db_infra_team =
            env::var("SKEEFREE_DB_INFRA_TEAM").unwrap_or_else(|_| "database-team".to_string());
        let db_reviewers_team = env::var("SKEEFREE_DB_REVIEWERS_TEAM")
            .unwrap_or_else(|_| "db-schema-reviewers".to_string());

        Ok(Config {
            http_addr,
            internal_addr,
            state_dir,
            ddl_user,
            ddl_pass,
            github_api_token,
            sites_api_url,
            sites_api_password,
            mysql_discovery_api_url,
            default_org,
            db_infra_team,
            db_reviewers_team,
        })
    }

    /// Bindable socket address; a bare ":8080" means all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_secret_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "secret-value").unwrap();

        env::set_var("SKTEST_SECRET_FILE", file.path());
        env::remove_var("SKTEST_SECRET");

        let result = read_secret("SKTEST_SECRET").unwrap();
        assert_eq!(result, "secret-value");

        env::remove_var("SKTEST_SECRET_FILE");
    }

    #[test]
    fn test_read_secret_from_env() {
        env::remove_var("SKTEST_SECRET2_FILE");
        env::set_var("SKTEST_SECRET2", "env-value");

        let result = read_secret("SKTEST_SECRET2").unwrap();
        assert_eq!(result, "env-value");

        env::remove_var("SKTEST_SECRET2");
    }

    #[test]
    fn test_read_secret_file_takes_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-value").unwrap();

        env::set_var("SKTEST_SECRET3_FILE", file.path());
        env::set_var("SKTEST_SECRET3", "env-value");

        let result = read_secret("SKTEST_SECRET3").unwrap();
        assert_eq!(result, "file-value");

        env::remove_var("SKTEST_SECRET3_FILE");
        env::remove_var("SKTEST_SECRET3");
    }

    #[test]
    fn test_read_secret_missing() {
        env::remove_var("SKTEST_SECRET4_FILE");
        env::remove_var("SKTEST_SECRET4");

        assert!(read_secret("SKTEST_SECRET4").is_err());
    }

    #[test]
    fn test_bind_addr() {
        let mut config = Config {
            http_addr: ":8080".to_string(),
            internal_addr: None,
            state_dir: PathBuf::from("."),
            ddl_user: String::new(),
            ddl_pass: String::new(),
            github_api_token: String::new(),
            sites_api_url: String::new(),
            sites_api_password: String::new(),
            mysql_discovery_api_url: String::new(),
            default_org: String::new(),
            db_infra_team: String::new(),
            db_reviewers_team: String::new(),
        };
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        config.http_addr = "127.0.0.1:3000".to_string();
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
    }
}
