pub mod applier;
pub mod commands;
pub mod config;
pub mod db;
pub mod github;
pub mod http;
pub mod inventory;
pub mod observer;
pub mod ops;
pub mod scheduler;
pub mod topology;
pub mod util;
pub mod worker;

use anyhow::Result;

pub use config::Config;
pub use db::Backend;
pub use github::GitHubClient;
pub use inventory::{MySQLDiscoveryApi, SitesApi};

/// Shared application state: configuration, the backend store, and the
/// external API clients. Wrapped in an `Arc` and handed to every loop,
/// handler and command.
pub struct AppState {
    pub cfg: Config,
    pub backend: Backend,
    pub github: GitHubClient,
    pub sites_api: SitesApi,
    pub mysql_discovery_api: MySQLDiscoveryApi,
}

impl AppState {
    pub fn new(cfg: Config) -> Result<Self> {
        let db_path = cfg.state_dir.join("skeefree.db");
        let backend = Backend::new(&db_path)?;
        let github = GitHubClient::new(&cfg.github_api_token)?;
        let sites_api = SitesApi::new(&cfg.sites_api_url, &cfg.sites_api_password)?;
        let mysql_discovery_api = MySQLDiscoveryApi::new(&cfg.mysql_discovery_api_url)?;
        Ok(Self {
            cfg,
            backend,
            github,
            sites_api,
            mysql_discovery_api,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.backend.is_leader()
    }
}
