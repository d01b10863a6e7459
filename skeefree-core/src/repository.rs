use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::pull_request::PullRequest;

/// A repository registered with skeefree. `mysql_cluster`/`mysql_schema`
/// are transient: they are resolved from the production mapping during PR
/// evaluation and are never persisted on this record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub org: String,
    pub repo: String,
    pub owner: String,
    pub autorun: bool,
    #[serde(skip)]
    pub mysql_cluster: String,
    #[serde(skip)]
    pub mysql_schema: String,
    pub time_added: Option<NaiveDateTime>,
    pub time_updated: Option<NaiveDateTime>,
}

impl Repository {
    pub fn new(org: &str, repo: &str) -> Repository {
        Repository {
            org: org.to_string(),
            repo: repo.to_string(),
            ..Default::default()
        }
    }

    pub fn from_pull_request(pr: &PullRequest) -> Repository {
        Repository::new(&pr.org, &pr.repo)
    }

    pub fn has_org_repo(&self) -> bool {
        !self.org.is_empty() && !self.repo.is_empty()
    }

    pub fn org_repo(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }
}

/// Maps a diff hint (file name or schema name) onto a production cluster
/// and schema. A repository may carry many mappings; the one whose hint
/// equals the diff's file name or schema name is selected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryProductionMapping {
    pub id: i64,
    pub org: String,
    pub repo: String,
    pub hint: String,
    pub mysql_cluster: String,
    pub mysql_schema: String,
    pub time_added: Option<NaiveDateTime>,
    pub time_updated: Option<NaiveDateTime>,
}

impl RepositoryProductionMapping {
    pub fn from_repo(repo: &Repository) -> RepositoryProductionMapping {
        RepositoryProductionMapping {
            org: repo.org.clone(),
            repo: repo.repo.clone(),
            ..Default::default()
        }
    }
}
