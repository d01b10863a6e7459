//! PR host (GitHub) API client: the read/mutate surface the coordinator
//! consumes. All calls are plain token-authenticated v3 REST.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;

pub const MIGRATION_DIFF_LABEL: &str = "migration:skeema:diff";
pub const MIGRATION_DETECTED_LABEL: &str = "migration:skeefree:detected";
pub const MIGRATION_QUEUED_LABEL: &str = "migration:skeefree:queued";
pub const MIGRATION_APPROVED_BY_DB_REVIEWERS_LABEL: &str = "migration:approved:schema-reviewers";
pub const MIGRATION_APPROVED_BY_DB_INFRA_LABEL: &str = "migration:approved:database-team";
pub const MIGRATION_FOR_REVIEW_LABEL: &str = "migration:for:review";
/// Alternate for-review label kept for backwards compatibility.
pub const MIGRATION_FOR_REVIEW_ALTERNATE_LABEL: &str = "DB migration";

pub const CHECK_RUN_SUCCESSFUL_CONCLUSION: &str = "success";

const MAGIC_COMMENT_HINT: &str = "<!-- skeema:magic:comment -->";
const API_BASE: &str = "https://api.github.com";
const TEAM_MEMBERS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    base_url: String,
    /// Team membership cache: team slug -> (member logins, fetched-at).
    team_members: Arc<RwLock<HashMap<String, (HashSet<String>, Instant)>>>,
}

#[derive(Debug, Deserialize)]
pub struct PullResponse {
    pub state: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub user: UserResponse,
    #[serde(default)]
    pub labels: Vec<LabelResponse>,
    pub head: PullRefResponse,
}

#[derive(Debug, Deserialize)]
pub struct UserResponse {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct LabelResponse {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRefResponse {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    state: String,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct RequestedReviewersResponse {
    #[serde(default)]
    teams: Vec<TeamResponse>,
}

#[derive(Debug, Deserialize)]
struct TeamResponse {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct TeamMemberResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    body: String,
}

#[derive(Debug, Deserialize)]
struct SearchIssuesResponse {
    #[serde(default)]
    items: Vec<SearchIssueResponse>,
}

#[derive(Debug, Deserialize)]
struct SearchIssueResponse {
    number: i64,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    #[serde(default)]
    conclusion: Option<String>,
}

impl GitHubClient {
    pub fn new(api_token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("token {}", api_token))
            .context("GitHub API token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("skeefree"));

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to build GitHub HTTP client")?;

        Ok(Self {
            client,
            base_url: API_BASE.to_string(),
            team_members: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} returned {}: {}", url, status, body));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("GET {}: failed to decode response", url))
    }

    /// Validates that a requested repository exists and is accessible.
    pub async fn validate_repo(&self, org: &str, repo: &str) -> Result<()> {
        let url = format!("{}/repos/{}/{}", self.base_url, org, repo);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("repository {}/{} not found or not accessible", org, repo));
        }
        Ok(())
    }

    /// Validates that a team exists and carries the given repo.
    pub async fn validate_admin_team(&self, org: &str, repo: &str, team_slug: &str) -> Result<()> {
        let url = format!(
            "{}/orgs/{}/teams/{}/repos/{}/{}",
            self.base_url, org, team_slug, org, repo
        );
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github.v3.repository+json")
            .send()
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(anyhow!(
                "team validation error: team {} is not an owner of {}/{}",
                team_slug,
                org,
                repo
            )),
            status => Err(anyhow!(
                "team validation for {} on {}/{} returned {}",
                team_slug,
                org,
                repo,
                status
            )),
        }
    }

    /// Checks if a given user (login) is member of given team (slug).
    /// The result of this function is cached.
    pub async fn is_team_member(&self, org: &str, user: &str, team_slug: &str) -> Result<bool> {
        {
            let cache = self.team_members.read().await;
            if let Some((members, fetched_at)) = cache.get(team_slug) {
                if fetched_at.elapsed() < TEAM_MEMBERS_CACHE_TTL {
                    return Ok(members.contains(user));
                }
            }
        }

        let url = format!(
            "{}/orgs/{}/teams/{}/members?per_page=100",
            self.base_url, org, team_slug
        );
        let members: Vec<TeamMemberResponse> = self.get_json(&url).await?;
        let members: HashSet<String> = members.into_iter().map(|m| m.login).collect();
        let is_member = members.contains(user);

        let mut cache = self.team_members.write().await;
        cache.insert(team_slug.to_string(), (members, Instant::now()));
        Ok(is_member)
    }

    pub async fn read_pull_request(&self, org: &str, repo: &str, number: i64) -> Result<PullResponse> {
        let url = format!("{}/repos/{}/{}/pulls/{}", self.base_url, org, repo, number);
        self.get_json(&url).await
    }

    async fn list_reviews(&self, org: &str, repo: &str, number: i64) -> Result<Vec<ReviewResponse>> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/reviews?per_page=100",
            self.base_url, org, repo, number
        );
        self.get_json(&url).await
    }

    /// Whether any member of the given team has an APPROVED review on the
    /// PR.
    pub async fn pull_request_approved_by_team(
        &self,
        org: &str,
        repo: &str,
        number: i64,
        team_slug: &str,
    ) -> Result<bool> {
        let reviews = self.list_reviews(org, repo, number).await?;
        for review in reviews {
            if review.state != "APPROVED" {
                continue;
            }
            if self.is_team_member(org, &review.user.login, team_slug).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether there is at least one APPROVED review on the PR.
    pub async fn pull_request_approved_by_someone(
        &self,
        org: &str,
        repo: &str,
        number: i64,
    ) -> Result<bool> {
        let reviews = self.list_reviews(org, repo, number).await?;
        Ok(reviews.iter().any(|review| review.state == "APPROVED"))
    }

    /// Checks if a team is already requested to review a PR.
    pub async fn team_requested_to_review_pull_request(
        &self,
        org: &str,
        repo: &str,
        number: i64,
        team_slug: &str,
    ) -> Result<bool> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/requested_reviewers",
            self.base_url, org, repo, number
        );
        let requested: RequestedReviewersResponse = self.get_json(&url).await?;
        Ok(requested.teams.iter().any(|team| team.slug == team_slug))
    }

    /// Requests a review from a team unless one is already requested.
    /// Returns whether the request was newly placed.
    pub async fn request_pull_request_review(
        &self,
        org: &str,
        repo: &str,
        number: i64,
        team_slug: &str,
    ) -> Result<bool> {
        if self
            .team_requested_to_review_pull_request(org, repo, number, team_slug)
            .await?
        {
            // no need to re-request
            return Ok(false);
        }
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/requested_reviewers",
            self.base_url, org, repo, number
        );
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "team_reviewers": [team_slug] }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "requesting review from {} on {}/{}/pull/{} returned {}",
                team_slug,
                org,
                repo,
                number,
                response.status()
            ));
        }
        Ok(true)
    }

    /// The body of the magic comment carrying the skeema diff. Errors when
    /// no such comment exists; callers fall back to the PR body.
    pub async fn read_pull_request_magic_comment(
        &self,
        org: &str,
        repo: &str,
        number: i64,
    ) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments?per_page=100",
            self.base_url, org, repo, number
        );
        let comments: Vec<CommentResponse> = self.get_json(&url).await?;
        comments
            .into_iter()
            .find(|comment| comment.body.starts_with(MAGIC_COMMENT_HINT))
            .map(|comment| comment.body)
            .ok_or_else(|| anyhow!("could not find magic comment on {}/{}/pull/{}", org, repo, number))
    }

    pub async fn add_pull_request_comment(
        &self,
        org: &str,
        repo: &str,
        number: i64,
        comment: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.base_url, org, repo, number
        );
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "body": comment }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "adding comment on {}/{}/pull/{} returned {}",
                org,
                repo,
                number,
                response.status()
            ));
        }
        Ok(())
    }

    /// Adds a label to a PR. The label should exist beforehand.
    pub async fn add_pull_request_label(
        &self,
        org: &str,
        repo: &str,
        number: i64,
        label: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/labels",
            self.base_url, org, repo, number
        );
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "labels": [label] }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "adding label {} on {}/{}/pull/{} returned {}",
                label,
                org,
                repo,
                number,
                response.status()
            ));
        }
        Ok(())
    }

    pub async fn remove_pull_request_label(
        &self,
        org: &str,
        repo: &str,
        number: i64,
        label: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/labels/{}",
            self.base_url, org, repo, number, label
        );
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "removing label {} on {}/{}/pull/{} returned {}",
                label,
                org,
                repo,
                number,
                response.status()
            ));
        }
        Ok(())
    }

    /// Open PRs carrying the diff label but not yet the detected label.
    /// Returns the matching PR numbers along with the search string used.
    pub async fn search_skeema_diff_undetected_prs(
        &self,
        org_repo: &str,
    ) -> Result<(Vec<i64>, String)> {
        let search_string = format!(
            "repo:{} is:pr state:open label:{} -label:{}",
            org_repo, MIGRATION_DIFF_LABEL, MIGRATION_DETECTED_LABEL
        );
        let url = format!(
            "{}/search/issues?per_page=100&q={}",
            self.base_url,
            urlencode(&search_string)
        );
        let result: SearchIssuesResponse = self.get_json(&url).await?;
        let numbers = result.items.into_iter().map(|issue| issue.number).collect();
        Ok((numbers, search_string))
    }

    /// Whether the skeema CI check run on the PR's head ref concluded
    /// successfully.
    pub async fn is_skeema_check_passing(
        &self,
        org: &str,
        repo: &str,
        number: i64,
        check_name: &str,
    ) -> Result<bool> {
        let pull = self.read_pull_request(org, repo, number).await?;
        let url = format!(
            "{}/repos/{}/{}/commits/{}/check-runs?check_name={}",
            self.base_url,
            org,
            repo,
            pull.head.ref_name,
            urlencode(check_name)
        );
        let result: CheckRunsResponse = self.get_json(&url).await?;
        let check_run = result.check_runs.first().ok_or_else(|| {
            anyhow!(
                "could not find skeema check with name \"{}\" for {}/{}/pull/{}",
                check_name,
                org,
                repo,
                number
            )
        })?;
        Ok(check_run.conclusion.as_deref() == Some(CHECK_RUN_SUCCESSFUL_CONCLUSION))
    }
}

/// Minimal query-string escaping for the few reserved characters the
/// search and check-run queries can carry.
fn urlencode(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => encoded.push_str("%20"),
            '#' => encoded.push_str("%23"),
            '&' => encoded.push_str("%26"),
            '+' => encoded.push_str("%2B"),
            '?' => encoded.push_str("%3F"),
            _ => encoded.push(c),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencode() {
        assert_eq!(
            urlencode("repo:a/b is:pr label:x"),
            "repo:a/b%20is:pr%20label:x"
        );
        assert_eq!(urlencode("a+b&c"), "a%2Bb%26c");
    }
}
