use std::collections::HashMap;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static ORG_REPO_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^([^/]+)/([^/]+)$").unwrap());
static ORGLESS_REPO_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^([^/]+)$").unwrap());

/// Resolve `(org, repo)` from command parameters. The `repo` parameter may
/// carry an explicit `org/repo`; otherwise the `org` parameter or the
/// configured default org applies.
pub fn parse_org_repo(params: &HashMap<String, String>, default_org: &str) -> Result<(String, String)> {
    let repo_param = params.get("repo").map(String::as_str).unwrap_or("");

    if let Some(captures) = ORG_REPO_RE.captures(repo_param) {
        return Ok((captures[1].to_string(), captures[2].to_string()));
    }
    if let Some(captures) = ORGLESS_REPO_RE.captures(repo_param) {
        let org = match params.get("org") {
            Some(org) if !org.is_empty() => org.clone(),
            _ => default_org.to_string(),
        };
        return Ok((org, captures[1].to_string()));
    }
    Err(anyhow!("unable to parse org/repo from {:?}", params))
}

/// A stable token derived from this host's name. Used as the election
/// service id and as the worker's lease token; at most one process per
/// host may run.
pub fn hostname_token() -> Result<String> {
    let hostname = gethostname::gethostname();
    let hostname = hostname
        .to_str()
        .ok_or_else(|| anyhow!("hostname is not valid UTF-8"))?;
    if hostname.is_empty() {
        return Err(anyhow!("empty hostname"));
    }
    Ok(hostname.to_string())
}

/// A unique lease token for the direct applier.
pub fn pretty_unique_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_org_repo_explicit() {
        let (org, repo) = parse_org_repo(&params(&[("repo", "github/freno")]), "myorg").unwrap();
        assert_eq!(org, "github");
        assert_eq!(repo, "freno");
    }

    #[test]
    fn test_parse_org_repo_default_org() {
        let (org, repo) = parse_org_repo(&params(&[("repo", "freno")]), "myorg").unwrap();
        assert_eq!(org, "myorg");
        assert_eq!(repo, "freno");
    }

    #[test]
    fn test_parse_org_repo_org_param() {
        let (org, repo) =
            parse_org_repo(&params(&[("repo", "freno"), ("org", "otherorg")]), "myorg").unwrap();
        assert_eq!(org, "otherorg");
        assert_eq!(repo, "freno");
    }

    #[test]
    fn test_parse_org_repo_invalid() {
        assert!(parse_org_repo(&params(&[("repo", "a/b/c")]), "myorg").is_err());
        assert!(parse_org_repo(&params(&[]), "myorg").is_err());
    }

    #[test]
    fn test_pretty_unique_token_is_unique() {
        assert_ne!(pretty_unique_token(), pretty_unique_token());
    }
}
