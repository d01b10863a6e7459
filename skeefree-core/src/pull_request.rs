use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Workflow status of a pull request as tracked by skeefree.
///
/// Monotonic across detected → queued → complete, with cancelled as a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullRequestStatus {
    Detected,
    Queued,
    Cancelled,
    Complete,
    Unknown,
}

impl PullRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullRequestStatus::Detected => "detected",
            PullRequestStatus::Queued => "queued",
            PullRequestStatus::Cancelled => "cancelled",
            PullRequestStatus::Complete => "complete",
            PullRequestStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> PullRequestStatus {
        match s {
            "detected" => PullRequestStatus::Detected,
            "queued" => PullRequestStatus::Queued,
            "cancelled" => PullRequestStatus::Cancelled,
            "complete" => PullRequestStatus::Complete,
            _ => PullRequestStatus::Unknown,
        }
    }
}

impl fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for PullRequestStatus {
    fn default() -> Self {
        PullRequestStatus::Detected
    }
}

/// Scheduling priority, encoded -1..2 in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PullRequestPriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl PullRequestPriority {
    pub fn to_i64(&self) -> i64 {
        match self {
            PullRequestPriority::Urgent => 2,
            PullRequestPriority::High => 1,
            PullRequestPriority::Normal => 0,
            PullRequestPriority::Low => -1,
        }
    }

    pub fn from_i64(value: i64) -> PullRequestPriority {
        match value {
            2 => PullRequestPriority::Urgent,
            1 => PullRequestPriority::High,
            -1 => PullRequestPriority::Low,
            _ => PullRequestPriority::Normal,
        }
    }

    pub fn to_text(&self) -> &'static str {
        match self {
            PullRequestPriority::Urgent => "urgent",
            PullRequestPriority::High => "high",
            PullRequestPriority::Normal => "normal",
            PullRequestPriority::Low => "low",
        }
    }

    /// Unknown text maps to normal.
    pub fn from_text(text: &str) -> PullRequestPriority {
        match text {
            "urgent" => PullRequestPriority::Urgent,
            "high" => PullRequestPriority::High,
            "low" => PullRequestPriority::Low,
            _ => PullRequestPriority::Normal,
        }
    }
}

impl Default for PullRequestPriority {
    fn default() -> Self {
        PullRequestPriority::Normal
    }
}

/// A pull request under management, enriched with label and review state
/// mirrored from the PR host on every probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    pub org: String,
    pub repo: String,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub priority: PullRequestPriority,
    pub status: PullRequestStatus,
    pub is_open: bool,
    pub requested_review_by_db_reviewers: bool,
    pub approved_by_db_reviewers: bool,
    pub requested_review_by_db_infra: bool,
    pub approved_by_db_infra: bool,
    pub labeled_as_diff: bool,
    pub labeled_as_detected: bool,
    pub labeled_as_queued: bool,
    pub labeled_for_review: bool,
    pub time_added: Option<NaiveDateTime>,
    pub time_probed: Option<NaiveDateTime>,
}

impl PullRequest {
    pub fn new(org: &str, repo: &str, number: i64) -> PullRequest {
        PullRequest {
            org: org.to_string(),
            repo: repo.to_string(),
            number,
            priority: PullRequestPriority::Normal,
            status: PullRequestStatus::Detected,
            ..Default::default()
        }
    }

    pub fn url(&self) -> String {
        format!("https://github.com/{}", self)
    }
}

impl fmt::Display for PullRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/pull/{}", self.org, self.repo, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_text_round_trip() {
        for priority in [
            PullRequestPriority::Urgent,
            PullRequestPriority::High,
            PullRequestPriority::Normal,
            PullRequestPriority::Low,
        ] {
            assert_eq!(PullRequestPriority::from_text(priority.to_text()), priority);
        }
        assert_eq!(
            PullRequestPriority::from_text("no-such-priority"),
            PullRequestPriority::Normal
        );
    }

    #[test]
    fn test_priority_i64_round_trip() {
        for priority in [
            PullRequestPriority::Urgent,
            PullRequestPriority::High,
            PullRequestPriority::Normal,
            PullRequestPriority::Low,
        ] {
            assert_eq!(PullRequestPriority::from_i64(priority.to_i64()), priority);
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PullRequestStatus::Detected,
            PullRequestStatus::Queued,
            PullRequestStatus::Cancelled,
            PullRequestStatus::Complete,
        ] {
            assert_eq!(PullRequestStatus::from_str(status.as_str()), status);
        }
        assert_eq!(
            PullRequestStatus::from_str("gibberish"),
            PullRequestStatus::Unknown
        );
    }

    #[test]
    fn test_display() {
        let pr = PullRequest::new("myorg", "my-repo", 42);
        assert_eq!(pr.to_string(), "myorg/my-repo/pull/42");
        assert_eq!(pr.url(), "https://github.com/myorg/my-repo/pull/42");
    }
}
