use async_trait::async_trait;
use octocrab::models::pulls::PullRequest;
use octocrab::models::IssueState;
use octocrab::params;
use octocrab::Octocrab;
use tracing::{debug, info};

use super::{ExistingPullRequest, GitOperationError, PullRequestHost, PullRequestSpec, PullRequestState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepoInfo {
    pub owner: String,
    pub repo: String,
}

/// Owner and repository from a GitHub remote URL, SSH or HTTPS.
pub fn parse_github_url(url: &str) -> Option<GitHubRepoInfo> {
    let (path, exact) = if let Some(path) = url.strip_prefix("git@github.com:") {
        (path, true)
    } else if let Some(path) = url.strip_prefix("https://github.com/") {
        (path, false)
    } else {
        return None;
    };
    let path = path.strip_suffix(".git").unwrap_or(path);
    let parts: Vec<&str> = path.split('/').collect();
    let valid = if exact { parts.len() == 2 } else { parts.len() >= 2 };
    if !valid || parts[0].is_empty() || parts[1].is_empty() {
        return None;
    }
    Some(GitHubRepoInfo {
        owner: parts[0].to_string(),
        repo: parts[1].to_string(),
    })
}

/// Rate limits, server errors and dropped connections are transient.
fn hosting_error(operation: &'static str, e: octocrab::Error) -> GitOperationError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    let retryable = ["rate limit", "secondary rate", "timed out", "timeout", "connection", "502", "503", "504", "500"]
        .iter()
        .any(|needle| lower.contains(needle));
    GitOperationError::Hosting {
        operation,
        message,
        retryable,
    }
}

fn existing_from(pr: &PullRequest) -> ExistingPullRequest {
    let state = if pr.merged_at.is_some() {
        PullRequestState::Merged
    } else if matches!(pr.state, Some(IssueState::Closed)) {
        PullRequestState::Closed
    } else {
        PullRequestState::Open
    };
    ExistingPullRequest {
        number: pr.number,
        url: pr.html_url.as_ref().map(|u| u.to_string()).unwrap_or_default(),
        head: pr.head.ref_field.clone(),
        state,
    }
}

/// Open or merged pull requests whose head starts with `head_prefix`, newest
/// first.
fn select_existing(
    candidates: impl IntoIterator<Item = ExistingPullRequest>,
    head_prefix: &str,
) -> Vec<ExistingPullRequest> {
    let mut live: Vec<_> = candidates
        .into_iter()
        .filter(|pr| pr.head.starts_with(head_prefix) && pr.state != PullRequestState::Closed)
        .collect();
    live.sort_by(|a, b| b.number.cmp(&a.number));
    live
}

/// [`PullRequestHost`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubPullRequests {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubPullRequests {
    pub fn new(token: &str, owner: impl Into<String>, repo: impl Into<String>) -> Result<Self, GitOperationError> {
        let octocrab = Octocrab::builder()
            .personal_token(token.to_string())
            .build()
            .map_err(|e| hosting_error("build client", e))?;
        Ok(Self::with_client(octocrab, owner, repo))
    }

    pub fn with_client(octocrab: Octocrab, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            octocrab,
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    async fn open_for_head(&self, head: &str) -> Result<Option<ExistingPullRequest>, GitOperationError> {
        let page = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .list()
            .state(params::State::Open)
            .head(format!("{}:{head}", self.owner))
            .per_page(10)
            .send()
            .await
            .map_err(|e| hosting_error("list pull requests", e))?;
        Ok(page
            .items
            .iter()
            .map(existing_from)
            .find(|pr| pr.head == head))
    }
}

#[async_trait]
impl PullRequestHost for GitHubPullRequests {
    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<String, GitOperationError> {
        // a retried create after a lost response must not open a duplicate
        if let Some(existing) = self.open_for_head(&spec.head).await? {
            debug!(number = existing.number, head = %spec.head, "Pull request already open");
            return Ok(existing.url);
        }

        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(&spec.title, &spec.head, &spec.base)
            .body(&spec.body)
            .send()
            .await
            .map_err(|e| hosting_error("create pull request", e))?;

        if !spec.labels.is_empty() {
            self.octocrab
                .issues(&self.owner, &self.repo)
                .add_labels(pr.number, &spec.labels)
                .await
                .map_err(|e| hosting_error("add labels", e))?;
        }

        let url = pr.html_url.as_ref().map(|u| u.to_string()).unwrap_or_default();
        info!(number = pr.number, url = %url, head = %spec.head, "Opened pull request");
        Ok(url)
    }

    async fn find_pull_requests(
        &self,
        head_prefix: &str,
    ) -> Result<Vec<ExistingPullRequest>, GitOperationError> {
        let page = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .list()
            .state(params::State::All)
            .per_page(100)
            .send()
            .await
            .map_err(|e| hosting_error("list pull requests", e))?;
        Ok(select_existing(page.items.iter().map(existing_from), head_prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_url_ssh_format() {
        let info = parse_github_url("git@github.com:owner/repo.git").unwrap();
        assert_eq!(info.owner, "owner");
        assert_eq!(info.repo, "repo");
        assert_eq!(parse_github_url("git@github.com:owner/repo").unwrap().repo, "repo");
        assert!(parse_github_url("git@github.com:owner").is_none());
    }

    #[test]
    fn test_parse_github_url_https_format() {
        let info = parse_github_url("https://github.com/my-org/my.repo.name.git").unwrap();
        assert_eq!(info.owner, "my-org");
        assert_eq!(info.repo, "my.repo.name");
        assert_eq!(
            parse_github_url("https://github.com/owner/repo/extra/path").unwrap().repo,
            "repo"
        );
    }

    #[test]
    fn test_parse_github_url_rejects_other_hosts() {
        assert!(parse_github_url("https://gitlab.com/owner/repo.git").is_none());
        assert!(parse_github_url("git@gitlab.com:owner/repo.git").is_none());
        assert!(parse_github_url("").is_none());
        assert!(parse_github_url("not-a-url").is_none());
    }

    fn pr(number: u64, head: &str, state: PullRequestState) -> ExistingPullRequest {
        ExistingPullRequest {
            number,
            url: format!("https://github.com/o/r/pull/{number}"),
            head: head.into(),
            state,
        }
    }

    #[test]
    fn test_select_existing_orders_live_prs_newest_first() {
        let candidates = vec![
            pr(1, "feature/add-fg-calc-1-aaaa", PullRequestState::Merged),
            pr(2, "feature/add-fg-calc-2-bbbb", PullRequestState::Open),
            pr(3, "feature/add-fg-calc-3-cccc", PullRequestState::Closed),
            pr(4, "feature/other-4-dddd", PullRequestState::Open),
        ];
        let found = select_existing(candidates, "feature/add-fg-calc-");
        let numbers: Vec<u64> = found.iter().map(|pr| pr.number).collect();
        assert_eq!(numbers, vec![2, 1]);
    }

    #[test]
    fn test_select_existing_ignores_closed() {
        let candidates = vec![pr(3, "feature/add-fg-calc-3-cccc", PullRequestState::Closed)];
        assert!(select_existing(candidates, "feature/add-fg-calc-").is_empty());
    }
}
