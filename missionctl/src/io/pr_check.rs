//! Ground-truth deliverable check: does an open change request exist?
//!
//! Both checks fail open (report found) when no credential is configured or
//! the query errors, so a verification outage never wedges a pipeline.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{error, warn};

use crate::io::github::SystemOfRecord;

static REPO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Repository:\s*(\S+)").expect("repository regex is valid")
});

/// Outcome of a ground-truth lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrLookup {
    pub found: bool,
    pub url: Option<String>,
}

impl PrLookup {
    fn fail_open() -> Self {
        Self {
            found: true,
            url: None,
        }
    }

    fn missing() -> Self {
        Self {
            found: false,
            url: None,
        }
    }
}

/// Open change request in `repo` whose source branch starts with `head_prefix`.
pub async fn has_open_pr(sor: &dyn SystemOfRecord, repo: &str, head_prefix: &str) -> PrLookup {
    find_open_pr(sor, repo, |branch| {
        !head_prefix.is_empty() && branch.starts_with(head_prefix)
    })
    .await
}

/// Open change request in `repo` whose source branch mentions `short_id`.
pub async fn has_open_pr_for_task(
    sor: &dyn SystemOfRecord,
    repo: &str,
    short_id: &str,
) -> PrLookup {
    if short_id.is_empty() {
        return PrLookup::missing();
    }
    find_open_pr(sor, repo, |branch| branch.contains(short_id)).await
}

async fn find_open_pr(
    sor: &dyn SystemOfRecord,
    repo: &str,
    matches: impl Fn(&str) -> bool,
) -> PrLookup {
    if !sor.has_credential() {
        warn!(repo, "no system-of-record credential, skipping change request check");
        return PrLookup::fail_open();
    }
    match sor.list_open_change_requests(repo).await {
        Ok(requests) => requests
            .into_iter()
            .find(|cr| matches(&cr.source_branch))
            .map(|cr| PrLookup {
                found: true,
                url: cr.url,
            })
            .unwrap_or_else(PrLookup::missing),
        Err(err) => {
            let detail = format!("{err:#}");
            error!(repo, error = %detail, "change request check failed, allowing transition");
            PrLookup::fail_open()
        }
    }
}

/// `owner/repo` named by a `Repository: owner/repo` line in a description.
pub fn extract_target_repo(description: &str) -> Option<String> {
    REPO_RE
        .captures(description)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Split `owner/repo` into its two halves.
pub fn split_repo(repo: &str) -> Option<(&str, &str)> {
    let (owner, name) = repo.split_once('/')?;
    if owner.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((owner, name))
}
