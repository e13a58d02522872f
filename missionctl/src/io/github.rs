//! System-of-record client (GitHub REST API).
//!
//! The [`SystemOfRecord`] trait is the seam used by guards, actions and the
//! worker's scoped tools; [`GitHubClient`] is the production implementation.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Open change request (pull request) in a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    pub number: u64,
    pub source_branch: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    /// Whether a credential is configured. Ground-truth checks fail open
    /// without one.
    fn has_credential(&self) -> bool;

    async fn list_open_change_requests(&self, repo: &str) -> Result<Vec<ChangeRequest>>;

    /// Open a change request; `Ok(None)` when the system rejects it.
    async fn create_change_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
    ) -> Result<Option<String>>;

    /// Number of files changed by an open change request.
    async fn changed_files(&self, repo: &str, number: u64) -> Result<u64>;

    async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool>;

    /// Create `branch` from the tip of `base`; `false` when `base` is missing.
    async fn create_branch(&self, repo: &str, branch: &str, base: &str) -> Result<bool>;

    async fn read_file(&self, repo: &str, path: &str, git_ref: &str) -> Result<Option<String>>;

    /// Create or update a file on `branch`.
    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
    ) -> Result<bool>;

    /// File names directly inside `path`; empty when the folder is missing.
    async fn list_directory(&self, repo: &str, path: &str) -> Result<Vec<String>>;

    async fn latest_commit_message(&self, repo: &str, path: &str) -> Result<Option<String>>;

    async fn create_repository(&self, owner: &str, name: &str) -> Result<bool>;
}

#[derive(Deserialize)]
struct PullHead {
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Deserialize)]
struct Pull {
    number: u64,
    html_url: Option<String>,
    head: PullHead,
    #[serde(default)]
    changed_files: u64,
}

#[derive(Deserialize)]
struct ContentFile {
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct DirEntry {
    name: String,
}

#[derive(Deserialize)]
struct CommitDetail {
    message: String,
}

#[derive(Deserialize)]
struct CommitEntry {
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitRef {
    object: RefObject,
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("missionctl/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => builder.header("Authorization", format!("token {token}")),
            None => builder,
        }
    }

    async fn content_file(&self, repo: &str, path: &str, git_ref: &str) -> Result<Option<ContentFile>> {
        let resp = self
            .request(Method::GET, &format!("repos/{repo}/contents/{path}"))
            .query(&[("ref", git_ref)])
            .send()
            .await
            .with_context(|| format!("get {repo}/{path}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let file = resp
            .error_for_status()
            .with_context(|| format!("get {repo}/{path}"))?
            .json::<ContentFile>()
            .await
            .context("decode content response")?;
        Ok(Some(file))
    }
}

#[async_trait]
impl SystemOfRecord for GitHubClient {
    fn has_credential(&self) -> bool {
        self.token.is_some()
    }

    #[instrument(skip(self))]
    async fn list_open_change_requests(&self, repo: &str) -> Result<Vec<ChangeRequest>> {
        let pulls = self
            .request(Method::GET, &format!("repos/{repo}/pulls"))
            .query(&[("state", "open"), ("per_page", "100")])
            .send()
            .await
            .with_context(|| format!("list pulls for {repo}"))?
            .error_for_status()
            .with_context(|| format!("list pulls for {repo}"))?
            .json::<Vec<Pull>>()
            .await
            .context("decode pulls response")?;
        debug!(count = pulls.len(), "listed open pulls");
        Ok(pulls
            .into_iter()
            .map(|p| ChangeRequest {
                number: p.number,
                source_branch: p.head.git_ref,
                url: p.html_url,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn create_change_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .request(Method::POST, &format!("repos/{repo}/pulls"))
            .json(&json!({
                "title": title,
                "head": head,
                "base": base,
                "body": format!("Automated change request for `{head}`."),
            }))
            .send()
            .await
            .with_context(|| format!("create pull for {repo}"))?;
        if resp.status() != StatusCode::CREATED {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            warn!(%status, body = %preview, "pull creation rejected");
            return Ok(None);
        }
        let pull = resp.json::<Pull>().await.context("decode created pull")?;
        Ok(Some(pull.html_url.unwrap_or_default()))
    }

    async fn changed_files(&self, repo: &str, number: u64) -> Result<u64> {
        let pull = self
            .request(Method::GET, &format!("repos/{repo}/pulls/{number}"))
            .send()
            .await
            .with_context(|| format!("get pull {repo}#{number}"))?
            .error_for_status()
            .with_context(|| format!("get pull {repo}#{number}"))?
            .json::<Pull>()
            .await
            .context("decode pull response")?;
        Ok(pull.changed_files)
    }

    async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool> {
        let resp = self
            .request(Method::GET, &format!("repos/{repo}/branches/{branch}"))
            .send()
            .await
            .with_context(|| format!("get branch {repo}:{branch}"))?;
        Ok(resp.status().is_success())
    }

    #[instrument(skip(self))]
    async fn create_branch(&self, repo: &str, branch: &str, base: &str) -> Result<bool> {
        let resp = self
            .request(Method::GET, &format!("repos/{repo}/git/ref/heads/{base}"))
            .send()
            .await
            .with_context(|| format!("get ref {repo}:{base}"))?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let base_ref = resp.json::<GitRef>().await.context("decode ref response")?;
        let created = self
            .request(Method::POST, &format!("repos/{repo}/git/refs"))
            .json(&json!({"ref": format!("refs/heads/{branch}"), "sha": base_ref.object.sha}))
            .send()
            .await
            .with_context(|| format!("create ref {repo}:{branch}"))?;
        Ok(created.status() == StatusCode::CREATED)
    }

    async fn read_file(&self, repo: &str, path: &str, git_ref: &str) -> Result<Option<String>> {
        let Some(file) = self.content_file(repo, path, git_ref).await? else {
            return Ok(None);
        };
        let encoded: String = file
            .content
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(encoded)
            .with_context(|| format!("decode {repo}/{path}"))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    #[instrument(skip(self, content))]
    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
    ) -> Result<bool> {
        let sha = self
            .content_file(repo, path, branch)
            .await?
            .and_then(|f| f.sha);
        let mut body = json!({
            "message": message,
            "content": STANDARD.encode(content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }
        let resp = self
            .request(Method::PUT, &format!("repos/{repo}/contents/{path}"))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("put {repo}/{path}"))?;
        let ok = matches!(resp.status(), StatusCode::OK | StatusCode::CREATED);
        if !ok {
            warn!(status = %resp.status(), "file commit rejected");
        }
        Ok(ok)
    }

    async fn list_directory(&self, repo: &str, path: &str) -> Result<Vec<String>> {
        let resp = self
            .request(Method::GET, &format!("repos/{repo}/contents/{path}"))
            .send()
            .await
            .with_context(|| format!("list {repo}/{path}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let value = resp
            .error_for_status()
            .with_context(|| format!("list {repo}/{path}"))?
            .json::<serde_json::Value>()
            .await
            .context("decode directory listing")?;
        // A file path returns an object, not a listing.
        if !value.is_array() {
            return Ok(Vec::new());
        }
        let entries: Vec<DirEntry> =
            serde_json::from_value(value).context("decode directory entries")?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn latest_commit_message(&self, repo: &str, path: &str) -> Result<Option<String>> {
        let commits = self
            .request(Method::GET, &format!("repos/{repo}/commits"))
            .query(&[("path", path), ("per_page", "1")])
            .send()
            .await
            .with_context(|| format!("list commits for {repo}/{path}"))?
            .error_for_status()
            .with_context(|| format!("list commits for {repo}/{path}"))?
            .json::<Vec<CommitEntry>>()
            .await
            .context("decode commits response")?;
        Ok(commits.into_iter().next().map(|c| c.commit.message))
    }

    #[instrument(skip(self))]
    async fn create_repository(&self, owner: &str, name: &str) -> Result<bool> {
        let body = json!({"name": name, "private": true});
        let resp = self
            .request(Method::POST, &format!("orgs/{owner}/repos"))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("create repo {owner}/{name}"))?;
        if resp.status() == StatusCode::CREATED {
            return Ok(true);
        }
        if resp.status() != StatusCode::NOT_FOUND {
            return Err(anyhow!("create repo {owner}/{name}: {}", resp.status()));
        }
        // Not an organization: create under the authenticated user.
        let resp = self
            .request(Method::POST, "user/repos")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("create repo {owner}/{name}"))?;
        Ok(resp.status() == StatusCode::CREATED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_follows_token() {
        let anonymous = GitHubClient::new("https://api.github.com/", None).expect("client");
        assert!(!anonymous.has_credential());
        assert_eq!(anonymous.api_base, "https://api.github.com");
        let authed =
            GitHubClient::new("https://api.github.com", Some("t".to_string())).expect("client");
        assert!(authed.has_credential());
    }

    #[test]
    fn pull_decodes_head_ref() {
        let pull: Pull = serde_json::from_str(
            r#"{"number": 7, "html_url": "https://github.com/a/b/pull/7", "head": {"ref": "dev/ab12cd34"}}"#,
        )
        .expect("decode");
        assert_eq!(pull.head.git_ref, "dev/ab12cd34");
        assert_eq!(pull.changed_files, 0);
    }
}
