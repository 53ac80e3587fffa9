//! GitHub API interaction module
//!
//! [`ReleaseSource`] is the seam between the lifecycle engine and the network;
//! [`GitHubClient`] is the production implementation.

use crate::config::Config;
use crate::error::RemoteError;
use async_trait::async_trait;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;

/// Remote operations the lifecycle engine depends on.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Tag names of `owner/repo`, most recent first.
    async fn list_tags(&self, owner: &str, repo: &str) -> Result<Vec<String>, RemoteError>;

    /// The full body of `url`.
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct GitHubTag {
    name: String,
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    show_progress: bool,
}

impl GitHubClient {
    pub fn new(config: &Config) -> Self {
        let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        if token.is_some() {
            tracing::debug!("Using GITHUB_TOKEN");
        }
        Self {
            client: reqwest::Client::new(),
            api_url: config.github_api_url.trim_end_matches('/').to_string(),
            token,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header("User-Agent", concat!("relma/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {}", token));
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response, RemoteError> {
        let response = request.send().await.map_err(|e| transport(url, e))?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    fn progress_bar(&self, url: &str, total_size: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let filename = url.rsplit('/').next().unwrap_or(url).to_string();
        let pb = ProgressBar::new(total_size);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("Downloading {}", filename));
        pb
    }
}

pub fn build_tags_url(api_url: &str, owner: &str, repo: &str) -> String {
    format!(
        "{}/repos/{}/{}/tags?per_page=100",
        api_url.trim_end_matches('/'),
        owner,
        repo
    )
}

#[async_trait]
impl ReleaseSource for GitHubClient {
    async fn list_tags(&self, owner: &str, repo: &str) -> Result<Vec<String>, RemoteError> {
        let url = build_tags_url(&self.api_url, owner, repo);
        tracing::debug!("Fetching tags from: {}", url);

        let request = self
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json");
        let response = self.send(request, &url).await?;
        let tags: Vec<GitHubTag> = response.json().await.map_err(|e| transport(&url, e))?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        tracing::info!("Downloading {}...", url);

        let response = self.send(self.get(url), url).await?;
        let total_size = response.content_length().unwrap_or(0);
        let pb = self.progress_bar(url, total_size);

        let mut body = Vec::with_capacity(total_size as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport(url, e))?;
            body.extend_from_slice(&chunk);
            pb.set_position(body.len() as u64);
        }

        pb.finish_and_clear();
        tracing::debug!("Downloaded {} bytes from {}", body.len(), url);
        Ok(body)
    }
}

fn transport(url: &str, err: reqwest::Error) -> RemoteError {
    RemoteError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    }
}
