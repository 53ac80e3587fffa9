use crate::error::{RelmaError, Result};
use crate::github::ReleaseSource;
use crate::types::{Release, ResolvedRelease};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// What the user asked for: a release asset URL, or just `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRef {
    pub owner: String,
    pub repo: String,
    pub version: Option<String>,
    pub asset_file_name: Option<String>,
    /// `scheme://host` of an asset URL, kept so the URL can be rebuilt exactly.
    base_url: Option<String>,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid owner/repo pattern"))
}

fn check_name(input: &str, kind: &str, value: &str) -> Result<()> {
    if value == "." || value == ".." || !name_pattern().is_match(value) {
        return Err(RelmaError::malformed(
            input,
            format!("invalid {} name '{}'", kind, value),
        ));
    }
    Ok(())
}

impl ReleaseRef {
    /// Parse either form:
    /// - "https://github.com/owner/repo/releases/download/v1.2.3/asset.tar.gz"
    /// - "owner/repo"
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.contains("://") {
            Self::from_url(input)
        } else {
            Self::from_identity(input)
        }
    }

    pub fn from_identity(input: &str) -> Result<Self> {
        let (owner, repo) = parse_identity(input)?;
        Ok(Self {
            owner,
            repo,
            version: None,
            asset_file_name: None,
            base_url: None,
        })
    }

    pub fn from_url(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| RelmaError::malformed(input, "missing URL scheme"))?;
        if scheme != "https" && scheme != "http" {
            return Err(RelmaError::malformed(
                input,
                format!("unsupported URL scheme '{}'", scheme),
            ));
        }

        let segments: Vec<&str> = rest.split('/').collect();
        let (host, path) = match segments.split_first() {
            Some((host, path)) if !host.is_empty() => (*host, path),
            _ => return Err(RelmaError::malformed(input, "missing host")),
        };

        // <owner>/<repo>/releases/download/<tag>/<asset>
        let [owner, repo, releases, download, tag, asset] = path else {
            return Err(RelmaError::malformed(
                input,
                "expected <owner>/<repo>/releases/download/<tag>/<asset>",
            ));
        };
        if *releases != "releases" || *download != "download" {
            return Err(RelmaError::malformed(
                input,
                "expected <owner>/<repo>/releases/download/<tag>/<asset>",
            ));
        }
        if tag.is_empty() || asset.is_empty() {
            return Err(RelmaError::malformed(input, "empty tag or asset name"));
        }
        check_name(input, "owner", owner)?;
        check_name(input, "repository", repo)?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            version: Some(tag.to_string()),
            asset_file_name: Some(asset.to_string()),
            base_url: Some(format!("{}://{}", scheme, host)),
        })
    }

    /// The asset URL, when this reference names a tag and an asset.
    pub fn download_url(&self) -> Option<String> {
        let version = self.version.as_deref()?;
        let asset = self.asset_file_name.as_deref()?;
        let base = self.base_url.as_deref().unwrap_or("https://github.com");
        Some(build_download_url(
            base,
            &self.owner,
            &self.repo,
            version,
            asset,
        ))
    }

    pub fn identity(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for ReleaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.download_url() {
            Some(url) => write!(f, "{}", url),
            None => write!(f, "{}", self.identity()),
        }
    }
}

/// Split "owner/repo".
pub fn parse_identity(input: &str) -> Result<(String, String)> {
    let mut parts = input.trim().split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) => {
            check_name(input, "owner", owner)?;
            check_name(input, "repository", repo)?;
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(RelmaError::malformed(input, "expected <owner>/<repo>")),
    }
}

pub fn build_download_url(base: &str, owner: &str, repo: &str, tag: &str, asset: &str) -> String {
    format!(
        "{}/{}/{}/releases/download/{}/{}",
        base.trim_end_matches('/'),
        owner,
        repo,
        tag,
        asset
    )
}

/// Latest tag of `owner/repo`. The remote listing order is authoritative; the
/// first tag wins even when it does not look like the highest version.
pub async fn fetch_latest_tag(source: &dyn ReleaseSource, owner: &str, repo: &str) -> Result<String> {
    let tags = source
        .list_tags(owner, repo)
        .await
        .map_err(|e| RelmaError::NotFound {
            owner: owner.to_string(),
            repo: repo.to_string(),
            reason: match e.status() {
                Some(404) => "repository not found".to_string(),
                _ => "tag lookup failed".to_string(),
            },
            source: Some(e),
        })?;

    let latest = tags.into_iter().next().ok_or_else(|| RelmaError::NotFound {
        owner: owner.to_string(),
        repo: repo.to_string(),
        reason: "repository has no tags".to_string(),
        source: None,
    })?;

    tracing::debug!("Latest tag for {}/{}: {}", owner, repo, latest);
    Ok(latest)
}

/// Resolve `reference` to a downloadable asset.
///
/// URL references are already complete and need no network access. Bare
/// `owner/repo` references take the latest tag and derive the asset name
/// from the tracked entry, so they only work for releases already installed.
pub async fn resolve(
    source: &dyn ReleaseSource,
    reference: &ReleaseRef,
    tracked: Option<&Release>,
) -> Result<ResolvedRelease> {
    if let (Some(version), Some(asset), Some(url)) = (
        reference.version.as_ref(),
        reference.asset_file_name.as_ref(),
        reference.download_url(),
    ) {
        return Ok(ResolvedRelease {
            owner: reference.owner.clone(),
            repo: reference.repo.clone(),
            version: version.clone(),
            asset_file_name: asset.clone(),
            url,
        });
    }

    let tracked = tracked.ok_or_else(|| {
        RelmaError::malformed(
            &reference.identity(),
            "not installed yet; install it from a release asset URL first",
        )
    })?;

    let latest = fetch_latest_tag(source, &reference.owner, &reference.repo).await?;
    Ok(resolve_from_tracked(tracked, &latest))
}

/// Point a tracked release at `tag`, carrying its asset naming over.
pub fn resolve_from_tracked(tracked: &Release, tag: &str) -> ResolvedRelease {
    warn_if_semver_older(tracked, tag);

    let asset_file_name = rewrite_asset_name(&tracked.asset_file_name, &tracked.version, tag);
    let url = match ReleaseRef::from_url(&tracked.url) {
        Ok(parsed) => build_download_url(
            parsed.base_url.as_deref().unwrap_or("https://github.com"),
            &tracked.owner,
            &tracked.repo,
            tag,
            &asset_file_name,
        ),
        Err(_) => build_download_url(
            "https://github.com",
            &tracked.owner,
            &tracked.repo,
            tag,
            &asset_file_name,
        ),
    };

    ResolvedRelease {
        owner: tracked.owner.clone(),
        repo: tracked.repo.clone(),
        version: tag.to_string(),
        asset_file_name,
        url,
    }
}

/// Carry the version embedded in an asset name from `old_tag` to `new_tag`.
///
/// "tool_1.2.0_linux.tar.gz" moves to "tool_1.3.0_linux.tar.gz" for tags
/// v1.2.0 -> v1.3.0. A version only matches as a whole token, delimited by
/// the ends of the name or by characters other than ASCII letters and
/// digits, so tag v4 leaves "tool_arm64" alone. Names without a version are
/// left alone.
pub fn rewrite_asset_name(asset: &str, old_tag: &str, new_tag: &str) -> String {
    if old_tag.is_empty() || old_tag == new_tag {
        return asset.to_string();
    }
    if let Some(renamed) = replace_token(asset, old_tag, new_tag) {
        return renamed;
    }
    let old_bare = old_tag.trim_start_matches('v');
    let new_bare = new_tag.trim_start_matches('v');
    if old_bare.is_empty() || old_bare == old_tag {
        return asset.to_string();
    }
    replace_token(asset, old_bare, new_bare).unwrap_or_else(|| asset.to_string())
}

/// Replace whole-token occurrences of `old` in `name`, or `None` if there are none.
fn replace_token(name: &str, old: &str, new: &str) -> Option<String> {
    let pattern = format!(r"(^|[^A-Za-z0-9]){}($|[^A-Za-z0-9])", regex::escape(old));
    let token = Regex::new(&pattern).ok()?;
    if !token.is_match(name) {
        return None;
    }
    let renamed = token.replace_all(name, |caps: &regex::Captures| {
        format!("{}{}{}", &caps[1], new, &caps[2])
    });
    Some(renamed.into_owned())
}

fn warn_if_semver_older(tracked: &Release, latest: &str) {
    let parse = |v: &str| semver::Version::parse(v.trim_start_matches('v')).ok();
    if let (Some(current), Some(candidate)) = (parse(&tracked.version), parse(latest)) {
        if candidate < current {
            tracing::warn!(
                "Latest listed tag {} of {} sorts below the installed {}; using listing order",
                latest,
                tracked.identity(),
                tracked.version
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use async_trait::async_trait;

    struct Tags(std::result::Result<Vec<&'static str>, u16>);

    #[async_trait]
    impl ReleaseSource for Tags {
        async fn list_tags(
            &self,
            owner: &str,
            repo: &str,
        ) -> std::result::Result<Vec<String>, RemoteError> {
            match &self.0 {
                Ok(tags) => Ok(tags.iter().map(|t| t.to_string()).collect()),
                Err(status) => Err(RemoteError::Status {
                    url: format!("https://api.github.com/repos/{}/{}/tags", owner, repo),
                    status: *status,
                }),
            }
        }

        async fn fetch_bytes(&self, url: &str) -> std::result::Result<Vec<u8>, RemoteError> {
            Err(RemoteError::Transport {
                url: url.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    fn tracked(version: &str, asset: &str) -> Release {
        Release {
            owner: "acme".to_string(),
            repo: "tool".to_string(),
            version: version.to_string(),
            url: build_download_url("https://github.com", "acme", "tool", version, asset),
            asset_file_name: asset.to_string(),
            installed_files: vec![],
            latest_version: None,
            installed_at: None,
        }
    }

    #[test]
    fn test_parse_release_url() {
        let url = "https://github.com/jiro4989/nimjson/releases/download/v1.2.6/nimjson_linux.tar.gz";
        let reference = ReleaseRef::parse(url).unwrap();
        assert_eq!(reference.owner, "jiro4989");
        assert_eq!(reference.repo, "nimjson");
        assert_eq!(reference.version.as_deref(), Some("v1.2.6"));
        assert_eq!(reference.asset_file_name.as_deref(), Some("nimjson_linux.tar.gz"));
        assert_eq!(reference.download_url().as_deref(), Some(url));
        assert_eq!(reference.to_string(), url);
    }

    #[test]
    fn test_url_roundtrip_keeps_host() {
        for url in [
            "https://github.com/acme/tool/releases/download/v1.0.0/tool_linux.tar.gz",
            "http://ghe.internal/team/cli.rs/releases/download/2024-01-01/cli",
            "https://github.com/a_b/c-d/releases/download/nightly/c-d_x86_64.zip",
        ] {
            let reference = ReleaseRef::parse(url).unwrap();
            assert_eq!(reference.download_url().as_deref(), Some(url));
        }
    }

    #[test]
    fn test_malformed_urls() {
        for url in [
            "https://github.com/acme/tool",
            "https://github.com/acme/tool/releases/tag/v1.0.0",
            "https://github.com/acme/tool/releases/download/v1.0.0",
            "https://github.com/acme/tool/releases/download/v1.0.0/",
            "https://github.com/acme/tool/archive/download/v1.0.0/tool.tar.gz",
            "https://github.com/acme/tool/releases/download/v1.0.0/extra/tool.tar.gz",
            "ftp://github.com/acme/tool/releases/download/v1.0.0/tool",
            "https:///acme/tool/releases/download/v1.0.0/tool",
        ] {
            assert!(
                matches!(
                    ReleaseRef::parse(url),
                    Err(RelmaError::MalformedReference { .. })
                ),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_parse_identity() {
        let reference = ReleaseRef::parse("jiro4989/nimjson").unwrap();
        assert_eq!(reference.identity(), "jiro4989/nimjson");
        assert!(reference.version.is_none());
        assert!(reference.download_url().is_none());
        assert_eq!(reference.to_string(), "jiro4989/nimjson");

        for bad in ["", "nimjson", "a/b/c", "/repo", "owner/", "own er/repo", "../x"] {
            assert!(parse_identity(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_rewrite_asset_name() {
        assert_eq!(
            rewrite_asset_name("tool_1.2.0_linux.tar.gz", "v1.2.0", "v1.3.0"),
            "tool_1.3.0_linux.tar.gz"
        );
        assert_eq!(
            rewrite_asset_name("tool-v1.2.0-linux.zip", "v1.2.0", "v1.3.0"),
            "tool-v1.3.0-linux.zip"
        );
        assert_eq!(
            rewrite_asset_name("nimjson_linux.tar.gz", "v1.2.6", "v1.2.7"),
            "nimjson_linux.tar.gz"
        );
        assert_eq!(rewrite_asset_name("tool", "", "v2"), "tool");
        assert_eq!(rewrite_asset_name("tool-1.2.0.tar.gz", "1.2.0", "1.3.0"), "tool-1.3.0.tar.gz");
    }

    #[test]
    fn test_rewrite_asset_name_matches_whole_versions() {
        assert_eq!(
            rewrite_asset_name("tool_linux_arm64.tar.gz", "v4", "v5"),
            "tool_linux_arm64.tar.gz"
        );
        assert_eq!(
            rewrite_asset_name("tool-x86_64-unknown-linux-musl.tar.gz", "v6", "v7"),
            "tool-x86_64-unknown-linux-musl.tar.gz"
        );
        assert_eq!(rewrite_asset_name("tool_amd64", "v8", "v9"), "tool_amd64");
        assert_eq!(
            rewrite_asset_name("tool_4_linux_amd64.tar.gz", "v4", "v5"),
            "tool_5_linux_amd64.tar.gz"
        );
        assert_eq!(
            rewrite_asset_name("tool-v4-arm64.zip", "v4", "v5"),
            "tool-v5-arm64.zip"
        );
        assert_eq!(rewrite_asset_name("tool_11.2.0", "v1.2.0", "v1.3.0"), "tool_11.2.0");
    }

    #[tokio::test]
    async fn test_latest_tag_uses_listing_order() {
        let source = Tags(Ok(vec!["v1.2.7", "v10.0.0", "v1.2.6"]));
        let latest = fetch_latest_tag(&source, "jiro4989", "nimjson").await.unwrap();
        assert_eq!(latest, "v1.2.7");
    }

    #[tokio::test]
    async fn test_latest_tag_errors_surface_as_not_found() {
        let empty = Tags(Ok(vec![]));
        assert!(matches!(
            fetch_latest_tag(&empty, "acme", "tool").await,
            Err(RelmaError::NotFound { source: None, .. })
        ));

        let limited = Tags(Err(403));
        assert!(matches!(
            fetch_latest_tag(&limited, "acme", "tool").await,
            Err(RelmaError::NotFound { source: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_url_needs_no_network() {
        let source = Tags(Err(500));
        let reference =
            ReleaseRef::parse("https://github.com/acme/tool/releases/download/v1.0.0/tool_linux.tar.gz")
                .unwrap();
        let resolved = resolve(&source, &reference, None).await.unwrap();
        assert_eq!(resolved.version, "v1.0.0");
        assert_eq!(resolved.asset_file_name, "tool_linux.tar.gz");
    }

    #[tokio::test]
    async fn test_resolve_identity() {
        let source = Tags(Ok(vec!["v1.3.0", "v1.2.0"]));
        let reference = ReleaseRef::parse("acme/tool").unwrap();

        assert!(matches!(
            resolve(&source, &reference, None).await,
            Err(RelmaError::MalformedReference { .. })
        ));

        let current = tracked("v1.2.0", "tool_1.2.0_linux.tar.gz");
        let resolved = resolve(&source, &reference, Some(&current)).await.unwrap();
        assert_eq!(resolved.version, "v1.3.0");
        assert_eq!(resolved.asset_file_name, "tool_1.3.0_linux.tar.gz");
        assert_eq!(
            resolved.url,
            "https://github.com/acme/tool/releases/download/v1.3.0/tool_1.3.0_linux.tar.gz"
        );
    }
}
