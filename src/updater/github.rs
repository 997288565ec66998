use serde::Deserialize;

use crate::http_client;

use super::{RepositoryId, UpdateError};

/// Media type requested from the release API.
const RELEASE_MEDIA_TYPE: &str = "application/vnd.github+json";
/// Release documents are small; anything bigger is not a release feed.
const MAX_FEED_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ReleaseAsset {
    pub(super) name: String,
    pub(super) browser_download_url: String,
    #[serde(default)]
    pub(super) size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct Release {
    pub(super) tag_name: String,
    #[serde(default)]
    pub(super) body: Option<String>,
    pub(super) assets: Vec<ReleaseAsset>,
}

impl Release {
    /// Tag with one leading `v`/`V` removed.
    pub(super) fn version_name(&self) -> &str {
        version_from_tag(&self.tag_name)
    }

    pub(super) fn notes(&self) -> String {
        self.body.as_deref().unwrap_or_default().trim().to_string()
    }

    /// First asset whose name ends with `suffix`.
    pub(super) fn find_artifact(&self, suffix: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name.ends_with(suffix))
    }
}

pub(super) fn version_from_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix(['v', 'V']).unwrap_or(tag)
}

pub(super) fn latest_release_url(api_base: &str, repo: &RepositoryId) -> String {
    format!(
        "{}/repos/{}/{}/releases/latest",
        api_base.trim_end_matches('/'),
        repo.owner(),
        repo.name()
    )
}

pub(super) fn fetch_latest_release(
    agent: &ureq::Agent,
    api_base: &str,
    repo: &RepositoryId,
    user_agent: &str,
) -> Result<Release, UpdateError> {
    let url = latest_release_url(api_base, repo);
    tracing::debug!("Fetching release feed {url}");
    let response = agent
        .get(&url)
        .set("User-Agent", user_agent)
        .set("Accept", RELEASE_MEDIA_TYPE)
        .call()?;
    let status = response.status();
    tracing::debug!("Release feed responded with {status}");
    if !(200..300).contains(&status) {
        return Err(UpdateError::Status { status, url });
    }
    let bytes = http_client::read_response_bytes(response, MAX_FEED_BYTES)?;
    parse_release(&bytes)
}

pub(super) fn parse_release(bytes: &[u8]) -> Result<Release, UpdateError> {
    let release: Release = serde_json::from_slice(bytes)?;
    if version_from_tag(&release.tag_name).is_empty() {
        return Err(UpdateError::Invalid("release tag_name is empty".into()));
    }
    Ok(release)
}
