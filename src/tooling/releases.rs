// Release listing lookup: picks the download URL and tag of the newest matching build.
use super::*;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    #[serde(rename = "tag_name", default)]
    pub tag: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// `/releases` returns an array, `/releases/latest` a single object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReleaseListing {
    Many(Vec<Release>),
    One(Release),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetMatcher {
    Exact(String),
    Contains {
        needle: String,
        suffix: Option<String>,
    },
}

impl AssetMatcher {
    pub fn exact(name: impl Into<String>) -> Self {
        Self::Exact(name.into())
    }

    pub fn contains(needle: impl Into<String>, suffix: Option<&str>) -> Self {
        Self::Contains {
            needle: needle.into(),
            suffix: suffix.map(str::to_string),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(expected) => name == expected,
            Self::Contains { needle, suffix } => {
                name.contains(needle.as_str())
                    && suffix.as_deref().map_or(true, |suffix| name.ends_with(suffix))
            }
        }
    }
}

/// Where a release publishes the SHA-256 of its assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumSource {
    None,
    /// One `<hash>  <file>` manifest for the whole release.
    Manifest(String),
    /// A file named `<asset><suffix>` holding the hash of that asset alone.
    Sidecar(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseQuery {
    pub listing_url: String,
    pub tag_prefix: String,
    pub asset: AssetMatcher,
    pub checksum: ChecksumSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub tag: String,
    pub asset: Asset,
    pub checksum_asset: Option<Asset>,
}

impl ResolvedRelease {
    pub fn download_url(&self) -> &str {
        &self.asset.download_url
    }
}

/// Scans releases in listing order. The first release whose tag starts with `tag_prefix`
/// is the only one considered, even when none of its assets match.
pub fn select_release<'a>(
    releases: &'a [Release],
    tag_prefix: &str,
    matcher: &AssetMatcher,
) -> Option<(&'a Release, &'a Asset)> {
    let release = releases
        .iter()
        .find(|release| release.tag.starts_with(tag_prefix))?;
    let asset = release
        .assets
        .iter()
        .find(|asset| matcher.matches(&asset.name))?;
    Some((release, asset))
}

fn checksum_asset_for(release: &Release, asset: &Asset, source: &ChecksumSource) -> Option<Asset> {
    let wanted = match source {
        ChecksumSource::None => return None,
        ChecksumSource::Manifest(name) => name.clone(),
        ChecksumSource::Sidecar(suffix) => format!("{}{suffix}", asset.name),
    };
    release
        .assets
        .iter()
        .find(|candidate| candidate.name == wanted)
        .cloned()
}

pub fn parse_release_listing(url: &str, payload: &str) -> Result<Vec<Release>, ResolutionError> {
    let listing: ReleaseListing =
        serde_json::from_str(payload).map_err(|error| ResolutionError::Parse {
            url: url.to_string(),
            message: error.to_string(),
        })?;
    Ok(match listing {
        ReleaseListing::Many(releases) => releases,
        ReleaseListing::One(release) => vec![release],
    })
}

pub trait ReleaseSource: Send + Sync {
    /// `Ok(None)` means nothing matched; it is not a failure.
    fn resolve(&self, query: &ReleaseQuery) -> Result<Option<ResolvedRelease>, ResolutionError>;
}

/// Resolves releases from a GitHub-style release listing API.
pub struct GithubReleases {
    fetcher: Arc<dyn ArtifactSource>,
}

impl GithubReleases {
    pub fn new(fetcher: Arc<dyn ArtifactSource>) -> Self {
        Self { fetcher }
    }

    /// Returns `(download_url, tag)` of the first matching asset, if any.
    pub fn resolve_latest(
        &self,
        listing_url: &str,
        tag_prefix: &str,
        matcher: &AssetMatcher,
    ) -> Result<Option<(String, String)>, ResolutionError> {
        let query = ReleaseQuery {
            listing_url: listing_url.to_string(),
            tag_prefix: tag_prefix.to_string(),
            asset: matcher.clone(),
            checksum: ChecksumSource::None,
        };
        Ok(self
            .resolve(&query)?
            .map(|resolved| (resolved.asset.download_url, resolved.tag)))
    }
}

impl ReleaseSource for GithubReleases {
    fn resolve(&self, query: &ReleaseQuery) -> Result<Option<ResolvedRelease>, ResolutionError> {
        let payload = self.fetcher.fetch_text(&query.listing_url)?;
        let releases = parse_release_listing(&query.listing_url, &payload)?;
        let Some((release, asset)) = select_release(&releases, &query.tag_prefix, &query.asset)
        else {
            log::info!(
                "no release asset matched in {} (tag prefix {:?})",
                query.listing_url,
                query.tag_prefix
            );
            return Ok(None);
        };
        log::debug!("resolved {} at {}", asset.name, release.tag);
        Ok(Some(ResolvedRelease {
            tag: release.tag.clone(),
            asset: asset.clone(),
            checksum_asset: checksum_asset_for(release, asset, &query.checksum),
        }))
    }
}
