use regex::Regex;
use semver::Version;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::error::TagError;
use crate::host_backend::{CommandSpec, HostBackend, is_disallowed_shell_char};

pub const UNKNOWN_VERSION: &str = "unknown";
pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TAG_LEN: usize = 255;

/// Describe the working tree relative to the nearest tag, e.g. `v1.2.0` or
/// `v1.2.0-5-gabc123`. Any failure yields [`UNKNOWN_VERSION`].
pub async fn current_version(backend: &dyn HostBackend) -> String {
    let spec = CommandSpec::new("git", DESCRIBE_TIMEOUT).args(["describe", "--tags", "--always"]);
    match backend.exec(&spec).await {
        Ok(result) if result.success() && !result.stdout.is_empty() => result.stdout,
        Ok(result) => {
            debug!("git describe failed exit={:?} stderr={}", result.exit, result.stderr);
            UNKNOWN_VERSION.to_string()
        }
        Err(err) => {
            debug!("git describe error kind={} err={err}", err.kind());
            UNKNOWN_VERSION.to_string()
        }
    }
}

/// A newer release is pending only when the latest tag is neither the current
/// version nor a prefix of it. The prefix case covers `<tag>-<n>-g<hash>`,
/// i.e. local commits on top of the latest tag.
pub fn update_available(current: &str, latest: Option<&str>) -> bool {
    let Some(latest) = latest else {
        return false;
    };
    if current == UNKNOWN_VERSION {
        return false;
    }
    latest != current && !current.starts_with(latest)
}

/// The pieces of a `git describe` string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DescribedVersion {
    pub base_tag: String,
    pub commits_ahead: u32,
    pub commit: Option<String>,
}

impl DescribedVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        static DESCRIBE_RE: OnceLock<Regex> = OnceLock::new();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == UNKNOWN_VERSION {
            return None;
        }
        let regex = DESCRIBE_RE.get_or_init(|| {
            Regex::new(r"^(?P<tag>.+)-(?P<ahead>\d+)-g(?P<hash>[0-9a-f]{4,40})$").unwrap()
        });
        if let Some(caps) = regex.captures(trimmed) {
            return Some(Self {
                base_tag: caps["tag"].to_string(),
                commits_ahead: caps["ahead"].parse().unwrap_or(0),
                commit: Some(caps["hash"].to_string()),
            });
        }
        Some(Self {
            base_tag: trimmed.to_string(),
            commits_ahead: 0,
            commit: None,
        })
    }
}

/// A validated release tag. Tags end up as argv entries for git, so anything
/// that could read as an option or a revision expression is refused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ReleaseTag(String);

impl ReleaseTag {
    pub fn parse(raw: &str) -> Result<Self, TagError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TagError::Missing);
        }
        if trimmed.len() > MAX_TAG_LEN {
            return Err(TagError::Invalid("tag-too-long"));
        }
        if trimmed.starts_with('-') {
            return Err(TagError::Invalid("tag-leading-dash"));
        }
        if trimmed.contains("..") || trimmed.contains("@{") {
            return Err(TagError::Invalid("tag-revision-syntax"));
        }
        if trimmed.ends_with('/') || trimmed.ends_with(".lock") {
            return Err(TagError::Invalid("tag-bad-suffix"));
        }
        if trimmed.chars().any(is_disallowed_shell_char) {
            return Err(TagError::Invalid("tag-unsafe-char"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReleaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the tag list from the feed is ordered before `latest` is picked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TagOrder {
    /// Trust the feed: first entry is the newest.
    #[default]
    Feed,
    /// Newest semantic version first; tags that are not semver keep their
    /// feed order after all semver tags.
    Semver,
}

impl FromStr for TagOrder {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "feed" => Ok(TagOrder::Feed),
            "semver" => Ok(TagOrder::Semver),
            other => Err(format!("unknown tag order {other:?}")),
        }
    }
}

pub fn order_tags(tags: Vec<String>, order: TagOrder) -> Vec<String> {
    match order {
        TagOrder::Feed => tags,
        TagOrder::Semver => {
            let mut versioned = Vec::new();
            let mut other = Vec::new();
            for tag in tags {
                match parse_tag_semver(&tag) {
                    Some(version) => versioned.push((version, tag)),
                    None => other.push(tag),
                }
            }
            // Stable sort keeps feed order among equal versions.
            versioned.sort_by(|a, b| b.0.cmp(&a.0));
            versioned
                .into_iter()
                .map(|(_, tag)| tag)
                .chain(other)
                .collect()
        }
    }
}

fn parse_tag_semver(tag: &str) -> Option<Version> {
    let raw = tag.strip_prefix(['v', 'V']).unwrap_or(tag);
    Version::parse(raw).ok()
}
