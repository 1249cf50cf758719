use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::host_backend::SystemdUnitName;
use crate::version::TagOrder;

// Environment variable names (external interface). All variables use the
// TAGUP_ prefix.
pub const ENV_PROFILE: &str = "TAGUP_ENV";
pub const ENV_REPO: &str = "TAGUP_REPO";
pub const ENV_API_BASE: &str = "TAGUP_API_BASE";
pub const ENV_TAGS_PER_PAGE: &str = "TAGUP_TAGS_PER_PAGE";
pub const ENV_POLL_INTERVAL_SECS: &str = "TAGUP_POLL_INTERVAL_SECS";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "TAGUP_HTTP_TIMEOUT_SECS";
pub const ENV_WORKDIR: &str = "TAGUP_WORKDIR";
pub const ENV_SERVICE_UNIT: &str = "TAGUP_SERVICE_UNIT";
pub const ENV_MANIFEST: &str = "TAGUP_MANIFEST";
pub const ENV_VENV_DIR: &str = "TAGUP_VENV_DIR";
pub const ENV_TAG_ORDER: &str = "TAGUP_TAG_ORDER";
pub const ENV_FEED_MOCK: &str = "TAGUP_FEED_MOCK";
pub const ENV_LOG: &str = "TAGUP_LOG";

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_TAGS_PER_PAGE: u32 = 20;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 600;
const MIN_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_SERVICE_UNIT: &str = "deye-dashboard";
pub const DEFAULT_MANIFEST: &str = "requirements.txt";
pub const DEFAULT_VENV_DIR: &str = "venv";

/// Coarse runtime profile. Only `test` changes behaviour: it allows the
/// release feed to be replaced by `TAGUP_FEED_MOCK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Dev,
    Prod,
    Test,
}

impl Profile {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "test" | "testing" => Profile::Test,
            "prod" | "production" => Profile::Prod,
            _ => Profile::Dev,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// `owner/name` of the repository whose tags are watched.
    pub repo: Option<String>,
    pub api_base: String,
    pub per_page: u32,
    pub timeout: Duration,
    /// Canned feed response, honoured only in the test profile.
    pub mock: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub profile: Profile,
    pub feed: FeedConfig,
    pub poll_interval: Duration,
    pub tag_order: TagOrder,
    pub workdir: PathBuf,
    pub service_unit: SystemdUnitName,
    pub manifest: String,
    pub venv_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let profile = get(ENV_PROFILE)
            .map(|raw| Profile::parse(&raw))
            .unwrap_or(Profile::Dev);

        let repo = match get(ENV_REPO) {
            Some(raw) => Some(validate_repo(&raw)?),
            None => None,
        };

        let api_base = get(ENV_API_BASE)
            .map(|raw| raw.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        url::Url::parse(&api_base).map_err(|e| ConfigError::Rejected {
            name: ENV_API_BASE,
            reason: e.to_string(),
        })?;

        let per_page = parse_number(get(ENV_TAGS_PER_PAGE), ENV_TAGS_PER_PAGE)?
            .map(|v| v.clamp(1, 100) as u32)
            .unwrap_or(DEFAULT_TAGS_PER_PAGE);

        let poll_secs = parse_number(get(ENV_POLL_INTERVAL_SECS), ENV_POLL_INTERVAL_SECS)?
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(MIN_POLL_INTERVAL_SECS);

        let http_timeout = parse_number(get(ENV_HTTP_TIMEOUT_SECS), ENV_HTTP_TIMEOUT_SECS)?
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

        let tag_order = match get(ENV_TAG_ORDER) {
            Some(raw) => raw.parse::<TagOrder>().map_err(|_| ConfigError::InvalidValue {
                name: ENV_TAG_ORDER,
                expected: "\"feed\" or \"semver\"",
                value: raw,
            })?,
            None => TagOrder::Feed,
        };

        let workdir = match get(ENV_WORKDIR) {
            Some(raw) => PathBuf::from(raw),
            None => env::current_dir().map_err(|e| ConfigError::Rejected {
                name: ENV_WORKDIR,
                reason: e.to_string(),
            })?,
        };

        let unit_raw = get(ENV_SERVICE_UNIT).unwrap_or_else(|| DEFAULT_SERVICE_UNIT.to_string());
        let service_unit =
            SystemdUnitName::parse(&unit_raw).map_err(|reason| ConfigError::Rejected {
                name: ENV_SERVICE_UNIT,
                reason,
            })?;

        let manifest_raw = get(ENV_MANIFEST).unwrap_or_else(|| DEFAULT_MANIFEST.to_string());
        let manifest = normalize_relative_path(ENV_MANIFEST, Path::new(&manifest_raw))?;

        let venv_dir = PathBuf::from(get(ENV_VENV_DIR).unwrap_or_else(|| DEFAULT_VENV_DIR.to_string()));

        let mock = match profile {
            Profile::Test => get(ENV_FEED_MOCK),
            _ => None,
        };

        Ok(Self {
            profile,
            feed: FeedConfig {
                repo,
                api_base,
                per_page,
                timeout: Duration::from_secs(http_timeout),
                mock,
            },
            poll_interval: Duration::from_secs(poll_secs),
            tag_order,
            workdir,
            service_unit,
            manifest,
            venv_dir,
        })
    }
}

fn parse_number(raw: Option<String>, name: &'static str) -> Result<Option<u64>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name,
                expected: "a non-negative integer",
                value,
            }),
    }
}

fn validate_repo(raw: &str) -> Result<String, ConfigError> {
    let reject = |reason: &str| ConfigError::Rejected {
        name: ENV_REPO,
        reason: reason.to_string(),
    };
    let Some((owner, name)) = raw.split_once('/') else {
        return Err(reject("expected owner/name"));
    };
    for part in [owner, name] {
        if part.is_empty() {
            return Err(reject("expected owner/name"));
        }
        let ok = part
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
        if !ok || part == "." || part == ".." {
            return Err(reject("unsupported character"));
        }
    }
    Ok(raw.to_string())
}

/// Rejects paths that leave the working copy and returns the rest in the
/// `a/b` form git prints, without `.` segments.
fn normalize_relative_path(name: &'static str, path: &Path) -> Result<String, ConfigError> {
    let rejected = || ConfigError::Rejected {
        name,
        reason: "must be a path inside the working copy".to_string(),
    };
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(rejected()),
        }
    }
    if parts.is_empty() {
        return Err(rejected());
    }
    Ok(parts.join("/"))
}
