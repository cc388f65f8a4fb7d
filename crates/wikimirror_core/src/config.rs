use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::tree::DEFAULT_COLLATION_LOCALE;
use crate::vcs::CommitterIdentity;

pub const DEFAULT_USER_AGENT: &str = "wikimirror/0.2";
pub const DEFAULT_MIRROR_ROOT: &str = "git_sync";
pub const DEFAULT_WATERMARK_FILE: &str = "history.json";
pub const DEFAULT_ASSET_DIR: &str = "_assets";
pub const DEFAULT_GIT_BINARY: &str = "git";

pub const ENV_API_URL: &str = "WIKIJS_API_URL";
pub const ENV_API_KEY: &str = "WIKIJS_API_KEY";
pub const ENV_GIT_BINARY: &str = "WIKIMIRROR_GIT";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub mirror: MirrorSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub collation_locale: Option<String>,
    pub timeout_ms: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorSection {
    pub root: Option<PathBuf>,
    pub watermark_file: Option<String>,
    pub asset_dir: Option<String>,
    pub git_binary: Option<String>,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
}

impl MirrorConfig {
    /// Wiki.js site URL: env WIKIJS_API_URL > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        self.api_url_with(|key| env::var(key).ok())
    }

    /// Bearer token: env WIKIJS_API_KEY > config > None.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_with(|key| env::var(key).ok())
    }

    /// Git executable: env WIKIMIRROR_GIT > config > `git`.
    pub fn git_binary(&self) -> String {
        self.git_binary_with(|key| env::var(key).ok())
    }

    pub fn api_url_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        env_override(&lookup, ENV_API_URL).or_else(|| non_blank(self.wiki.api_url.as_deref()))
    }

    pub fn api_key_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        env_override(&lookup, ENV_API_KEY).or_else(|| non_blank(self.wiki.api_key.as_deref()))
    }

    pub fn git_binary_with<F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        env_override(&lookup, ENV_GIT_BINARY)
            .or_else(|| non_blank(self.mirror.git_binary.as_deref()))
            .unwrap_or_else(|| DEFAULT_GIT_BINARY.to_string())
    }

    pub fn user_agent(&self) -> String {
        non_blank(self.wiki.user_agent.as_deref()).unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn collation_locale(&self) -> String {
        non_blank(self.wiki.collation_locale.as_deref())
            .unwrap_or_else(|| DEFAULT_COLLATION_LOCALE.to_string())
    }

    /// `timeout_ms = 0` and an absent key both mean no timeout.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.wiki.timeout_ms.filter(|timeout| *timeout > 0)
    }

    pub fn watermark_file_name(&self) -> String {
        non_blank(self.mirror.watermark_file.as_deref())
            .unwrap_or_else(|| DEFAULT_WATERMARK_FILE.to_string())
    }

    pub fn asset_dir_name(&self) -> String {
        non_blank(self.mirror.asset_dir.as_deref()).unwrap_or_else(|| DEFAULT_ASSET_DIR.to_string())
    }

    pub fn committer(&self) -> CommitterIdentity {
        CommitterIdentity {
            name: non_blank(self.mirror.committer_name.as_deref()),
            email: non_blank(self.mirror.committer_email.as_deref()),
        }
    }
}

fn env_override<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|value| non_blank(Some(&value)))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Load and parse a MirrorConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MirrorConfig> {
    if !config_path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MirrorConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
