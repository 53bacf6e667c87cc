//! `ops.yml` loading and workspace path resolution.
//!
//! The config file is deliberately small: a workspace root, a timezone, a
//! privacy toggle and the index tuning knobs. Missing keys fall back to the
//! documented defaults; a missing file is a `ConfigError` (exit 10).

use std::fs;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use obr_error::{OpsError, Result};

pub const CONFIG_FILE: &str = "ops.yml";

pub const DEFAULT_CONFIG_TEXT: &str = r#"workspace: "./data"
timezone: "Asia/Tokyo"
privacy:
  default_redaction: false
index:
  fts: true
  max_snippet_len: 160
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Reserved; currently informational.
    #[serde(default)]
    pub default_redaction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_true")]
    pub fts: bool,
    #[serde(default = "default_snippet_len")]
    pub max_snippet_len: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            fts: true,
            max_snippet_len: default_snippet_len(),
        }
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./data")
}

fn default_timezone() -> String {
    "Asia/Tokyo".to_string()
}

fn default_true() -> bool {
    true
}

fn default_snippet_len() -> u32 {
    160
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            timezone: default_timezone(),
            privacy: PrivacyConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl OpsConfig {
    /// Parse the configured timezone name (IANA, e.g. "Asia/Tokyo").
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| OpsError::Config(format!("Unknown timezone: {}", self.timezone)))
    }
}

pub fn load_config(path: &Path) -> Result<OpsConfig> {
    if !path.exists() {
        return Err(OpsError::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let text = fs::read_to_string(path)
        .map_err(|e| OpsError::Config(format!("Failed to read {}: {e}", path.display())))?;
    let config: OpsConfig = serde_yaml::from_str(&text)
        .map_err(|e| OpsError::Config(format!("Invalid config {}: {e}", path.display())))?;
    // Fail early on a bad timezone rather than at the first timestamp.
    config.tz()?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    fs::write(path, DEFAULT_CONFIG_TEXT)
        .map_err(|e| OpsError::Config(format!("Failed to write {}: {e}", path.display())))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Workspace layout
// ---------------------------------------------------------------------------

/// Resolved filesystem layout under the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub workspace: PathBuf,
    pub raw: PathBuf,
    pub canonical: PathBuf,
    pub events: PathBuf,
    pub index: PathBuf,
    pub db: PathBuf,
    pub artifacts: PathBuf,
    pub daemon_lock: PathBuf,
    pub cli_lock: PathBuf,
}

impl WorkspacePaths {
    pub fn resolve(config: &OpsConfig) -> Self {
        let workspace = config.workspace.clone();
        let canonical = workspace.join("canonical");
        Self {
            raw: workspace.join("raw").join("chat_json"),
            events: canonical.join("events.jsonl"),
            index: workspace.join("index"),
            db: workspace.join("index").join("brain.sqlite"),
            artifacts: workspace.join("artifacts"),
            daemon_lock: canonical.join(".opsd.lock"),
            cli_lock: canonical.join(".ops.lock"),
            canonical,
            workspace,
        }
    }

    /// Create the workspace subdirs and an empty canonical log if missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.raw, &self.canonical, &self.index, &self.artifacts] {
            fs::create_dir_all(dir)
                .map_err(|e| OpsError::Io(format!("Failed to create {}: {e}", dir.display())))?;
        }
        if !self.events.exists() {
            fs::write(&self.events, "").map_err(|e| {
                OpsError::Io(format!("Failed to create {}: {e}", self.events.display()))
            })?;
        }
        Ok(())
    }
}
