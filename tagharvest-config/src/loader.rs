use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tagharvest_core::harvest::HarvestConfig;

use crate::validation::{ConfigWarnings, collect_warnings};

pub const ENV_CONFIG_PATH: &str = "TAGHARVEST_CONFIG_PATH";
pub const ENV_CONFIG_JSON: &str = "TAGHARVEST_CONFIG_JSON";

const CANDIDATES: &[&str] = &[
    "tagharvest.toml",
    "tagharvest.json",
    "config/tagharvest.toml",
    "config/tagharvest.json",
];

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("built-in defaults"),
            ConfigSource::EnvPath(path) => write!(f, "{} (from {ENV_CONFIG_PATH})", path.display()),
            ConfigSource::EnvInline => f.write_str(ENV_CONFIG_JSON),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A validated configuration plus its provenance.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: HarvestConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
}

/// Resolves [`HarvestConfig`] from files and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base_dir: PathBuf,
    read_dotenv: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            read_dotenv: true,
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory the default candidate files are looked up in.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_dotenv(mut self, enabled: bool) -> Self {
        self.read_dotenv = enabled;
        self
    }

    /// Load from the process environment.
    pub fn load(&self) -> anyhow::Result<ConfigLoad> {
        if self.read_dotenv {
            match dotenvy::dotenv() {
                Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
                Err(err) if err.not_found() => {}
                Err(err) => return Err(err).context("failed to read .env"),
            }
        }
        self.load_with(|key| env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_with<F>(&self, lookup: F) -> anyhow::Result<ConfigLoad>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config, source) = self.resolve(&lookup)?;
        finish(config, source)
    }

    /// Load one explicit file, skipping discovery.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<ConfigLoad> {
        let config = load_from_file(path)?;
        finish(config, ConfigSource::File(path.to_path_buf()))
    }

    fn resolve<F>(&self, lookup: &F) -> anyhow::Result<(HarvestConfig, ConfigSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path_str) = lookup(ENV_CONFIG_PATH)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str.trim());
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = lookup(ENV_CONFIG_JSON)
            && !raw.trim().is_empty()
        {
            let parsed = parse_json(&raw).with_context(|| format!("failed to parse {ENV_CONFIG_JSON}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((HarvestConfig::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .map(|candidate| self.base_dir.join(candidate))
            .find(|path| path.is_file())
    }
}

fn finish(config: HarvestConfig, source: ConfigSource) -> anyhow::Result<ConfigLoad> {
    config
        .validate()
        .with_context(|| format!("invalid configuration from {source}"))?;
    let warnings = collect_warnings(&config);
    for warning in warnings.iter() {
        tracing::warn!(key = warning.key, "{}", warning.message);
    }
    Ok(ConfigLoad {
        config,
        source,
        warnings,
    })
}

pub fn load_from_file(path: &Path) -> anyhow::Result<HarvestConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents).with_context(|| format!("invalid config {}", path.display())),
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Parse TOML, falling back to JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<HarvestConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<HarvestConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
}
