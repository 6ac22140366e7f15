//! # Configuration
//!
//! `xrev.toml` lives next to the repository file. Every section is optional;
//! a missing file means defaults.
//!
//! ```toml
//! [ingest]
//! ingest_unknowns = false
//! unrev_unknowns = false
//! validate_references = true
//!
//! [references]
//! prefix = "ref"
//! attributes = ["href", "target"]
//!
//! [repository]
//! seed = 42
//! ```
//!
//! Environment overrides (`1`/`true`/`yes`/`on` and their negations):
//! `XREV_INGEST_UNKNOWNS`, `XREV_UNREV_UNKNOWNS`, `XREV_VALIDATE_REFERENCES`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use xrev_core::primitives::DEFAULT_UID_SEED;
use xrev_core::{IngestPolicy, MemoryRepository, PrefixRole, Session, XrevError};

/// File name of the configuration, resolved against the repository's directory.
pub const CONFIG_FILE_NAME: &str = "xrev.toml";

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ingest: IngestPolicy,
    pub references: ReferencesConfig,
    pub repository: RepositoryConfig,
}

/// Which attributes hold cross-references.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReferencesConfig {
    /// Attributes starting with this are references. Empty disables the rule.
    pub prefix: String,
    /// Extra reference attributes, matched by exact name.
    pub attributes: Vec<String>,
}

impl Default for ReferencesConfig {
    fn default() -> Self {
        Self {
            prefix: "ref".to_string(),
            attributes: Vec::new(),
        }
    }
}

impl ReferencesConfig {
    #[must_use]
    pub fn role(&self) -> PrefixRole {
        self.attributes
            .iter()
            .fold(PrefixRole::new(self.prefix.clone()), |role, name| {
                role.with_attribute(name.clone())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Seed of the internal uid generator for newly initialized repositories.
    pub seed: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_UID_SEED,
        }
    }
}

impl Config {
    /// A session over `repo` running under this configuration.
    #[must_use]
    pub fn session(&self, repo: MemoryRepository) -> Session {
        Session::with_policy(repo, self.ingest, Box::new(self.references.role()))
    }

    /// An empty repository seeded from `[repository]`.
    #[must_use]
    pub fn new_repository(&self) -> MemoryRepository {
        MemoryRepository::with_seed(self.repository.seed)
    }
}

// =============================================================================
// LOADING
// =============================================================================

/// Path of the configuration belonging to a repository file.
pub fn config_path(repo_path: &Path) -> PathBuf {
    repo_path
        .parent()
        .unwrap_or(Path::new("."))
        .join(CONFIG_FILE_NAME)
}

pub fn parse(text: &str) -> Result<Config, XrevError> {
    toml::from_str(text).map_err(|e| XrevError::ConfigError(e.to_string()))
}

/// Load the configuration for `repo_path`, then apply environment overrides.
pub fn load(repo_path: &Path) -> Result<Config, XrevError> {
    let path = config_path(repo_path);
    let mut config = if path.exists() {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            XrevError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = parse(&text).map_err(|e| {
            XrevError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        config
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_env_overrides_from<F>(config: &mut Config, mut lookup: F)
where
    F: FnMut(&str) -> Option<String>,
{
    let switches: [(&str, &mut bool); 3] = [
        ("XREV_INGEST_UNKNOWNS", &mut config.ingest.ingest_unknowns),
        ("XREV_UNREV_UNKNOWNS", &mut config.ingest.unrev_unknowns),
        (
            "XREV_VALIDATE_REFERENCES",
            &mut config.ingest.validate_references,
        ),
    ];
    for (key, slot) in switches {
        let Some(raw) = lookup(key) else {
            continue;
        };
        match parse_boolish(&raw) {
            Some(value) => *slot = value,
            None => tracing::warn!("invalid {}, ignoring: '{}'", key, raw),
        }
    }
}

fn parse_boolish(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================
