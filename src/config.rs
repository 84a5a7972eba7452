//! Configuration module for vecscope.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.vecscope/settings.toml`)
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `VS_` and use double underscores
//! to separate nested levels:
//! - `VS_INDEX__EF_SEARCH=128` sets `index.ef_search`
//! - `VS_CACHE__ENABLED=false` sets `cache.enabled`
//! - `VS_BUILD__POLICY=replace` sets `build.policy`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::build::{ConflictPolicy, ExecutionMode};
use crate::vector::{IndexParams, KMeansConfig, Projector};

/// Directory holding the settings file, searched for in every ancestor.
pub const CONFIG_DIR: &str = ".vecscope";

const CONFIG_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// ANN index settings
    #[serde(default)]
    pub index: IndexConfig,

    /// PCA projection settings
    #[serde(default)]
    pub projection: ProjectionConfig,

    /// K-means settings
    #[serde(default)]
    pub clustering: ClusteringConfig,

    /// Artifact cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Build scheduling settings
    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexConfig {
    /// Candidate list size while building (quality vs. build speed)
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Candidate list size while searching (recall vs. query speed)
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    /// Graph degree
    #[serde(default = "default_m")]
    pub m: usize,

    /// Vectors inserted between progress events
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Fixed seed for layer assignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProjectionConfig {
    /// Power-iteration steps per component
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClusteringConfig {
    /// Cluster count, suggested from input size when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,

    #[serde(default = "default_max_iters")]
    pub max_iters: usize,

    #[serde(default = "default_tolerance")]
    pub tolerance: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    /// Load and store built artifacts
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory; defaults to the user cache dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BuildConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// What a build request does while another build of the same target runs
    #[serde(default)]
    pub policy: ConflictPolicy,

    /// Number of threads for parallel numeric work
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}
fn default_m() -> usize {
    16
}
fn default_chunk_size() -> usize {
    1024
}
fn default_iterations() -> usize {
    crate::vector::DEFAULT_ITERATIONS
}
fn default_max_iters() -> usize {
    crate::vector::DEFAULT_MAX_ITERS
}
fn default_tolerance() -> f32 {
    crate::vector::DEFAULT_TOLERANCE
}
fn default_true() -> bool {
    true
}
fn default_parallel_threads() -> usize {
    num_cpus::get()
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            index: IndexConfig::default(),
            projection: ProjectionConfig::default(),
            clustering: ClusteringConfig::default(),
            cache: CacheConfig::default(),
            build: BuildConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            m: default_m(),
            chunk_size: default_chunk_size(),
            seed: None,
        }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            seed: None,
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            k: None,
            max_iters: default_max_iters(),
            tolerance: default_tolerance(),
            seed: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            policy: ConflictPolicy::default(),
            parallel_threads: default_parallel_threads(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl IndexConfig {
    pub fn params(&self) -> IndexParams {
        IndexParams {
            ef_construction: self.ef_construction,
            m: self.m,
            chunk_size: self.chunk_size,
            seed: self.seed,
        }
    }
}

impl ProjectionConfig {
    pub fn projector(&self) -> Projector {
        Projector::new(self.iterations).with_seed(self.seed)
    }
}

impl ClusteringConfig {
    pub fn kmeans(&self) -> KMeansConfig {
        KMeansConfig {
            k: self.k,
            max_iters: self.max_iters,
            tolerance: self.tolerance,
            seed: self.seed,
        }
    }
}

impl CacheConfig {
    /// Configured directory, or `<user cache dir>/vecscope`.
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .map(|dir| dir.join("vecscope"))
                .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("cache")),
        }
    }
}

/// `VS_` variables with `__` as the nesting separator.
fn env_provider() -> Env {
    Env::prefixed("VS_").map(|key| {
        key.as_str()
            .to_lowercase()
            .replace("__", ".") // Double underscore becomes dot
            .into()
    })
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Find the settings file by looking for a .vecscope directory
    /// from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(env_provider())
            .extract()
            .map_err(Box::new)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments in `dir`
    pub fn init_config_file_in(
        dir: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# vecscope configuration file

# Version of the configuration schema
version = 1

[index]
# Candidate list size while building; higher is slower but more accurate
ef_construction = 200

# Candidate list size while searching; applies without a rebuild
ef_search = 64

# Graph degree (layer 0 uses twice this many links)
m = 16

# Vectors inserted between progress events and cancellation checks
chunk_size = 1024

# Fixed seed for reproducible graphs
# seed = 42

[projection]
# Power-iteration steps per principal component
iterations = 60

# Fixed seed; without one, axes may flip sign between runs
# seed = 42

[clustering]
# Cluster count; suggested from input size when unset
# k = 8

max_iters = 100
tolerance = 0.0001

# seed = 42

[cache]
# Reuse previously built indexes and projections
enabled = true

# Cache directory (defaults to the user cache directory)
# dir = "{}"

[build]
# "worker" runs builds off the caller's thread, "inline" blocks
mode = "worker"

# "queue", "replace" (cancel the running build) or "reject"
policy = "queue"

# Threads for parallel numeric work (defaults to CPU count)
# parallel_threads = {}

[logging]
# Used when RUST_LOG is not set
level = "warn"
"#,
            CacheConfig::default().resolved_dir().display(),
            num_cpus::get()
        );

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }

    /// Create the default settings file under the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        Self::init_config_file_in(".", force)
    }
}
