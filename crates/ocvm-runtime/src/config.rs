//! Runtime configuration
//!
//! Loaded from TOML; every field has a default so a config file only needs
//! to name what it changes:
//!
//! ```toml
//! [cache]
//! path = "/var/lib/node/code_cache.bin"
//! size = 1073741824
//!
//! [compile]
//! workers = 2
//! isolation = "process"
//!
//! [execution]
//! call_depth = 250
//! ```

use std::path::{Path, PathBuf};

use ocvm_engine::{ExecutionLimits, WasmLimits};
use serde::{Deserialize, Serialize};

use crate::cache::ARENA_START;
use crate::error::ConfigError;

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Code cache file
    pub cache: CacheConfig,
    /// Compile orchestration
    pub compile: CompileConfig,
    /// Static module constraints
    pub wasm: WasmLimits,
    /// Default per-call limits
    pub execution: ExecutionLimits,
}

/// Code cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache file location
    pub path: PathBuf,
    /// File size in bytes; the file grows to this but never shrinks
    pub size: u64,
    /// Fraction of the arena kept free by eviction after each insert
    pub eviction_watermark: f64,
    /// Entries evicted per round
    pub eviction_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: PathBuf::from("code_cache.bin"),
            size: 1024 * 1024 * 1024,
            eviction_watermark: 0.10,
            eviction_batch: 25,
        }
    }
}

/// Where compiles run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One `ocvm-compile-worker` process per compile
    Process,
    /// On a thread of the node process
    Thread,
}

/// Compile orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Compiles allowed in parallel
    pub workers: usize,
    /// Process or thread isolation
    pub isolation: Isolation,
    /// Worker binary; defaults to `ocvm-compile-worker` next to the current executable
    pub worker_executable: Option<PathBuf>,
    /// Resource limits applied to each worker process
    pub worker_limits: WorkerLimits,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            workers: num_cpus::get().clamp(1, 4),
            isolation: Isolation::Process,
            worker_executable: None,
            worker_limits: WorkerLimits::default(),
        }
    }
}

/// `setrlimit` values for a compile worker; 0 leaves a limit unset except
/// for core dumps, which 0 disables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLimits {
    /// CPU seconds
    pub cpu_seconds: u64,
    /// Address space in bytes
    pub address_space_bytes: u64,
    /// Core dump size in bytes
    pub core_dump_bytes: u64,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        WorkerLimits {
            cpu_seconds: 20,
            address_space_bytes: 4 * 1024 * 1024 * 1024,
            core_dump_bytes: 0,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let watermark = self.cache.eviction_watermark;
        if !(0.0..1.0).contains(&watermark) {
            return Err(ConfigError::Invalid(format!(
                "cache.eviction_watermark must be in [0, 1), got {}",
                watermark
            )));
        }
        if self.cache.eviction_batch == 0 {
            return Err(ConfigError::Invalid("cache.eviction_batch must be positive".to_string()));
        }
        if self.cache.size <= ARENA_START {
            return Err(ConfigError::Invalid(format!(
                "cache.size must exceed the {}-byte header region, got {}",
                ARENA_START, self.cache.size
            )));
        }
        if self.compile.workers == 0 {
            return Err(ConfigError::Invalid("compile.workers must be positive".to_string()));
        }
        if self.wasm.max_pages() == 0 {
            return Err(ConfigError::Invalid(
                "wasm.max_linear_memory must be at least one page".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker binary to spawn for process isolation
    pub fn worker_executable(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.compile.worker_executable {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| ConfigError::Invalid(format!("{} has no parent directory", exe.display())))?;
        Ok(dir.join("ocvm-compile-worker"))
    }
}
