// Configuration management for the qtop CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/qtop/config.json
// - Linux: ~/.config/qtop/config.json
// - Windows: %APPDATA%\qtop\config.json

use anyhow::{Context, Result};
use qtop_core::control::InterceptorConfig;
use qtop_core::entropy::{EntropyPool, HashCounterSource, MAX_PRELOAD_COUNT};
use qtop_core::privacy::{
    shared_pool, PhaseDelayEngine, PhaseSourceKind, SharedEngine, SharedPool, TimingConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Seed pool settings
    pub pool: PoolConfig,

    /// Delay window and winding quantum
    pub timing: TimingConfig,

    /// Where phases come from
    #[serde(default)]
    pub phase_source: PhaseSourceKind,

    /// Bound on tracked circuits (unbounded when absent)
    #[serde(default)]
    pub max_circuits: Option<usize>,

    /// Control connection settings
    pub control: InterceptorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum blocks a preload may install
    pub capacity: usize,

    /// Entropy source identifier
    pub source: String,

    /// Blocks to preload
    pub preload_count: usize,

    /// Key mixed into the hash_counter source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            timing: TimingConfig::default(),
            phase_source: PhaseSourceKind::default(),
            max_circuits: None,
            control: InterceptorConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            source: HashCounterSource::ID.to_string(),
            preload_count: 1000,
            source_key: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("qtop");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the default config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from `path`, or create it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Reject settings the core would refuse at startup
    pub fn validate(&self) -> Result<()> {
        self.timing.validate().context("Invalid timing settings")?;
        if self.pool.capacity == 0 || self.pool.capacity > MAX_PRELOAD_COUNT {
            anyhow::bail!(
                "pool_capacity must be between 1 and {}",
                MAX_PRELOAD_COUNT
            );
        }
        if self.pool.preload_count == 0 || self.pool.preload_count > self.pool.capacity {
            anyhow::bail!("preload_count must be between 1 and pool_capacity");
        }
        if self.max_circuits == Some(0) {
            anyhow::bail!("max_circuits must be positive");
        }
        Ok(())
    }

    /// Set a config value. The result is validated before it is kept.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        match key {
            "pool_capacity" => {
                next.pool.capacity = value.parse().context("Invalid number")?;
            }
            "pool_source" => {
                next.pool.source = value.to_string();
            }
            "preload_count" => {
                next.pool.preload_count = value.parse().context("Invalid number")?;
            }
            "source_key" => {
                next.pool.source_key = optional(value);
            }
            "winding_quantum" => {
                next.timing.winding_quantum = value.parse().context("Invalid number")?;
            }
            "min_delay" => {
                next.timing.min_delay = value.parse().context("Invalid number")?;
            }
            "max_delay" => {
                next.timing.max_delay = value.parse().context("Invalid number")?;
            }
            "phase_source" => {
                next.phase_source = value.parse::<PhaseSourceKind>().map_err(anyhow::Error::msg)?;
            }
            "max_circuits" => {
                next.max_circuits = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().context("Invalid number")?)
                };
            }
            "control_port" => {
                next.control.control_port = value.parse().context("Invalid port number")?;
            }
            "control_password" => {
                next.control.password = optional(value);
            }
            "evict_on_circuit_close" => {
                next.control.evict_on_circuit_close =
                    value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "pool_capacity" => Some(self.pool.capacity.to_string()),
            "pool_source" => Some(self.pool.source.clone()),
            "preload_count" => Some(self.pool.preload_count.to_string()),
            "source_key" => self.pool.source_key.clone(),
            "winding_quantum" => Some(self.timing.winding_quantum.to_string()),
            "min_delay" => Some(self.timing.min_delay.to_string()),
            "max_delay" => Some(self.timing.max_delay.to_string()),
            "phase_source" => Some(self.phase_source.to_string()),
            "max_circuits" => self.max_circuits.map(|n| n.to_string()),
            "control_port" => Some(self.control.control_port.to_string()),
            "control_password" => self.control.password.clone(),
            "evict_on_circuit_close" => Some(self.control.evict_on_circuit_close.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("pool_capacity".to_string(), self.pool.capacity.to_string()),
            ("pool_source".to_string(), self.pool.source.clone()),
            ("preload_count".to_string(), self.pool.preload_count.to_string()),
            (
                "source_key".to_string(),
                if self.pool.source_key.is_some() { "(set)" } else { "(none)" }.to_string(),
            ),
            ("winding_quantum".to_string(), self.timing.winding_quantum.to_string()),
            ("min_delay".to_string(), format!("{}ms", self.timing.min_delay)),
            ("max_delay".to_string(), format!("{}ms", self.timing.max_delay)),
            ("phase_source".to_string(), self.phase_source.to_string()),
            (
                "max_circuits".to_string(),
                self.max_circuits
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "(unbounded)".to_string()),
            ),
            ("control_port".to_string(), self.control.control_port.to_string()),
            (
                "control_password".to_string(),
                if self.control.password.is_some() { "(set)" } else { "(none)" }.to_string(),
            ),
            (
                "evict_on_circuit_close".to_string(),
                self.control.evict_on_circuit_close.to_string(),
            ),
        ]
    }

    /// Preload a pool as configured
    pub fn build_pool(&self) -> Result<SharedPool> {
        let mut pool = EntropyPool::new(self.pool.capacity);
        if let Some(key) = &self.pool.source_key {
            pool.register_source(Box::new(HashCounterSource::with_key(key)));
        }
        pool.preload(&self.pool.source, self.pool.preload_count)
            .with_context(|| format!("Failed to preload from source '{}'", self.pool.source))?;
        Ok(shared_pool(pool))
    }

    /// Preload a pool and build the delay engine over it
    pub fn build_engine(&self) -> Result<(SharedPool, SharedEngine)> {
        let pool = self.build_pool()?;
        let mut engine =
            PhaseDelayEngine::new(self.timing, self.phase_source.build(pool.clone()))
                .context("Failed to create delay engine")?;
        if let Some(max) = self.max_circuits {
            engine = engine.with_max_circuits(max);
        }
        Ok((pool, engine.into_shared()))
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
