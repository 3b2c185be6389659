use std::path::Path;

use facet::Facet;

use crate::error::CorralError;

/// Top-level `corral.toml` schema.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    /// Machine tool binary. Resolved through PATH when not absolute.
    #[facet(default = "macadam")]
    pub binary: String,

    /// Reconciliation period in milliseconds.
    #[facet(default = 5000)]
    pub poll_interval_ms: u64,

    /// Defaults applied to `corral init` when the flag is not given.
    #[facet(default)]
    pub defaults: CreateDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary: "macadam".into(),
            poll_interval_ms: 5000,
            defaults: CreateDefaults::default(),
        }
    }
}

/// Optional defaults for machine creation. Sizes are human-readable
/// strings (`"4G"`), parsed with [`crate::util::parse_size`] at use time.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct CreateDefaults {
    /// Machine name used when `init` is given no positional name.
    pub name: Option<String>,
    pub cpus: Option<u64>,
    pub memory: Option<String>,
    pub disk_size: Option<String>,
}

/// Load `corral.toml` from `path`. A missing file is not an error — every
/// setting has a default, so corral works out of the box next to an installed
/// machine tool.
pub fn load_config(path: &Path) -> Result<Config, CorralError> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| CorralError::ConfigLoad {
        path: path.display().to_string(),
        source: e,
    })?;

    let config: Config = facet_toml::from_str(&content).map_err(|e| CorralError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), CorralError> {
    if config.binary.trim().is_empty() {
        return Err(CorralError::Validation {
            message: "binary must not be empty".into(),
        });
    }
    if config.poll_interval_ms == 0 {
        return Err(CorralError::Validation {
            message: "poll_interval_ms must be greater than zero".into(),
        });
    }
    Ok(())
}
