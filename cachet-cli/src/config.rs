use anyhow::{Context, Result};
use cachet::CacheConfig;
use std::path::{Path, PathBuf};

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".cachet").join("config.toml"))
}

/// Get the default cache root
pub fn default_cache_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".cachet").join("cache"))
}

/// Parse a config file; absent keys take their defaults
pub fn load_from(path: &Path) -> Result<CacheConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve the configuration for this invocation.
///
/// `--cache` wins over the config file's root, which wins over the default.
pub fn resolve(cache_override: Option<PathBuf>) -> Result<CacheConfig> {
    let config_path = get_config_path()?;
    let mut config = if config_path.exists() {
        load_from(&config_path)?
    } else {
        CacheConfig::default()
    };

    if let Some(root) = cache_override {
        config.root = root;
    } else if config.root.as_os_str().is_empty() {
        config.root = default_cache_path()?;
    }
    Ok(config)
}
