use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::decorate::MarkerStyle;

const DEFAULT_ENV_PREFIX: &str = "FEEDMARK";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub marker: MarkerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    #[serde(default = "default_startup_delay", with = "humantime_serde")]
    pub startup_delay: Duration,
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
    #[serde(default = "default_fade_out", with = "humantime_serde")]
    pub fade_out: Duration,
    #[serde(default = "default_navigation_settle", with = "humantime_serde")]
    pub navigation_settle: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay: default_startup_delay(),
            debounce: default_debounce(),
            fade_out: default_fade_out(),
            navigation_settle: default_navigation_settle(),
        }
    }
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_fade_out() -> Duration {
    Duration::from_millis(300)
}

fn default_navigation_settle() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerConfig {
    #[serde(default = "default_glyph")]
    pub glyph: String,
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            glyph: default_glyph(),
            title: default_title(),
        }
    }
}

impl MarkerConfig {
    pub fn style(&self) -> MarkerStyle {
        MarkerStyle {
            glyph: self.glyph.clone(),
            title: self.title.clone(),
        }
    }
}

fn default_glyph() -> String {
    MarkerStyle::default().glyph
}

fn default_title() -> String {
    MarkerStyle::default().title
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScannerConfig {
    #[serde(default)]
    pub extra_selectors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "feedmark=info".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    base.timing = other.timing;

    if !other.marker.glyph.is_empty() {
        base.marker.glyph = other.marker.glyph;
    }
    if !other.marker.title.is_empty() {
        base.marker.title = other.marker.title;
    }

    if !other.scanner.extra_selectors.is_empty() {
        base.scanner.extra_selectors = other.scanner.extra_selectors;
    }

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    if !other.log.filter.is_empty() {
        base.log.filter = other.log.filter;
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    let duration = |value: &str| humantime::parse_duration(value.trim()).ok();
    match key {
        "timing.startup_delay" => {
            if let Some(parsed) = duration(&value) {
                cfg.timing.startup_delay = parsed;
            }
        }
        "timing.debounce" => {
            if let Some(parsed) = duration(&value) {
                cfg.timing.debounce = parsed;
            }
        }
        "timing.fade_out" => {
            if let Some(parsed) = duration(&value) {
                cfg.timing.fade_out = parsed;
            }
        }
        "timing.navigation_settle" => {
            if let Some(parsed) = duration(&value) {
                cfg.timing.navigation_settle = parsed;
            }
        }
        "marker.glyph" => cfg.marker.glyph = value,
        "marker.title" => cfg.marker.title = value,
        "scanner.extra_selectors" => {
            // Selector lists contain commas themselves; entries are split on ';'.
            cfg.scanner.extra_selectors = value
                .split(';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("feedmark").join("config.yaml"))
}
