// Configuration Storage Service
// Handles config, user lists and domain rules on disk, with version backup

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

use crate::models::{CategoryWeights, DomainRule, GuardMode, ListItem};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub version: String,
    pub default_provider: Option<String>,
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub enabled: bool,
    pub http: Option<String>,
    pub https: Option<String>,
}

impl ProxyConfig {
    /// Effective proxy URL when the proxy is enabled
    pub fn active_url(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.https
            .as_deref()
            .or(self.http.as_deref())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfig {
    /// Scores at or below this pass without blocking
    #[serde(default = "default_pass_max")]
    pub pass_max: f64,
    /// Scores at or above this are converted
    #[serde(default = "default_convert_min")]
    pub convert_min: f64,
    #[serde(default)]
    pub fail_open_on_convert_error: bool,
    #[serde(default = "default_true")]
    pub fail_open_on_decision_error: bool,
    #[serde(default)]
    pub auto_send_converted: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_enhanced_timeout_ms")]
    pub enhanced_timeout_ms: u64,
    #[serde(default = "default_service_timeout_ms")]
    pub service_timeout_ms: u64,
    #[serde(default = "default_guard_mode_cache_secs")]
    pub guard_mode_cache_secs: u64,
    #[serde(default)]
    pub guard_mode: GuardMode,
    #[serde(default = "CategoryWeights::prefilter")]
    pub prefilter_weights: CategoryWeights,
    #[serde(default = "CategoryWeights::enhanced")]
    pub enhanced_weights: CategoryWeights,
    #[serde(default)]
    pub lexicon_path: Option<PathBuf>,
    #[serde(default)]
    pub legacy_word_list_path: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            pass_max: default_pass_max(),
            convert_min: default_convert_min(),
            fail_open_on_convert_error: false,
            fail_open_on_decision_error: true,
            auto_send_converted: false,
            debounce_ms: default_debounce_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            enhanced_timeout_ms: default_enhanced_timeout_ms(),
            service_timeout_ms: default_service_timeout_ms(),
            guard_mode_cache_secs: default_guard_mode_cache_secs(),
            guard_mode: GuardMode::default(),
            prefilter_weights: CategoryWeights::prefilter(),
            enhanced_weights: CategoryWeights::enhanced(),
            lexicon_path: None,
            legacy_word_list_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub enabled: bool,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// Whitelist and blacklist as persisted in lists.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoredLists {
    #[serde(default)]
    pub whitelist: Vec<ListItem>,
    #[serde(default)]
    pub blacklist: Vec<ListItem>,
}

fn default_pass_max() -> f64 { 1.0 }
fn default_convert_min() -> f64 { 4.0 }
fn default_true() -> bool { true }
fn default_debounce_ms() -> u64 { 350 }
fn default_cache_ttl_secs() -> u64 { 90 }
fn default_cache_capacity() -> usize { 500 }
fn default_enhanced_timeout_ms() -> u64 { 1500 }
fn default_service_timeout_ms() -> u64 { 10_000 }
fn default_guard_mode_cache_secs() -> u64 { 30 }

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
    lists_file: PathBuf,
    domains_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        let lists_file = config_dir.join("lists.json");
        let domains_file = config_dir.join("domains.json");
        Self {
            config_dir,
            config_file,
            lists_file,
            domains_file,
        }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cleanchat"))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), String> {
        fs::create_dir_all(&self.config_dir)
            .map_err(|e| format!("Failed to create config dir: {}", e))
    }

    /// Load configuration from file
    pub fn load(&self) -> Result<AppConfig, String> {
        read_json_or_default(&self.config_file, "config")
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig) -> Result<(), String> {
        self.write_with_backup(&self.config_file, "config", config)
    }

    pub fn load_lists(&self) -> Result<StoredLists, String> {
        read_json_or_default(&self.lists_file, "lists")
    }

    pub fn save_lists(&self, lists: &StoredLists) -> Result<(), String> {
        self.write_with_backup(&self.lists_file, "lists", lists)
    }

    pub fn load_domain_rules(&self) -> Result<Vec<DomainRule>, String> {
        read_json_or_default(&self.domains_file, "domain rules")
    }

    pub fn save_domain_rules(&self, rules: &[DomainRule]) -> Result<(), String> {
        self.write_with_backup(&self.domains_file, "domain rules", &rules)
    }

    fn write_with_backup<T: Serialize>(&self, file: &Path, what: &str, value: &T) -> Result<(), String> {
        self.ensure_dir()?;

        // Create backup if file exists
        if file.exists() {
            self.create_backup(file)?;
        }

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| format!("Failed to serialize {}: {}", what, e))?;

        fs::write(file, content).map_err(|e| format!("Failed to write {}: {}", what, e))
    }

    /// Create a backup of the current file
    fn create_backup(&self, file: &Path) -> Result<(), String> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir)
            .map_err(|e| format!("Failed to create backup dir: {}", e))?;

        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string());
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let backup_file = backup_dir.join(format!("{}_{}.json", stem, timestamp));

        fs::copy(file, &backup_file).map_err(|e| format!("Failed to create backup: {}", e))?;

        // Keep only last 10 backups per file
        self.cleanup_old_backups(&backup_dir, &stem, 10)?;

        Ok(())
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, stem: &str, keep: usize) -> Result<(), String> {
        let prefix = format!("{}_", stem);
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(|e| format!("Failed to read backup dir: {}", e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Sort by modification time (oldest first)
        entries.sort_by_key(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });

        let remove_count = entries.len() - keep;
        for entry in entries.iter().take(remove_count) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }

    /// Get provider API key from config file
    pub fn get_api_key(&self, provider: &str) -> Result<Option<String>, String> {
        let config = self.load()?;
        Ok(config.api_keys.get(provider).cloned())
    }

    /// Store provider API key in config file
    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<(), String> {
        let mut config = self.load()?;
        config.api_keys.insert(provider.to_string(), key.to_string());
        self.save(&config)
    }

    /// Get provider base URL from config file
    pub fn get_provider_url(&self, provider: &str) -> Result<Option<String>, String> {
        let config = self.load()?;
        Ok(config.providers.get(provider).and_then(|p| p.base_url.clone()))
    }

    pub fn set_guard_mode(&self, mode: GuardMode) -> Result<(), String> {
        let mut config = self.load()?;
        config.guard.guard_mode = mode;
        self.save(&config)
    }
}

fn read_json_or_default<T>(file: &Path, what: &str) -> Result<T, String>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if !file.exists() {
        return Ok(T::default());
    }

    let content =
        fs::read_to_string(file).map_err(|e| format!("Failed to read {}: {}", what, e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse {}: {}", what, e))
}

// ============ Guard Mode Source ============

/// Where the engine reads the active guard mode from. Externally mutable;
/// the engine re-reads it on a short cache.
#[async_trait]
pub trait GuardModeSource: Send + Sync {
    async fn guard_mode(&self) -> GuardMode;
}

/// In-process guard mode setting
#[derive(Debug, Default)]
pub struct FixedGuardMode {
    mode: RwLock<GuardMode>,
}

impl FixedGuardMode {
    pub fn new(mode: GuardMode) -> Self {
        Self {
            mode: RwLock::new(mode),
        }
    }

    pub fn set(&self, mode: GuardMode) {
        if let Ok(mut guard) = self.mode.write() {
            *guard = mode;
        }
    }
}

#[async_trait]
impl GuardModeSource for FixedGuardMode {
    async fn guard_mode(&self) -> GuardMode {
        self.mode.read().map(|m| *m).unwrap_or_default()
    }
}

#[async_trait]
impl GuardModeSource for ConfigStore {
    async fn guard_mode(&self) -> GuardMode {
        match self.load() {
            Ok(config) => config.guard.guard_mode,
            Err(e) => {
                warn!("[config_store] Failed to read guard mode, using default: {}", e);
                GuardMode::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> ConfigStore {
        let dir = std::env::temp_dir().join(format!("cleanchat_test_{}_{}", tag, uuid::Uuid::new_v4()));
        ConfigStore::new(dir)
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.guard.pass_max, 1.0);
        assert_eq!(config.guard.convert_min, 4.0);
        assert!(!config.guard.fail_open_on_convert_error);
        assert!(config.guard.fail_open_on_decision_error);
        assert_eq!(config.guard.debounce_ms, 350);
        assert_eq!(config.guard.cache_ttl_secs, 90);
        assert_eq!(config.guard.prefilter_weights, CategoryWeights::prefilter());
        assert_eq!(config.guard.enhanced_weights, CategoryWeights::enhanced());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"guard": {"passMax": 0.5, "guardMode": "warn"}}"#;
        let parsed: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.guard.pass_max, 0.5);
        assert_eq!(parsed.guard.guard_mode, GuardMode::Warn);
        assert_eq!(parsed.guard.convert_min, 4.0);
        assert_eq!(parsed.guard.enhanced_weights.strong, 4.0);
    }

    #[test]
    fn test_save_and_load_round_trip_with_backup() {
        let store = temp_store("config");
        let mut config = AppConfig::default();
        config.version = "1.0.0".to_string();
        store.save(&config).unwrap();

        config.guard.guard_mode = GuardMode::Warn;
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.version, "1.0.0");
        assert_eq!(loaded.guard.guard_mode, GuardMode::Warn);
        assert!(store.config_dir().join("backups").exists());

        let _ = fs::remove_dir_all(store.config_dir());
    }

    #[test]
    fn test_missing_files_load_as_empty() {
        let store = temp_store("missing");
        assert!(store.load_lists().unwrap().whitelist.is_empty());
        assert!(store.load_domain_rules().unwrap().is_empty());
    }

    #[test]
    fn test_proxy_active_url() {
        let proxy = ProxyConfig {
            enabled: true,
            http: Some("http://proxy:8080".to_string()),
            https: None,
        };
        assert_eq!(proxy.active_url().as_deref(), Some("http://proxy:8080"));

        let disabled = ProxyConfig { enabled: false, ..proxy };
        assert_eq!(disabled.active_url(), None);
    }

    #[tokio::test]
    async fn test_fixed_guard_mode_is_mutable() {
        let source = FixedGuardMode::new(GuardMode::Convert);
        assert_eq!(source.guard_mode().await, GuardMode::Convert);
        source.set(GuardMode::Warn);
        assert_eq!(source.guard_mode().await, GuardMode::Warn);
    }
}
