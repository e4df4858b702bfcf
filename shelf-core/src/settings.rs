//! The settings layer (spec.md §4.2): a process-wide typed configuration
//! snapshot with DB -> file -> env fallback, modeled on the teacher's
//! `Config::load`/`from_config_file`/`from_env` in `bae-core/src/config.rs`.

use crate::models::{Setting, SettingType};
use crate::store::secrets::{SecretError, SecretKey};
use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Typed application configuration (spec.md §4.2). Field names match the
/// Setting keys they are loaded from.
#[derive(Debug, Clone)]
pub struct Config {
    pub library_root: PathBuf,
    pub storage_backend: String,
    pub folder_naming_pattern: String,
    pub file_naming_pattern: String,
    pub supported_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub exclusion_marker_name: String,
    pub concurrent_scans: u32,
    pub default_layout_strategy: String,
    pub create_backups: bool,
    pub write_back_metadata: bool,
    pub operation_timeout_minutes: u32,
    pub operation_retention_hours: u32,
    pub openai_api_key: Option<String>,
    pub audible_api_key: Option<String>,
    pub openlibrary_dump_dir: PathBuf,
}

fn default_true() -> bool {
    true
}

/// Non-secret settings mirrored to `config.yaml` next to the database
/// (spec.md §4.2 step 3, the "lost encryption key" recovery path), plus a
/// plaintext mirror of secrets when the user has opted in (spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigYaml {
    pub library_root: Option<String>,
    #[serde(default)]
    pub storage_backend: Option<String>,
    #[serde(default)]
    pub folder_naming_pattern: Option<String>,
    #[serde(default)]
    pub file_naming_pattern: Option<String>,
    #[serde(default)]
    pub supported_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub exclusion_marker_name: Option<String>,
    #[serde(default)]
    pub concurrent_scans: Option<u32>,
    #[serde(default)]
    pub default_layout_strategy: Option<String>,
    #[serde(default = "default_true")]
    pub create_backups: bool,
    #[serde(default)]
    pub write_back_metadata: bool,
    #[serde(default)]
    pub operation_timeout_minutes: Option<u32>,
    #[serde(default)]
    pub operation_retention_hours: Option<u32>,
    /// Plaintext mirror of the OpenAI key, only ever written if the user
    /// enables a plaintext-secret mirror (spec.md §6.3); otherwise absent.
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub audible_api_key: Option<String>,
    #[serde(default)]
    pub openlibrary_dump_dir: Option<String>,
}

const SECRET_KEYS: &[&str] = &["openai_api_key", "audible_api_key"];

fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS.contains(&key)
}

impl Config {
    fn defaults() -> Self {
        Config {
            library_root: PathBuf::from("/data/library"),
            storage_backend: "lsm".to_string(),
            folder_naming_pattern: "{author}/{title}".to_string(),
            file_naming_pattern: "{title}".to_string(),
            supported_extensions: vec![
                "mp3".into(),
                "m4a".into(),
                "m4b".into(),
                "flac".into(),
                "ogg".into(),
                "wav".into(),
                "aac".into(),
                "opus".into(),
            ],
            exclude_patterns: Vec::new(),
            exclusion_marker_name: ".shelf-exclude".to_string(),
            concurrent_scans: 4,
            default_layout_strategy: "auto".to_string(),
            create_backups: true,
            write_back_metadata: false,
            operation_timeout_minutes: 60,
            operation_retention_hours: 24,
            openai_api_key: None,
            audible_api_key: None,
            openlibrary_dump_dir: PathBuf::from("/data/library/.openlibrary"),
        }
    }

    /// Derives dependent defaults that depend on another already-loaded
    /// value (spec.md §4.2 step 5), e.g. the Open Library dump directory
    /// defaulting to a subfolder of the library root.
    fn derive_dependent_defaults(&mut self, explicit_dump_dir: bool) {
        if !explicit_dump_dir {
            self.openlibrary_dump_dir = self.library_root.join(".openlibrary");
        }
    }
}

/// Owns the process-wide config snapshot plus the machinery to (re)load and
/// persist it (spec.md §4.2).
pub struct Settings {
    store: Arc<dyn Store>,
    secret_key: SecretKey,
    yaml_path: PathBuf,
    config: std::sync::RwLock<Arc<Config>>,
}

impl Settings {
    /// Loads settings at startup, following the fixed order in spec.md
    /// §4.2: defaults -> Store -> YAML fallback -> env overrides -> derived
    /// defaults.
    pub async fn load(
        store: Arc<dyn Store>,
        secret_key: SecretKey,
        yaml_path: PathBuf,
    ) -> Result<Self, SettingsError> {
        let config = Self::load_snapshot(&store, &secret_key, &yaml_path).await?;
        Ok(Settings {
            store,
            secret_key,
            yaml_path,
            config: std::sync::RwLock::new(Arc::new(config)),
        })
    }

    /// Returns the config snapshot in effect when this handle was created or
    /// last reloaded. An in-flight operation holding a clone of the `Arc`
    /// keeps seeing this snapshot even if `save` publishes a new one
    /// concurrently (spec.md §5 "Settings reads observe a consistent
    /// snapshot").
    pub fn current(&self) -> Arc<Config> {
        self.config.read().unwrap().clone()
    }

    async fn load_snapshot(
        store: &Arc<dyn Store>,
        secret_key: &SecretKey,
        yaml_path: &Path,
    ) -> Result<Config, SettingsError> {
        // Step 1: built-in defaults.
        let mut config = Config::defaults();

        // Step 2: read every Setting from the Store, skipping undecryptable
        // secrets with a warning rather than failing the whole load.
        let mut have = std::collections::HashSet::new();
        for setting in store.list_settings().await? {
            if setting.is_secret {
                match secret_key.decrypt(&setting.value) {
                    Ok(plain) => {
                        apply_value(&mut config, &setting.key, &plain, setting.setting_type);
                        have.insert(setting.key.clone());
                    }
                    Err(e) => {
                        warn!(
                            "settings: dropping undecryptable secret '{}': {e}",
                            setting.key
                        );
                    }
                }
            } else {
                apply_value(&mut config, &setting.key, &setting.value, setting.setting_type);
                have.insert(setting.key.clone());
            }
        }

        // Step 3: YAML fallback for any recognised key still empty/false --
        // the recovery path for a lost encryption key.
        let yaml = read_yaml(yaml_path);
        let mut explicit_dump_dir = have.contains("openlibrary_dump_dir");
        if let Some(yaml) = &yaml {
            fill_from_yaml(&mut config, yaml, &have);
            if yaml.openlibrary_dump_dir.is_some() {
                explicit_dump_dir = true;
            }
        }

        // Step 4: env overrides, applied only when non-empty.
        apply_env_overrides(&mut config);

        // Step 5: derived defaults.
        config.derive_dependent_defaults(explicit_dump_dir);

        Ok(config)
    }

    /// Reloads from the Store (e.g. after an external writer touched a
    /// setting) and publishes a new snapshot.
    pub async fn reload(&self) -> Result<(), SettingsError> {
        let config = Self::load_snapshot(&self.store, &self.secret_key, &self.yaml_path).await?;
        *self.config.write().unwrap() = Arc::new(config);
        Ok(())
    }

    /// Persists every recognised key to the Store, preserving an existing
    /// non-empty encrypted secret when the in-memory value is empty
    /// (spec.md §4.2 "Save"), then mirrors the non-secret subset (plus any
    /// opted-in secret mirror) to `config.yaml` for cold-start recovery.
    pub async fn save(&self, new_config: Config) -> Result<(), SettingsError> {
        for (key, value, setting_type) in serialise_fields(&new_config) {
            let is_secret = is_secret_key(&key);
            let stored_value = if is_secret {
                if value.is_empty() {
                    // Preserve whatever the Store already holds rather than
                    // overwriting it with an empty in-memory value.
                    if let Some(existing) = self.store.get_setting(&key).await? {
                        if !existing.value.is_empty() {
                            info!("settings: preserving existing non-empty secret '{key}'");
                            continue;
                        }
                    }
                    value
                } else {
                    self.secret_key.encrypt(&value).map_err(secret_err)?
                }
            } else {
                value
            };

            self.store
                .put_setting(Setting {
                    key,
                    value: stored_value,
                    setting_type,
                    is_secret,
                    updated_at: chrono::Utc::now(),
                })
                .await?;
        }

        *self.config.write().unwrap() = Arc::new(new_config.clone());

        if let Err(e) = write_yaml(&self.yaml_path, &new_config) {
            // A file-write failure after a successful DB write is logged but
            // not reported to the caller (spec.md §4.2 "Errors").
            warn!("settings: failed to mirror config.yaml: {e}");
        }

        Ok(())
    }

    /// A typed single-key read, alongside the bulk `current`/`save` path
    /// (SPEC_FULL.md §11).
    pub async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let Some(setting) = self.store.get_setting(key).await? else {
            return Ok(None);
        };
        if setting.is_secret {
            match self.secret_key.decrypt(&setting.value) {
                Ok(plain) => Ok(Some(plain)),
                Err(_) => Ok(None),
            }
        } else {
            Ok(Some(setting.value))
        }
    }

    /// A typed single-key write, alongside the bulk `current`/`save` path
    /// (SPEC_FULL.md §11).
    pub async fn set(&self, key: &str, value: &str, setting_type: SettingType) -> Result<(), SettingsError> {
        let is_secret = is_secret_key(key);
        let stored_value = if is_secret {
            self.secret_key.encrypt(value).map_err(secret_err)?
        } else {
            value.to_string()
        };
        self.store
            .put_setting(Setting {
                key: key.to_string(),
                value: stored_value,
                setting_type,
                is_secret,
                updated_at: chrono::Utc::now(),
            })
            .await?;
        self.reload().await
    }
}

fn secret_err(e: SecretError) -> SettingsError {
    SettingsError::Serialization(e.to_string())
}

fn apply_value(config: &mut Config, key: &str, value: &str, setting_type: SettingType) {
    match (key, setting_type) {
        ("library_root", _) => config.library_root = PathBuf::from(value),
        ("storage_backend", _) => config.storage_backend = value.to_string(),
        ("folder_naming_pattern", _) => config.folder_naming_pattern = value.to_string(),
        ("file_naming_pattern", _) => config.file_naming_pattern = value.to_string(),
        ("supported_extensions", SettingType::Json) => {
            if let Ok(v) = serde_json::from_str(value) {
                config.supported_extensions = v;
            }
        }
        ("exclude_patterns", SettingType::Json) => {
            if let Ok(v) = serde_json::from_str(value) {
                config.exclude_patterns = v;
            }
        }
        ("exclusion_marker_name", _) => config.exclusion_marker_name = value.to_string(),
        ("concurrent_scans", _) => {
            if let Ok(v) = value.parse() {
                config.concurrent_scans = v;
            }
        }
        ("default_layout_strategy", _) => config.default_layout_strategy = value.to_string(),
        ("create_backups", _) => config.create_backups = value == "true",
        ("write_back_metadata", _) => config.write_back_metadata = value == "true",
        ("operation_timeout_minutes", _) => {
            if let Ok(v) = value.parse() {
                config.operation_timeout_minutes = v;
            }
        }
        ("operation_retention_hours", _) => {
            if let Ok(v) = value.parse() {
                config.operation_retention_hours = v;
            }
        }
        ("openai_api_key", _) => config.openai_api_key = Some(value.to_string()),
        ("audible_api_key", _) => config.audible_api_key = Some(value.to_string()),
        ("openlibrary_dump_dir", _) => config.openlibrary_dump_dir = PathBuf::from(value),
        _ => {}
    }
}

fn serialise_fields(config: &Config) -> Vec<(String, String, SettingType)> {
    vec![
        (
            "library_root".into(),
            config.library_root.display().to_string(),
            SettingType::String,
        ),
        ("storage_backend".into(), config.storage_backend.clone(), SettingType::String),
        (
            "folder_naming_pattern".into(),
            config.folder_naming_pattern.clone(),
            SettingType::String,
        ),
        (
            "file_naming_pattern".into(),
            config.file_naming_pattern.clone(),
            SettingType::String,
        ),
        (
            "supported_extensions".into(),
            serde_json::to_string(&config.supported_extensions).unwrap(),
            SettingType::Json,
        ),
        (
            "exclude_patterns".into(),
            serde_json::to_string(&config.exclude_patterns).unwrap(),
            SettingType::Json,
        ),
        (
            "exclusion_marker_name".into(),
            config.exclusion_marker_name.clone(),
            SettingType::String,
        ),
        (
            "concurrent_scans".into(),
            config.concurrent_scans.to_string(),
            SettingType::Int,
        ),
        (
            "default_layout_strategy".into(),
            config.default_layout_strategy.clone(),
            SettingType::String,
        ),
        ("create_backups".into(), config.create_backups.to_string(), SettingType::Bool),
        (
            "write_back_metadata".into(),
            config.write_back_metadata.to_string(),
            SettingType::Bool,
        ),
        (
            "operation_timeout_minutes".into(),
            config.operation_timeout_minutes.to_string(),
            SettingType::Int,
        ),
        (
            "operation_retention_hours".into(),
            config.operation_retention_hours.to_string(),
            SettingType::Int,
        ),
        (
            "openai_api_key".into(),
            config.openai_api_key.clone().unwrap_or_default(),
            SettingType::String,
        ),
        (
            "audible_api_key".into(),
            config.audible_api_key.clone().unwrap_or_default(),
            SettingType::String,
        ),
        (
            "openlibrary_dump_dir".into(),
            config.openlibrary_dump_dir.display().to_string(),
            SettingType::String,
        ),
    ]
}

fn fill_from_yaml(config: &mut Config, yaml: &ConfigYaml, have: &std::collections::HashSet<String>) {
    macro_rules! fill_str {
        ($field:ident, $yaml_field:expr) => {
            if !have.contains(stringify!($field)) {
                if let Some(v) = &$yaml_field {
                    if !v.is_empty() {
                        config.$field = v.clone();
                    }
                }
            }
        };
    }
    if !have.contains("library_root") {
        if let Some(v) = &yaml.library_root {
            config.library_root = PathBuf::from(v);
        }
    }
    fill_str!(storage_backend, yaml.storage_backend);
    fill_str!(folder_naming_pattern, yaml.folder_naming_pattern);
    fill_str!(file_naming_pattern, yaml.file_naming_pattern);
    fill_str!(exclusion_marker_name, yaml.exclusion_marker_name);
    fill_str!(default_layout_strategy, yaml.default_layout_strategy);
    if !have.contains("supported_extensions") {
        if let Some(v) = &yaml.supported_extensions {
            config.supported_extensions = v.clone();
        }
    }
    if !have.contains("exclude_patterns") {
        if let Some(v) = &yaml.exclude_patterns {
            config.exclude_patterns = v.clone();
        }
    }
    if !have.contains("concurrent_scans") {
        if let Some(v) = yaml.concurrent_scans {
            config.concurrent_scans = v;
        }
    }
    if !have.contains("operation_timeout_minutes") {
        if let Some(v) = yaml.operation_timeout_minutes {
            config.operation_timeout_minutes = v;
        }
    }
    if !have.contains("operation_retention_hours") {
        if let Some(v) = yaml.operation_retention_hours {
            config.operation_retention_hours = v;
        }
    }
    if !have.contains("create_backups") && !config.create_backups {
        config.create_backups = yaml.create_backups;
    }
    if !have.contains("write_back_metadata") && !config.write_back_metadata {
        config.write_back_metadata = yaml.write_back_metadata;
    }
    if !have.contains("openai_api_key") && config.openai_api_key.is_none() {
        config.openai_api_key = yaml.openai_api_key.clone();
    }
    if !have.contains("audible_api_key") && config.audible_api_key.is_none() {
        config.audible_api_key = yaml.audible_api_key.clone();
    }
    if !have.contains("openlibrary_dump_dir") {
        if let Some(v) = &yaml.openlibrary_dump_dir {
            config.openlibrary_dump_dir = PathBuf::from(v);
        }
    }
}

fn apply_env_overrides(config: &mut Config) {
    macro_rules! env_str {
        ($var:expr, $target:expr) => {
            if let Some(v) = std::env::var($var).ok().filter(|s| !s.is_empty()) {
                $target = v;
            }
        };
    }
    if let Some(v) = std::env::var("AUDIOBOOK_LIBRARY_ROOT").ok().filter(|s| !s.is_empty()) {
        config.library_root = PathBuf::from(v);
    }
    env_str!("AUDIOBOOK_STORAGE_BACKEND", config.storage_backend);
    env_str!("AUDIOBOOK_FOLDER_NAMING_PATTERN", config.folder_naming_pattern);
    env_str!("AUDIOBOOK_FILE_NAMING_PATTERN", config.file_naming_pattern);
    env_str!("AUDIOBOOK_DEFAULT_LAYOUT_STRATEGY", config.default_layout_strategy);
    if let Some(v) = std::env::var("AUDIOBOOK_CONCURRENT_SCANS")
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
    {
        config.concurrent_scans = v;
    }
    if let Some(v) = std::env::var("AUDIOBOOK_OPENAI_API_KEY").ok().filter(|s| !s.is_empty()) {
        config.openai_api_key = Some(v);
    }
    if let Some(v) = std::env::var("AUDIOBOOK_AUDIBLE_API_KEY").ok().filter(|s| !s.is_empty()) {
        config.audible_api_key = Some(v);
    }
}

fn read_yaml(path: &Path) -> Option<ConfigYaml> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&content).ok()
}

fn write_yaml(path: &Path, config: &Config) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = ConfigYaml {
        library_root: Some(config.library_root.display().to_string()),
        storage_backend: Some(config.storage_backend.clone()),
        folder_naming_pattern: Some(config.folder_naming_pattern.clone()),
        file_naming_pattern: Some(config.file_naming_pattern.clone()),
        supported_extensions: Some(config.supported_extensions.clone()),
        exclude_patterns: Some(config.exclude_patterns.clone()),
        exclusion_marker_name: Some(config.exclusion_marker_name.clone()),
        concurrent_scans: Some(config.concurrent_scans),
        default_layout_strategy: Some(config.default_layout_strategy.clone()),
        create_backups: config.create_backups,
        write_back_metadata: config.write_back_metadata,
        operation_timeout_minutes: Some(config.operation_timeout_minutes),
        operation_retention_hours: Some(config.operation_retention_hours),
        openai_api_key: None,
        audible_api_key: None,
        openlibrary_dump_dir: Some(config.openlibrary_dump_dir.display().to_string()),
    };
    let serialised =
        serde_yaml::to_string(&yaml).map_err(|e| SettingsError::Serialization(e.to_string()))?;
    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, serialised)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LsmStore;

    fn key() -> SecretKey {
        let dir = tempfile::tempdir().unwrap();
        SecretKey::load_or_create(&dir.keep().join("secret.key")).unwrap()
    }

    async fn store() -> Arc<dyn Store> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(LsmStore::open(dir.keep().as_path()).unwrap())
    }

    #[tokio::test]
    async fn loads_built_in_defaults_with_empty_store() {
        let settings = Settings::load(
            store().await,
            key(),
            tempfile::tempdir().unwrap().keep().join("config.yaml"),
        )
        .await
        .unwrap();
        let config = settings.current();
        assert_eq!(config.concurrent_scans, 4);
        assert_eq!(config.default_layout_strategy, "auto");
    }

    #[tokio::test]
    async fn save_then_load_round_trips_non_secret_fields() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.keep().join("config.yaml");
        let settings = Settings::load(store.clone(), key(), yaml_path.clone())
            .await
            .unwrap();

        let mut new_config = (*settings.current()).clone();
        new_config.concurrent_scans = 8;
        new_config.library_root = PathBuf::from("/srv/audiobooks");
        settings.save(new_config).await.unwrap();

        let reloaded = Settings::load(store, key(), yaml_path).await.unwrap();
        assert_eq!(reloaded.current().concurrent_scans, 8);
        assert_eq!(reloaded.current().library_root, PathBuf::from("/srv/audiobooks"));
    }

    #[tokio::test]
    async fn secret_roundtrips_through_encryption() {
        let store = store().await;
        let secret_key = key();
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.keep().join("config.yaml");
        let settings = Settings::load(store.clone(), secret_key, yaml_path.clone())
            .await
            .unwrap();

        let mut new_config = (*settings.current()).clone();
        new_config.openai_api_key = Some("sk-abc123".to_string());
        settings.save(new_config).await.unwrap();

        assert_eq!(
            settings.get("openai_api_key").await.unwrap(),
            Some("sk-abc123".to_string())
        );

        let stored = store.get_setting("openai_api_key").await.unwrap().unwrap();
        assert!(stored.is_secret);
        assert_ne!(stored.value, "sk-abc123");
    }

    #[tokio::test]
    async fn undecryptable_secret_falls_back_to_yaml() {
        // Scenario 5: pre-populate DB with a secret encrypted under a
        // now-deleted key, and a plaintext fallback in config.yaml.
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.keep().join("config.yaml");

        let old_key = key();
        store
            .put_setting(Setting {
                key: "openai_api_key".into(),
                value: old_key.encrypt("sk-original").unwrap(),
                setting_type: SettingType::String,
                is_secret: true,
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        std::fs::write(&yaml_path, "library_root: /data\nopenai_api_key: sk-fallback\n").unwrap();

        // A *different* key is now the process key -- decryption must fail.
        let new_key = key();
        let settings = Settings::load(store.clone(), new_key, yaml_path).await.unwrap();
        assert_eq!(settings.current().openai_api_key, Some("sk-fallback".to_string()));
    }
}
