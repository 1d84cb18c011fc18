use crate::api::Capability;
use crate::handshake::TransportKind;
use crate::protocol::SUPPORTED_PROTOCOL_VERSIONS;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_START_TIMEOUT_MS: u64 = 10;
const MIN_WATCHDOG_INTERVAL_MS: u64 = 5;
const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 100;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HostSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub plugin_settings: PluginSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PluginSettings {
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_activate_timeout_ms")]
    pub activate_timeout_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window_ms")]
    pub restart_window_ms: u64,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_supported_protocol_versions")]
    pub supported_protocol_versions: Vec<u32>,
    #[serde(default = "default_allowed_capabilities")]
    pub allowed_capabilities: Vec<String>,
    #[serde(default)]
    pub plugin_states: BTreeMap<String, PluginState>,
    /// Raw per-plugin settings keyed by plugin id.
    #[serde(default)]
    pub plugins: BTreeMap<String, Map<String, Value>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginState {
    #[serde(default)]
    pub enable: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            directory: default_directory(),
            start_timeout_ms: default_start_timeout_ms(),
            activate_timeout_ms: default_activate_timeout_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_restarts: default_max_restarts(),
            restart_window_ms: default_restart_window_ms(),
            transport: default_transport(),
            supported_protocol_versions: default_supported_protocol_versions(),
            allowed_capabilities: default_allowed_capabilities(),
            plugin_states: BTreeMap::new(),
            plugins: BTreeMap::new(),
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            log_level: default_log_level(),
            plugin_settings: PluginSettings::default(),
        }
    }
}

impl PluginSettings {
    pub fn normalized_start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms.max(MIN_START_TIMEOUT_MS))
    }

    pub fn normalized_activate_timeout(&self) -> Duration {
        Duration::from_millis(self.activate_timeout_ms.max(MIN_START_TIMEOUT_MS))
    }

    pub fn normalized_watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(MIN_WATCHDOG_INTERVAL_MS))
    }

    pub fn normalized_health_check_interval(&self) -> Duration {
        Duration::from_millis(
            self.health_check_interval_ms
                .max(MIN_HEALTH_CHECK_INTERVAL_MS),
        )
    }

    pub fn normalized_max_restarts(&self) -> u32 {
        self.max_restarts.max(1)
    }

    pub fn normalized_restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms.max(1))
    }

    /// Falls back to tcp for unknown tags.
    pub fn normalized_transport(&self) -> TransportKind {
        TransportKind::from_tag(&self.transport).unwrap_or(TransportKind::Tcp)
    }

    /// Deduplicated, highest first. Empty falls back to the built-in set.
    pub fn normalized_protocol_versions(&self) -> Vec<u32> {
        let mut versions = self
            .supported_protocol_versions
            .iter()
            .copied()
            .filter(|v| *v > 0)
            .collect::<Vec<_>>();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions.dedup();
        if versions.is_empty() {
            return SUPPORTED_PROTOCOL_VERSIONS.to_vec();
        }
        versions
    }

    /// Unknown capability tags are ignored.
    pub fn normalized_allowed_capabilities(&self) -> Vec<Capability> {
        let mut caps = self
            .allowed_capabilities
            .iter()
            .filter_map(|tag| Capability::from_tag(tag))
            .collect::<Vec<_>>();
        caps.sort();
        caps.dedup();
        caps
    }

    pub fn is_plugin_enabled(&self, plugin_id: &str) -> bool {
        self.plugin_states
            .get(plugin_id)
            .map(|state| state.enable)
            .unwrap_or(false)
    }

    pub fn set_plugin_enabled(&mut self, plugin_id: &str, enable: bool) {
        self.plugin_states
            .entry(plugin_id.to_string())
            .or_default()
            .enable = enable;
    }

    pub fn plugin_values(&self, plugin_id: &str) -> Option<&Map<String, Value>> {
        self.plugins.get(plugin_id)
    }

    /// Resolves `directory` against `base` when it is relative.
    pub fn resolved_directory(&self, base: &Path) -> PathBuf {
        let dir = Path::new(self.directory.trim());
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base.join(dir)
        }
    }
}

impl HostSettings {
    pub fn merge_overlay(&self, overlay: &HostSettings) -> HostSettings {
        let mut merged = self.clone();
        merged.schema_version = self.schema_version.max(overlay.schema_version);

        if !overlay.log_level.trim().is_empty() {
            merged.log_level = overlay.log_level.clone();
        }

        let base = &mut merged.plugin_settings;
        let over = &overlay.plugin_settings;
        base.enable = over.enable;
        if !over.directory.trim().is_empty() {
            base.directory = over.directory.clone();
        }
        base.start_timeout_ms = over.start_timeout_ms;
        base.activate_timeout_ms = over.activate_timeout_ms;
        base.watchdog_interval_ms = over.watchdog_interval_ms;
        base.health_check_interval_ms = over.health_check_interval_ms;
        base.max_restarts = over.max_restarts;
        base.restart_window_ms = over.restart_window_ms;
        if !over.transport.trim().is_empty() {
            base.transport = over.transport.clone();
        }
        if !over.supported_protocol_versions.is_empty() {
            base.supported_protocol_versions = over.supported_protocol_versions.clone();
        }
        base.allowed_capabilities = over.allowed_capabilities.clone();

        for (id, state) in &over.plugin_states {
            base.plugin_states.insert(id.clone(), state.clone());
        }
        for (id, values) in &over.plugins {
            let entry = base.plugins.entry(id.clone()).or_default();
            for (key, value) in values {
                entry.insert(key.clone(), value.clone());
            }
        }

        merged
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join("plughost.json")
}

pub fn project_settings_path(project_root: &Path) -> PathBuf {
    project_root.join(".plughost").join("plughost.json")
}

pub fn load_settings(config_dir: &Path) -> Result<HostSettings> {
    load_settings_from_path(&settings_path(config_dir))
}

pub fn load_project_settings(project_root: &Path) -> Result<Option<HostSettings>> {
    let path = project_settings_path(project_root);
    if !path.exists() {
        return Ok(None);
    }
    let settings = load_settings_from_path(&path)?;
    Ok(Some(settings))
}

pub fn load_effective_settings(
    config_dir: &Path,
    project_root: Option<&Path>,
) -> Result<HostSettings> {
    let user = load_settings(config_dir).unwrap_or_default();
    if let Some(project_root) = project_root {
        if let Some(project) = load_project_settings(project_root)? {
            return Ok(user.merge_overlay(&project));
        }
    }
    Ok(user)
}

pub fn save_settings(config_dir: &Path, settings: &HostSettings) -> Result<()> {
    save_settings_to_path(&settings_path(config_dir), settings)
}

pub fn save_project_settings(project_root: &Path, settings: &HostSettings) -> Result<()> {
    save_settings_to_path(&project_settings_path(project_root), settings)
}

fn load_settings_from_path(path: &Path) -> Result<HostSettings> {
    if !path.exists() {
        return Ok(HostSettings::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let settings: HostSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;
    Ok(settings)
}

fn save_settings_to_path(path: &Path, settings: &HostSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("write settings file: {}", path.display()))?;
    Ok(())
}

const fn default_schema_version() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_enable() -> bool {
    true
}

fn default_directory() -> String {
    "plugins".to_string()
}

const fn default_start_timeout_ms() -> u64 {
    10_000
}

const fn default_activate_timeout_ms() -> u64 {
    30_000
}

const fn default_watchdog_interval_ms() -> u64 {
    50
}

const fn default_health_check_interval_ms() -> u64 {
    30_000
}

const fn default_max_restarts() -> u32 {
    3
}

const fn default_restart_window_ms() -> u64 {
    3_600_000
}

fn default_transport() -> String {
    TransportKind::Tcp.as_tag().to_string()
}

fn default_supported_protocol_versions() -> Vec<u32> {
    SUPPORTED_PROTOCOL_VERSIONS.to_vec()
}

fn default_allowed_capabilities() -> Vec<String> {
    [
        Capability::LookupUser,
        Capability::LookupChannel,
        Capability::SendNotification,
        Capability::KvStore,
    ]
    .iter()
    .map(|cap| cap.as_tag().to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("missing")).expect("load defaults");
        assert_eq!(settings, HostSettings::default());
        assert_eq!(settings.plugin_settings.start_timeout_ms, 10_000);
        assert_eq!(settings.plugin_settings.max_restarts, 3);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            settings_path(dir.path()),
            r#"{"plugin_settings":{"start_timeout_ms":250,"transport":"unix"}}"#,
        )
        .expect("write settings");

        let settings = load_settings(dir.path()).expect("load");
        assert_eq!(settings.plugin_settings.start_timeout_ms, 250);
        assert_eq!(settings.plugin_settings.normalized_transport(), TransportKind::Unix);
        assert_eq!(settings.plugin_settings.activate_timeout_ms, 30_000);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = HostSettings::default();
        settings.log_level = "debug".to_string();
        settings.plugin_settings.set_plugin_enabled("com.example.a", true);
        settings.plugin_settings.plugins.insert(
            "com.example.a".to_string(),
            json!({ "Greeting": "hi" }).as_object().cloned().unwrap(),
        );

        save_settings(dir.path(), &settings).expect("save settings");
        let loaded = load_settings(dir.path()).expect("load settings");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn unparsable_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(settings_path(dir.path()), "{nope").expect("write settings");
        let err = load_settings(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parse settings file"));
    }

    #[test]
    fn normalized_values_are_clamped() {
        let settings = PluginSettings {
            start_timeout_ms: 0,
            watchdog_interval_ms: 0,
            max_restarts: 0,
            transport: "carrier-pigeon".to_string(),
            supported_protocol_versions: vec![1, 0, 2, 1],
            allowed_capabilities: vec!["kv_store".to_string(), "root".to_string()],
            ..PluginSettings::default()
        };

        assert_eq!(settings.normalized_start_timeout(), Duration::from_millis(10));
        assert_eq!(settings.normalized_watchdog_interval(), Duration::from_millis(5));
        assert_eq!(settings.normalized_max_restarts(), 1);
        assert_eq!(settings.normalized_transport(), TransportKind::Tcp);
        assert_eq!(settings.normalized_protocol_versions(), vec![2, 1]);
        assert_eq!(
            settings.normalized_allowed_capabilities(),
            vec![Capability::KvStore]
        );

        let empty = PluginSettings {
            supported_protocol_versions: Vec::new(),
            ..PluginSettings::default()
        };
        assert_eq!(
            empty.normalized_protocol_versions(),
            SUPPORTED_PROTOCOL_VERSIONS.to_vec()
        );
    }

    #[test]
    fn plugin_states_default_to_disabled() {
        let mut settings = PluginSettings::default();
        assert!(!settings.is_plugin_enabled("com.example.a"));
        settings.set_plugin_enabled("com.example.a", true);
        assert!(settings.is_plugin_enabled("com.example.a"));
    }

    #[test]
    fn layered_settings_project_overrides_user() {
        let user_dir = tempfile::tempdir().expect("user dir");
        let project_dir = tempfile::tempdir().expect("project dir");

        let mut user = HostSettings::default();
        user.plugin_settings.set_plugin_enabled("com.example.a", true);
        user.plugin_settings.plugins.insert(
            "com.example.a".to_string(),
            json!({ "greeting": "hi", "color": "red" })
                .as_object()
                .cloned()
                .unwrap(),
        );
        save_settings(user_dir.path(), &user).expect("save user settings");

        let mut project = HostSettings::default();
        project.log_level = "trace".to_string();
        project.plugin_settings.start_timeout_ms = 500;
        project.plugin_settings.set_plugin_enabled("com.example.b", true);
        project.plugin_settings.plugins.insert(
            "com.example.a".to_string(),
            json!({ "color": "blue" }).as_object().cloned().unwrap(),
        );
        save_project_settings(project_dir.path(), &project).expect("save project settings");

        let effective = load_effective_settings(user_dir.path(), Some(project_dir.path()))
            .expect("load effective settings");
        let plugins = &effective.plugin_settings;
        assert_eq!(effective.log_level, "trace");
        assert_eq!(plugins.start_timeout_ms, 500);
        assert!(plugins.is_plugin_enabled("com.example.a"));
        assert!(plugins.is_plugin_enabled("com.example.b"));
        assert_eq!(
            plugins.plugin_values("com.example.a").cloned(),
            json!({ "greeting": "hi", "color": "blue" }).as_object().cloned()
        );
    }

    #[test]
    fn resolved_directory_joins_relative_paths() {
        let settings = PluginSettings::default();
        assert_eq!(
            settings.resolved_directory(Path::new("/srv/host")),
            PathBuf::from("/srv/host/plugins")
        );
    }
}
