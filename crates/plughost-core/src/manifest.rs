use crate::api::Capability;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MANIFEST_FILE_NAME: &str = "plugin.json";

const MIN_ID_LENGTH: usize = 3;
const MAX_ID_LENGTH: usize = 190;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub server: Option<ServerManifest>,
    #[serde(default)]
    pub settings_schema: Option<SettingsSchema>,
    /// Host API capability tags the plugin asks for.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub min_protocol_version: Option<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerManifest {
    #[serde(default)]
    pub executable: Option<String>,
    /// Executables keyed by `<os>-<arch>`, e.g. `linux-amd64`.
    #[serde(default)]
    pub executables: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsSchema {
    #[serde(default)]
    pub settings: Vec<SettingDecl>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SettingDecl {
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub default: Option<Value>,
}

impl Manifest {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let manifest: Manifest =
            serde_json::from_str(raw).map_err(|err| format!("invalid manifest json: {err}"))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_plugin_id(&self.id) {
            return Err(format!("invalid plugin id: {:?}", self.id));
        }

        if let Some(server) = &self.server {
            if server.executable_for(&platform_key()).is_none() {
                return Err(format!(
                    "no server executable declared for platform {}",
                    platform_key()
                ));
            }
        }

        if let Some(unknown) = self
            .capabilities
            .iter()
            .find(|tag| Capability::from_tag(tag).is_none())
        {
            return Err(format!("unknown capability: {unknown}"));
        }

        if let Some(schema) = &self.settings_schema {
            if let Some(decl) = schema.settings.iter().find(|s| s.key.trim().is_empty()) {
                return Err(format!(
                    "settings schema entry without key: {:?}",
                    decl.display_name
                ));
            }
        }

        Ok(())
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// A manifest without a `server` section describes a UI-only bundle that
    /// is never spawned.
    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn executable_for_platform(&self) -> Option<&str> {
        self.server
            .as_ref()
            .and_then(|server| server.executable_for(&platform_key()))
    }

    pub fn requested_capabilities(&self) -> Vec<Capability> {
        self.capabilities
            .iter()
            .filter_map(|tag| Capability::from_tag(tag))
            .collect()
    }

    /// Builds the configuration snapshot for this plugin out of the host-wide
    /// settings stored under its id. Keys are lowercased; declared defaults
    /// fill in missing keys and undeclared keys are dropped.
    pub fn filter_settings(&self, host_values: Option<&Map<String, Value>>) -> Map<String, Value> {
        let lowered: Map<String, Value> = host_values
            .map(|values| {
                values
                    .iter()
                    .map(|(key, value)| (key.to_lowercase(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let Some(schema) = &self.settings_schema else {
            return lowered;
        };

        let mut out = Map::new();
        for decl in &schema.settings {
            let key = decl.key.to_lowercase();
            if let Some(value) = lowered.get(&key) {
                out.insert(key, value.clone());
            } else if let Some(default) = &decl.default {
                out.insert(key, default.clone());
            }
        }
        out
    }
}

impl ServerManifest {
    fn executable_for(&self, platform: &str) -> Option<&str> {
        self.executables
            .get(platform)
            .or(self.executable.as_ref())
            .map(String::as_str)
            .filter(|path| !path.trim().is_empty())
    }
}

pub fn is_valid_plugin_id(id: &str) -> bool {
    if id.len() < MIN_ID_LENGTH || id.len() > MAX_ID_LENGTH {
        return false;
    }
    if id.starts_with('.') {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Platform key in the `<os>-<arch>` form used by `server.executables`.
pub fn platform_key() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{os}-{arch}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugin_id_rules() {
        assert!(is_valid_plugin_id("com.example.foo"));
        assert!(is_valid_plugin_id("foo_bar-1"));
        assert!(!is_valid_plugin_id("fo"));
        assert!(!is_valid_plugin_id(""));
        assert!(!is_valid_plugin_id("../etc"));
        assert!(!is_valid_plugin_id("foo/bar"));
        assert!(!is_valid_plugin_id("foo bar"));
        assert!(!is_valid_plugin_id(".hidden"));
        assert!(!is_valid_plugin_id(&"a".repeat(191)));
    }

    #[test]
    fn parse_minimal_manifest_without_server() {
        let manifest = Manifest::parse(r#"{"id":"webapp.only"}"#).expect("parse");
        assert!(!manifest.has_server());
        assert_eq!(manifest.display_name(), "webapp.only");
        assert!(manifest.executable_for_platform().is_none());
    }

    #[test]
    fn parse_rejects_empty_and_bad_id() {
        assert!(Manifest::parse("").is_err());
        assert!(Manifest::parse("{}").is_err());
        assert!(Manifest::parse(r#"{"id":""}"#).is_err());
        assert!(Manifest::parse(r#"{"id":"a/../b"}"#).is_err());
    }

    #[test]
    fn parse_rejects_server_without_platform_executable() {
        let raw = r#"{"id":"foo.bar","server":{"executables":{"plan9-mips":"server/p"}}}"#;
        assert!(Manifest::parse(raw).is_err());
    }

    #[test]
    fn platform_executable_overrides_generic_one() {
        let mut executables = Map::new();
        executables.insert(platform_key(), json!("server/specific"));
        let raw = json!({
            "id": "foo.bar",
            "server": {
                "executable": "server/generic",
                "executables": executables
            }
        })
        .to_string();
        let manifest = Manifest::parse(&raw).expect("parse");
        assert_eq!(manifest.executable_for_platform(), Some("server/specific"));
    }

    #[test]
    fn parse_rejects_unknown_capability() {
        let raw = r#"{"id":"foo.bar","capabilities":["root_shell"]}"#;
        assert!(Manifest::parse(raw).unwrap_err().contains("root_shell"));
    }

    #[test]
    fn filter_settings_applies_schema_and_defaults() {
        let manifest: Manifest = serde_json::from_value(json!({
            "id": "foo.bar",
            "settings_schema": {
                "settings": [
                    { "key": "Greeting", "type": "text", "default": "hello" },
                    { "key": "Enabled", "type": "bool" }
                ]
            }
        }))
        .expect("manifest");

        let host = json!({ "enabled": true, "secret": "drop me" });
        let filtered = manifest.filter_settings(host.as_object());

        assert_eq!(filtered.get("greeting"), Some(&json!("hello")));
        assert_eq!(filtered.get("enabled"), Some(&json!(true)));
        assert!(filtered.get("secret").is_none());
    }

    #[test]
    fn filter_settings_without_schema_passes_everything() {
        let manifest = Manifest::parse(r#"{"id":"foo.bar"}"#).expect("parse");
        let host = json!({ "Key": 1 });
        let filtered = manifest.filter_settings(host.as_object());
        assert_eq!(filtered.get("key"), Some(&json!(1)));
        assert!(manifest.filter_settings(None).is_empty());
    }
}
