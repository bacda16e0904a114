//! Engine settings.
//!
//! Defaults come from the environment so the runner and embedding hosts can
//! flip behaviour without code changes:
//!
//! * `BPMN_ENGINE_STRICT` - fail flow conditions that reference unknown
//!   variables instead of evaluating them as false.
//! * `BPMN_ENGINE_ENABLE_DUMMY_SERVICE` - complete service tasks whose service
//!   is not registered instead of failing them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub enable_dummy_service: bool,
    /// Anything else; passed through to called processes untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            strict: env_flag("BPMN_ENGINE_STRICT"),
            enable_dummy_service: env_flag("BPMN_ENGINE_ENABLE_DUMMY_SERVICE"),
            extra: Map::new(),
        }
    }
}

impl EngineSettings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn yaml_settings_keep_unknown_keys() {
        let settings = EngineSettings::from_yaml(
            r#"
strict: true
tenant: acme
"#,
        )
        .unwrap();
        assert!(settings.strict);
        assert!(!settings.enable_dummy_service);
        assert_eq!(settings.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn set_overrides_extra_key() {
        let mut settings = EngineSettings::from_yaml("{}").unwrap();
        settings.set("tenant", json!("a"));
        settings.set("tenant", json!("b"));
        assert_eq!(settings.get("tenant"), Some(&json!("b")));
    }
}
