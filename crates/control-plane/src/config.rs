use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::static_config::{StaticConfigItem, STATIC_CONFIG_TABLE};

/// Flattened gateway configuration keyed by dotted paths (`session.sliding_window_seconds`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    values: HashMap<String, String>,
}

impl SystemConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_string(&self, key: &str) -> String {
        self.get(key)
            .map(str::to_string)
            .or_else(|| default_value(key))
            .unwrap_or_default()
    }

    pub fn get_number(&self, key: &str) -> i64 {
        self.get(key)
            .and_then(|value| value.parse::<i64>().ok())
            .or_else(|| default_value(key).and_then(|value| value.parse::<i64>().ok()))
            .unwrap_or_default()
    }

    /// Reads a strictly positive number, rejecting zero and negatives.
    pub fn get_positive(&self, key: &str) -> Result<u64, ConfigError> {
        let value = self.get_number(key);
        if value <= 0 {
            return Err(ConfigError::InvalidValue(
                key.to_string(),
                format!("expected a positive number, got {value}"),
            ));
        }
        Ok(value as u64)
    }

    pub fn get_seconds(&self, key: &str) -> Result<Duration, ConfigError> {
        self.get_positive(key).map(Duration::from_secs)
    }

    pub fn get_millis(&self, key: &str) -> Result<Duration, ConfigError> {
        self.get_positive(key).map(Duration::from_millis)
    }

    /// Parses `name=url,name=url` pairs. Empty input yields an empty map.
    pub fn get_pairs(&self, key: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        let raw = self.get_string(key);
        let mut pairs = BTreeMap::new();
        for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let Some((name, value)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidValue(
                    key.to_string(),
                    format!("expected name=value, got {entry}"),
                ));
            };
            pairs.insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(pairs)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("type mismatch for key {0}: expected {1}")]
    TypeMismatch(String, String),
    #[error("invalid value for key {0}: {1}")]
    InvalidValue(String, String),
}

pub struct SystemConfigLoader;

impl SystemConfigLoader {
    pub fn from_str(input: &str) -> Result<SystemConfig, ConfigError> {
        let document: toml::Value =
            toml::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let mut values = HashMap::new();
        collect_leaves(&mut values, "", &document)?;
        Ok(SystemConfig { values })
    }

    /// Renders every known key with its default, grouped by section.
    pub fn default_template() -> String {
        let mut sections: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for item in STATIC_CONFIG_TABLE {
            let Some((section, name)) = item.key.split_once('.') else {
                continue;
            };
            let rendered = match item.value_type {
                "string" => format!("{name} = \"{}\"", item.default_value),
                _ => format!("{name} = {}", item.default_value),
            };
            sections.entry(section).or_default().push(rendered);
        }
        let mut out = String::new();
        for (section, lines) in sections {
            out.push_str(&format!("[{section}]\n"));
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

fn collect_leaves(
    output: &mut HashMap<String, String>,
    prefix: &str,
    value: &toml::Value,
) -> Result<(), ConfigError> {
    let (rendered, kind) = match value {
        toml::Value::Table(table) => {
            for (key, nested) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaves(output, &path, nested)?;
            }
            return Ok(());
        }
        toml::Value::String(value) => (value.clone(), "string"),
        toml::Value::Integer(value) => (value.to_string(), "number"),
        toml::Value::Boolean(value) => (value.to_string(), "boolean"),
        _ => {
            return Err(ConfigError::TypeMismatch(
                prefix.to_string(),
                "string|number|boolean".to_string(),
            ))
        }
    };

    let item = config_item(prefix).ok_or_else(|| ConfigError::UnknownKey(prefix.to_string()))?;
    if item.value_type != kind {
        return Err(ConfigError::TypeMismatch(
            prefix.to_string(),
            item.value_type.to_string(),
        ));
    }
    output.insert(prefix.to_string(), rendered);
    Ok(())
}

fn config_item(key: &str) -> Option<&'static StaticConfigItem> {
    STATIC_CONFIG_TABLE.iter().find(|item| item.key == key)
}

fn default_value(key: &str) -> Option<String> {
    config_item(key).map(|item| item.default_value.to_string())
}
