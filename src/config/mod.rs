use serde_yaml::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document")]
    Parse(#[from] serde_yaml::Error),
}

/// Hierarchical configuration tree backed by a YAML document.
///
/// Keys are colon-separated paths into nested mappings, e.g.
/// `iaas:dockermachine:driver:name`.
#[derive(Debug, Clone, Default)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn from_yaml(doc: &str) -> Result<Self, ConfigError> {
        let root = serde_yaml::from_str(doc)?;
        Ok(Self { root })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let doc = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml(&doc)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut node = &self.root;
        for part in key.split(':') {
            node = node.get(part)?;
        }
        Some(node)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.as_u64()
    }
}

/// Config lookup scope for a named provider instance: keys are resolved under
/// `iaas:<instance>` first, falling back to `iaas:<base kind>`.
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub base_kind: String,
    pub instance_name: String,
}

impl ProviderBinding {
    pub fn new(base_kind: &str, instance_name: &str) -> Self {
        Self {
            base_kind: base_kind.to_string(),
            instance_name: instance_name.to_string(),
        }
    }

    pub fn get<'a>(&self, config: &'a Config, key: &str) -> Option<&'a Value> {
        config
            .get(&format!("iaas:{}:{}", self.instance_name, key))
            .or_else(|| config.get(&format!("iaas:{}:{}", self.base_kind, key)))
    }

    pub fn get_string(&self, config: &Config, key: &str) -> Option<String> {
        config
            .get_string(&format!("iaas:{}:{}", self.instance_name, key))
            .or_else(|| config.get_string(&format!("iaas:{}:{}", self.base_kind, key)))
    }
}
