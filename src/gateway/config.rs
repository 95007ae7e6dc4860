use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::limits::LimitsConfig;
use super::personas::{Persona, PersonaRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub default_limits: LimitsConfig,
    /// Empty means the built-in Round Table.
    #[serde(default)]
    pub personas: Vec<Persona>,
    /// Empty means the built-in key roster.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default)]
    pub tamper_store: TamperStoreConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: UpstreamConfig::default(),
            default_limits: LimitsConfig::default(),
            personas: Vec::new(),
            api_keys: Vec::new(),
            tamper_store: TamperStoreConfig::default(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Longest wait for the next upstream chunk before the turn is abandoned.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    crate::providers::openai_compatible::DEFAULT_BASE_URL.to_string()
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
}

impl std::fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("max_tokens", &self.max_tokens)
            .field("max_requests", &self.max_requests)
            .finish()
    }
}

impl ApiKeyConfig {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            max_tokens: None,
            max_requests: None,
        }
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.max_tokens = Some(limits.max_tokens);
        self.max_requests = Some(limits.max_requests);
        self
    }

    pub fn limits(&self, defaults: LimitsConfig) -> LimitsConfig {
        LimitsConfig {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            max_requests: self.max_requests.unwrap_or(defaults.max_requests),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperStoreConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

impl Default for TamperStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("responses.db")
}

impl GatewayConfig {
    /// Reads a config file; `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config: Self = if is_toml {
            toml::from_str(&raw)?
        } else {
            serde_json::from_str(&raw)?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "upstream.idle_timeout_secs must be positive".to_string(),
            ));
        }
        validate_limits("default_limits", self.default_limits)?;

        let mut names = HashSet::new();
        for persona in &self.personas {
            if persona.name.trim().is_empty() {
                return Err(ConfigError::Invalid("persona name is empty".to_string()));
            }
            if persona.upstream_model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "persona {} has no upstream_model",
                    persona.name
                )));
            }
            if !names.insert(persona.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate persona: {}",
                    persona.name
                )));
            }
        }

        let mut ids = HashSet::new();
        let mut tokens = HashSet::new();
        for key in &self.api_keys {
            if key.id.trim().is_empty() {
                return Err(ConfigError::Invalid("api key id is empty".to_string()));
            }
            if key.token.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "api key {} has an empty token",
                    key.id
                )));
            }
            if !ids.insert(key.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate api key id: {}",
                    key.id
                )));
            }
            if !tokens.insert(key.token.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "api key {} reuses another key's token",
                    key.id
                )));
            }
            validate_limits(&key.id, key.limits(self.default_limits))?;
        }
        Ok(())
    }

    pub fn persona_registry(&self) -> PersonaRegistry {
        if self.personas.is_empty() {
            PersonaRegistry::round_table()
        } else {
            PersonaRegistry::new(self.personas.iter().cloned())
        }
    }

    pub fn resolved_api_keys(&self) -> Vec<ApiKeyConfig> {
        if self.api_keys.is_empty() {
            builtin_api_keys()
        } else {
            self.api_keys.clone()
        }
    }
}

fn validate_limits(owner: &str, limits: LimitsConfig) -> Result<(), ConfigError> {
    if limits.max_tokens == 0 || limits.max_requests == 0 {
        return Err(ConfigError::Invalid(format!(
            "{owner}: max_tokens and max_requests must be positive"
        )));
    }
    Ok(())
}

/// The keys handed out for the Round Table deployment; id is the token without `sk-`.
pub fn builtin_api_keys() -> Vec<ApiKeyConfig> {
    BUILTIN_KEY_TOKENS
        .iter()
        .map(|token| {
            let id = token.strip_prefix("sk-").unwrap_or(token);
            ApiKeyConfig::new(id, *token)
        })
        .collect()
}

const BUILTIN_KEY_TOKENS: &[&str] = &[
    "sk-hedonium-shockwave",
    "sk-taboo-your-words",
    "sk-fermi-misunderestimate",
    "sk-pascals-mugging",
    "sk-one-boxer",
    "sk-bayes-dojo",
    "sk-utility-monster",
    "sk-counterfactual",
    "sk-spooky-action",
    "sk-simulaca-levels",
    "sk-memetic-immunity",
    "sk-truth-seeking-missile",
    "sk-belief-reticulation",
    "sk-metaethics-but-epic",
    "sk-infinite-improbability-drive",
    "sk-anti-inductive",
    "sk-metacontrarian",
    "sk-pebble-sorter",
    "sk-ethical-injunction",
    "sk-quirrell-point",
    "sk-antimemetics-division",
    "sk-inferential-distance",
    "sk-galaxy-brain",
    "sk-double-crux",
    "sk-aumann-disagreement",
    "sk-semantic-stopsign",
    "sk-map-territory",
    "sk-steelmanned-strawman",
    "sk-karma-maximizer",
    "sk-rubber-duck",
    "sk-tea-taster",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_config_uses_builtins() {
        let config: GatewayConfig = serde_json::from_str("{}").expect("parse");
        config.validate().expect("valid");

        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.upstream.idle_timeout_secs, 120);
        assert_eq!(config.default_limits, LimitsConfig::default());
        assert_eq!(config.tamper_store.sqlite_path, PathBuf::from("responses.db"));
        assert_eq!(config.persona_registry().len(), 8);

        let keys = config.resolved_api_keys();
        assert_eq!(keys.len(), 31);
        let rubber_duck = keys
            .iter()
            .find(|key| key.token == "sk-rubber-duck")
            .expect("rubber duck");
        assert_eq!(rubber_duck.id, "rubber-duck");
    }

    #[test]
    fn toml_config_loads_by_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
listen = "0.0.0.0:9000"

[default_limits]
max_tokens = 100
max_requests = 5

[[personas]]
name = "merlin"
upstream_model = "gpt-4o-mini"
system_prompt = "You are Merlin."

[[api_keys]]
id = "tester"
token = "sk-test"
max_tokens = 10
"#,
        )
        .expect("write");

        let config = GatewayConfig::load(&path).expect("load");
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert!(config.persona_registry().get("merlin").is_some());
        assert!(config.persona_registry().get("arthur").is_none());

        let key = &config.resolved_api_keys()[0];
        assert_eq!(
            key.limits(config.default_limits),
            LimitsConfig {
                max_tokens: 10,
                max_requests: 5
            }
        );
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let config = GatewayConfig {
            api_keys: vec![ApiKeyConfig::new("a", "sk-x"), ApiKeyConfig::new("b", "sk-x")],
            ..GatewayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_personas_and_zero_limits_are_rejected() {
        let persona = Persona::new("kay", "m", "p");
        let config = GatewayConfig {
            personas: vec![persona.clone(), persona],
            ..GatewayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = GatewayConfig {
            api_keys: vec![ApiKeyConfig::new("a", "sk-a").with_limits(LimitsConfig {
                max_tokens: 0,
                max_requests: 1,
            })],
            ..GatewayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn debug_redacts_token() {
        let rendered = format!("{:?}", ApiKeyConfig::new("a", "sk-secret"));
        assert!(!rendered.contains("sk-secret"));
    }
}
