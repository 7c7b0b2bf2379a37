//! Relay configuration loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9223;
pub const DEFAULT_EXTENSION_TIMEOUT_MS: u64 = 30_000;

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<ExtensionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Shared secret required from automation clients, as a literal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Name of an environment variable holding the shared secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Provision a tab through the extension on the first auto-attach call
    /// when no targets are registered yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_provision: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Reply deadline for commands dispatched to the extension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Resolve a secret: literal field first, then environment indirection.
fn resolve_secret_field(literal: &Option<String>, env_name: &Option<String>) -> Option<String> {
    if let Some(value) = literal {
        return Some(value.clone());
    }
    env_name.as_ref().and_then(|name| std::env::var(name).ok())
}

/// Substitute `${ENV_VAR}` references in raw config text.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl RelayConfig {
    /// Default config file location: `~/.tab-relay/config.json`.
    pub fn default_path() -> std::path::PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".tab-relay")
            .join("config.json")
    }

    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::RelayError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: RelayConfig = json5::from_str(&substituted)
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn host(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_PORT)
    }

    /// Resolve the shared secret, if any is configured.
    pub fn resolve_token(&self) -> Option<String> {
        let server = self.server.as_ref()?;
        resolve_secret_field(&server.token, &server.token_env)
    }

    pub fn auto_provision(&self) -> bool {
        self.server
            .as_ref()
            .and_then(|s| s.auto_provision)
            .unwrap_or(true)
    }

    pub fn extension_timeout(&self) -> std::time::Duration {
        let ms = self
            .extension
            .as_ref()
            .and_then(|e| e.timeout_ms)
            .unwrap_or(DEFAULT_EXTENSION_TIMEOUT_MS);
        std::time::Duration::from_millis(ms)
    }

    pub fn log_level(&self) -> Option<String> {
        self.logging.as_ref().and_then(|l| l.level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = RelayConfig::default();
        assert_eq!(config.host(), DEFAULT_HOST);
        assert_eq!(config.port(), DEFAULT_PORT);
        assert!(config.resolve_token().is_none());
        assert!(config.auto_provision());
        assert_eq!(
            config.extension_timeout(),
            std::time::Duration::from_millis(DEFAULT_EXTENSION_TIMEOUT_MS)
        );
    }

    #[test]
    fn parses_json5_with_comments() {
        let raw = r#"{
            // relay listener
            server: { port: 9333, token: "sekrit", auto_provision: false },
            extension: { timeout_ms: 5000 },
        }"#;
        let config: RelayConfig = json5::from_str(raw).unwrap();
        assert_eq!(config.port(), 9333);
        assert_eq!(config.resolve_token().as_deref(), Some("sekrit"));
        assert!(!config.auto_provision());
        assert_eq!(
            config.extension_timeout(),
            std::time::Duration::from_millis(5000)
        );
    }

    #[test]
    fn token_env_indirection() {
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("TAB_RELAY_TEST_TOKEN", "from-env") };
        let raw = r#"{ server: { token_env: "TAB_RELAY_TEST_TOKEN" } }"#;
        let config: RelayConfig = json5::from_str(raw).unwrap();
        assert_eq!(config.resolve_token().as_deref(), Some("from-env"));
    }

    #[test]
    fn env_substitution_in_raw_text() {
        unsafe { std::env::set_var("TAB_RELAY_TEST_PORT_HOST", "0.0.0.0") };
        let substituted = substitute_env_vars(r#"{ server: { host: "${TAB_RELAY_TEST_PORT_HOST}" } }"#);
        let config: RelayConfig = json5::from_str(&substituted).unwrap();
        assert_eq!(config.host(), "0.0.0.0");
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.port(), DEFAULT_PORT);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{ server: { port: 19223 } }"#).unwrap();
        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.port(), 19223);
    }
}
