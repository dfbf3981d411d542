//! Settings for the Elasticsearch writer.
//!
//! Settings are read once when the pipeline is built and never change
//! afterwards. They can be assembled in code, deserialized with serde, or
//! loaded from `ELASTICSEARCH_*` environment variables (a `.env` file in the
//! working directory is honored).

use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::key::KeyDigest;

const DEFAULT_SERVER: &str = "http://localhost";

/// Verbosity used for the per-item outcome log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            other => Err(PipelineError::Config(format!("unknown log level: {}", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Emits a `tracing` event at a level chosen at runtime.
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            $crate::config::LogLevel::Trace => ::tracing::trace!($($arg)+),
            $crate::config::LogLevel::Debug => ::tracing::debug!($($arg)+),
            $crate::config::LogLevel::Info => ::tracing::info!($($arg)+),
            $crate::config::LogLevel::Warn => ::tracing::warn!($($arg)+),
            $crate::config::LogLevel::Error => ::tracing::error!($($arg)+),
        }
    };
}
pub(crate) use log_at;

/// Connection and indexing settings for [`ElasticsearchWriterPipeline`](crate::elasticsearch_writer::ElasticsearchWriterPipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticsearchSettings {
    /// Server address, with or without scheme.
    #[serde(default = "default_server")]
    pub server: String,
    /// Appended to `server` as `server:port` when set.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Target index.
    pub index: String,
    /// Legacy mapping type. `None` targets the typeless `_update` endpoint.
    #[serde(default)]
    pub doc_type: Option<String>,
    /// Record field digested into the document id. `None` uses the record's `id`.
    #[serde(default)]
    pub unique_key: Option<String>,
    #[serde(default)]
    pub key_digest: KeyDigest,
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

impl ElasticsearchSettings {
    pub fn new(index: impl Into<String>) -> Self {
        ElasticsearchSettings {
            server: default_server(),
            port: None,
            username: None,
            password: None,
            index: index.into(),
            doc_type: None,
            unique_key: None,
            key_digest: KeyDigest::default(),
            log_level: LogLevel::default(),
        }
    }

    pub fn with_server(mut self, server: impl Into<String>, port: Option<u16>) -> Self {
        self.server = server.into();
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn with_doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn with_unique_key(mut self, field: impl Into<String>) -> Self {
        self.unique_key = Some(field.into());
        self
    }

    pub fn with_key_digest(mut self, digest: KeyDigest) -> Self {
        self.key_digest = digest;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Loads `.env` if present, then reads the `ELASTICSEARCH_*` variables.
    pub fn from_env() -> Result<Self, PipelineError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(env_opt)
    }

    /// Builds settings from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let index = get("ELASTICSEARCH_INDEX")
            .ok_or_else(|| PipelineError::Config("ELASTICSEARCH_INDEX is not set".to_string()))?;

        let port = get("ELASTICSEARCH_PORT")
            .map(|raw| {
                raw.parse::<u16>().map_err(|_| {
                    PipelineError::Config(format!("invalid ELASTICSEARCH_PORT: {}", raw))
                })
            })
            .transpose()?;

        let key_digest = get("ELASTICSEARCH_KEY_DIGEST")
            .map(|raw| raw.parse::<KeyDigest>())
            .transpose()?
            .unwrap_or_default();

        let log_level = get("ELASTICSEARCH_LOG_LEVEL")
            .map(|raw| raw.parse::<LogLevel>())
            .transpose()?
            .unwrap_or_default();

        Ok(ElasticsearchSettings {
            server: get("ELASTICSEARCH_SERVER").unwrap_or_else(default_server),
            port,
            username: get("ELASTICSEARCH_USERNAME"),
            password: get("ELASTICSEARCH_PASSWORD"),
            index,
            doc_type: get("ELASTICSEARCH_TYPE"),
            unique_key: get("ELASTICSEARCH_UNIQ_KEY"),
            key_digest,
            log_level,
        })
    }

    /// Base URI of the server: `server:port` when a port is set, `http://` added
    /// when the server has no scheme, trailing slashes dropped.
    pub fn base_uri(&self) -> String {
        let server = self.server.trim_end_matches('/');
        let mut uri = if server.contains("://") {
            server.to_string()
        } else {
            format!("http://{}", server)
        };
        if let Some(port) = self.port {
            uri = format!("{}:{}", uri, port);
        }
        uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_only_index_is_set() {
        let settings = ElasticsearchSettings::from_lookup(lookup(&[("ELASTICSEARCH_INDEX", "shop")]))
            .unwrap();
        assert_eq!(settings, ElasticsearchSettings::new("shop"));
        assert_eq!(settings.base_uri(), "http://localhost");
    }

    #[test]
    fn missing_index_is_a_config_error() {
        let err = ElasticsearchSettings::from_lookup(lookup(&[("ELASTICSEARCH_SERVER", "es")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn reads_all_variables() {
        let settings = ElasticsearchSettings::from_lookup(lookup(&[
            ("ELASTICSEARCH_SERVER", "es.internal"),
            ("ELASTICSEARCH_PORT", "9200"),
            ("ELASTICSEARCH_USERNAME", "crawler"),
            ("ELASTICSEARCH_PASSWORD", "secret"),
            ("ELASTICSEARCH_INDEX", "products"),
            ("ELASTICSEARCH_TYPE", "product"),
            ("ELASTICSEARCH_UNIQ_KEY", "url"),
            ("ELASTICSEARCH_KEY_DIGEST", "sha256"),
            ("ELASTICSEARCH_LOG_LEVEL", "DEBUG"),
        ]))
        .unwrap();

        assert_eq!(settings.base_uri(), "http://es.internal:9200");
        assert_eq!(settings.username.as_deref(), Some("crawler"));
        assert_eq!(settings.password.as_deref(), Some("secret"));
        assert_eq!(settings.doc_type.as_deref(), Some("product"));
        assert_eq!(settings.unique_key.as_deref(), Some("url"));
        assert_eq!(settings.key_digest, KeyDigest::Sha256);
        assert_eq!(settings.log_level, LogLevel::Debug);
    }

    #[test]
    fn empty_values_count_as_unset() {
        let settings = ElasticsearchSettings::from_lookup(lookup(&[
            ("ELASTICSEARCH_INDEX", "shop"),
            ("ELASTICSEARCH_PORT", ""),
            ("ELASTICSEARCH_UNIQ_KEY", ""),
        ]))
        .unwrap();
        assert_eq!(settings.port, None);
        assert_eq!(settings.unique_key, None);
    }

    #[test]
    fn invalid_port_and_level_are_rejected() {
        assert!(ElasticsearchSettings::from_lookup(lookup(&[
            ("ELASTICSEARCH_INDEX", "shop"),
            ("ELASTICSEARCH_PORT", "http"),
        ]))
        .is_err());
        assert!(ElasticsearchSettings::from_lookup(lookup(&[
            ("ELASTICSEARCH_INDEX", "shop"),
            ("ELASTICSEARCH_LOG_LEVEL", "loud"),
        ]))
        .is_err());
    }

    #[test]
    fn base_uri_keeps_existing_scheme() {
        let settings = ElasticsearchSettings::new("shop").with_server("https://search.example.com/", None);
        assert_eq!(settings.base_uri(), "https://search.example.com");
    }

    #[test]
    fn deserializes_with_defaults() {
        let settings: ElasticsearchSettings =
            serde_json::from_str(r#"{"index": "shop", "log_level": "warn"}"#).unwrap();
        assert_eq!(settings.server, DEFAULT_SERVER);
        assert_eq!(settings.log_level, LogLevel::Warn);
        assert_eq!(settings.key_digest, KeyDigest::Sha1);
    }
}
