use crate::router::WATCHDOG_INTERVAL;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for `plugin_response_timeout`, in seconds.
pub const MAX_PLUGIN_RESPONSE_TIMEOUT: u64 = 60;

/// Built-in plugins loaded when the config names none.
pub const DEFAULT_PLUGINS: &[&str] = &["helloworld", "lightemulator", "simpleclock"];

/// Gateway configuration, read from a JSON file with snake_case keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub gotapi_if_host: String,

    #[serde(default = "default_port")]
    pub gotapi_if_port: u16,

    /// Extra client addresses: IPv4, IPv4 CIDR, or IPv6 prefix.
    #[serde(default)]
    pub allowed_address_list: Vec<String>,

    /// Extra `Origin` values accepted besides local origins.
    #[serde(default)]
    pub allowed_origin_list: Vec<String>,

    #[serde(default = "default_ws_connection_limit")]
    pub ws_connection_limit: usize,

    /// Seconds a WebSocket may stay open without presenting a token.
    #[serde(default = "default_ws_access_token_timeout")]
    pub ws_access_token_timeout: u64,

    #[serde(default = "default_true")]
    pub ws_verify_access_token: bool,

    /// Seconds a plugin may take to answer.
    #[serde(default = "default_plugin_response_timeout")]
    pub plugin_response_timeout: u64,

    /// Seconds the HTTP front end waits for any answer.
    #[serde(default = "default_http_request_timeout")]
    pub http_request_timeout: u64,

    /// Seconds an unfinished availability/grant sequence is kept.
    #[serde(default = "default_authorization_timeout")]
    pub authorization_timeout: u64,

    #[serde(default)]
    pub enforce_client_scope: bool,

    #[serde(default = "default_app_id")]
    pub gotapi_server_app_id: String,

    /// Plugins to load, in load (and routing) order.
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4035
}

fn default_ws_connection_limit() -> usize {
    1
}

fn default_ws_access_token_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_plugin_response_timeout() -> u64 {
    MAX_PLUGIN_RESPONSE_TIMEOUT
}

fn default_http_request_timeout() -> u64 {
    MAX_PLUGIN_RESPONSE_TIMEOUT + 5
}

fn default_authorization_timeout() -> u64 {
    300
}

fn default_app_id() -> String {
    "com.github.futomi.node-gotapi".to_string()
}

fn default_plugins() -> Vec<String> {
    DEFAULT_PLUGINS.iter().map(|s| (*s).to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gotapi_if_host: default_host(),
            gotapi_if_port: default_port(),
            allowed_address_list: Vec::new(),
            allowed_origin_list: Vec::new(),
            ws_connection_limit: default_ws_connection_limit(),
            ws_access_token_timeout: default_ws_access_token_timeout(),
            ws_verify_access_token: true,
            plugin_response_timeout: default_plugin_response_timeout(),
            http_request_timeout: default_http_request_timeout(),
            authorization_timeout: default_authorization_timeout(),
            enforce_client_scope: false,
            gotapi_server_app_id: default_app_id(),
            plugins: default_plugins(),
        }
    }
}

impl Config {
    /// Load and validate config from file.
    ///
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, contains
    /// invalid JSON, or holds out-of-range values.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        super::validation::warn_unknown_fields(&content, "config.json");
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PLUGIN_RESPONSE_TIMEOUT).contains(&self.plugin_response_timeout) {
            return Err(Error::Config(format!(
                "plugin_response_timeout must be between 1 and {MAX_PLUGIN_RESPONSE_TIMEOUT} seconds"
            )));
        }
        // The router's timeout must reach the app before the front end gives up.
        let plugin_deadline = self.plugin_response_timeout + WATCHDOG_INTERVAL.as_secs();
        if self.http_request_timeout <= plugin_deadline {
            return Err(Error::Config(format!(
                "http_request_timeout must be greater than {plugin_deadline} seconds \
                 (plugin_response_timeout plus the watchdog interval)"
            )));
        }
        if self.ws_access_token_timeout == 0 {
            return Err(Error::Config(
                "ws_access_token_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.ws_connection_limit == 0 {
            return Err(Error::Config(
                "ws_connection_limit must be at least 1".to_string(),
            ));
        }
        if self.gotapi_server_app_id.is_empty() {
            return Err(Error::Config(
                "gotapi_server_app_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn plugin_response_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_response_timeout)
    }

    #[must_use]
    pub fn http_request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout)
    }

    #[must_use]
    pub fn ws_access_token_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_access_token_timeout)
    }

    #[must_use]
    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_secs(self.authorization_timeout)
    }
}
