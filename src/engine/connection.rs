//! Server connection configuration
//!
//! The server publishes its connection parameters as JSON under
//! `<server URL>/iris/connection.json`. The parsed value is passed explicitly
//! to the session factory.

use super::error::{EngineError, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Path of the connection document relative to the server URL
pub const CONNECTION_JSON_PATH: &str = "/iris/connection.json";

const DEFAULT_AUTH_PORT: u16 = 9031;
const DEFAULT_CONTROLLER_PORT: u16 = 20126;

/// Downloaded connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Authentication servers, tried in order
    pub auth_host: Vec<String>,

    #[serde(default = "default_auth_port")]
    pub auth_port: u16,

    pub controller_host: String,

    #[serde(default = "default_controller_port")]
    pub controller_port: u16,

    /// Use TLS for gRPC; defaults to the scheme of the server URL
    #[serde(default)]
    pub tls: Option<bool>,

    /// Server URL the document was fetched from
    #[serde(skip)]
    pub server_url: String,
}

fn default_auth_port() -> u16 {
    DEFAULT_AUTH_PORT
}

fn default_controller_port() -> u16 {
    DEFAULT_CONTROLLER_PORT
}

impl ServerConfig {
    /// Parse a connection document fetched from `server_url`
    pub fn from_json(server_url: &str, json: &str) -> Result<Self> {
        let mut config: ServerConfig = serde_json::from_str(json).map_err(|e| {
            EngineError::Configuration(format!("Invalid connection.json from '{}': {}", server_url, e))
        })?;
        config.server_url = server_url.trim_end_matches('/').to_string();
        config.validate()?;
        Ok(config)
    }

    /// Download and parse `<server_url>/iris/connection.json`
    pub async fn fetch(server_url: &str, timeout: Duration) -> Result<Self> {
        let url = connection_url(server_url)?;
        info!("Fetching connection configuration from {}", url);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("HTTP client setup failed: {}", e)))?;

        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Configuration(format!("Failed to fetch '{}': {}", url, e)))?;

        if !response.status().is_success() {
            return Err(EngineError::Configuration(format!(
                "Fetching '{}' returned HTTP {}",
                url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Configuration(format!("Failed to read '{}': {}", url, e)))?;
        debug!("connection.json: {} bytes", body.len());

        Self::from_json(server_url, &body)
    }

    fn validate(&self) -> Result<()> {
        if self.auth_host.iter().all(|h| h.trim().is_empty()) {
            return Err(EngineError::Configuration(
                "connection.json lists no authentication hosts".into(),
            ));
        }
        if self.controller_host.trim().is_empty() {
            return Err(EngineError::Configuration(
                "connection.json has an empty controller_host".into(),
            ));
        }
        Ok(())
    }

    pub fn use_tls(&self) -> bool {
        self.tls
            .unwrap_or_else(|| !self.server_url.starts_with("http://"))
    }

    fn scheme(&self) -> &'static str {
        if self.use_tls() {
            "https"
        } else {
            "http"
        }
    }

    pub fn auth_endpoints(&self) -> Vec<String> {
        self.auth_host
            .iter()
            .filter(|h| !h.trim().is_empty())
            .map(|host| format!("{}://{}:{}", self.scheme(), host.trim(), self.auth_port))
            .collect()
    }

    pub fn controller_endpoint(&self) -> String {
        format!(
            "{}://{}:{}",
            self.scheme(),
            self.controller_host.trim(),
            self.controller_port
        )
    }
}

/// Build the connection document URL, rejecting anything that is not http(s)
pub fn connection_url(server_url: &str) -> Result<String> {
    let trimmed = server_url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(EngineError::Configuration(format!(
            "Server URL '{}' must start with http:// or https://",
            server_url
        )));
    }
    Ok(format!("{}{}", trimmed, CONNECTION_JSON_PATH))
}
