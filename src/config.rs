//! Environment-driven configuration for hosts that do not wire things up by hand.

use crate::call::{CallConfig, IceServer, default_ice_servers};
use crate::protocol::models::DEFAULT_MODEL;
use crate::transport::rest::RestRelay;
use crate::transport::ws::DEFAULT_ENDPOINT;
use crate::{Error, Result};

pub const API_KEY_VAR: &str = "LIVELINK_API_KEY";
pub const MODEL_VAR: &str = "LIVELINK_MODEL";
pub const ENDPOINT_VAR: &str = "LIVELINK_ENDPOINT";
pub const RELAY_URL_VAR: &str = "LIVELINK_RELAY_URL";
pub const RELAY_AUTH_VAR: &str = "LIVELINK_RELAY_AUTH";
/// JSON array of `{"urls": [...], "username": ..., "credential": ...}`.
pub const ICE_SERVERS_VAR: &str = "LIVELINK_ICE_SERVERS";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub relay_url: Option<String>,
    pub relay_auth: Option<String>,
    pub ice_servers: Vec<IceServer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            relay_url: None,
            relay_auth: None,
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    /// # Errors
    /// Returns [`Error::Config`] if a variable is set but malformed.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if a variable is set but malformed.
    #[allow(clippy::result_large_err)]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let ice_servers = match var(ICE_SERVERS_VAR) {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid {ICE_SERVERS_VAR}: {e}")))?,
            None => defaults.ice_servers,
        };
        let relay_url = var(RELAY_URL_VAR);
        if let Some(raw) = &relay_url {
            url::Url::parse(raw).map_err(|e| Error::Config(format!("invalid {RELAY_URL_VAR}: {e}")))?;
        }

        Ok(Self {
            api_key: var(API_KEY_VAR),
            model: var(MODEL_VAR).unwrap_or(defaults.model),
            endpoint: var(ENDPOINT_VAR).unwrap_or(defaults.endpoint),
            relay_url,
            relay_auth: var(RELAY_AUTH_VAR),
            ice_servers,
        })
    }

    #[must_use]
    pub fn call_config(&self) -> CallConfig {
        CallConfig::default().with_ice_servers(self.ice_servers.clone())
    }

    /// The configured REST relay, if a relay URL is set.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn relay(&self) -> Result<Option<RestRelay>> {
        self.relay_url
            .as_deref()
            .map(|url| RestRelay::new(url, self.relay_auth.clone()))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[(API_KEY_VAR, "  ")])).unwrap();
        assert_eq!(config.api_key, None);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.ice_servers, default_ice_servers());
        assert!(config.relay().unwrap().is_none());
    }

    #[test]
    fn ice_servers_are_read_as_json() {
        let config = ClientConfig::from_lookup(lookup(&[
            (API_KEY_VAR, "key"),
            (RELAY_URL_VAR, "https://relay.example.com"),
            (
                ICE_SERVERS_VAR,
                r#"[{"urls": ["turn:turn.example.com"], "username": "u", "credential": "p"}]"#,
            ),
        ]))
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("key"));
        assert_eq!(config.ice_servers, vec![IceServer::turn("turn:turn.example.com", "u", "p")]);
        assert_eq!(config.call_config().ice_servers, config.ice_servers);
        assert!(config.relay().unwrap().is_some());
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let bad_ice = ClientConfig::from_lookup(lookup(&[(ICE_SERVERS_VAR, "stun:nope")]));
        assert!(matches!(bad_ice, Err(Error::Config(_))));

        let bad_relay = ClientConfig::from_lookup(lookup(&[(RELAY_URL_VAR, "not a url")]));
        assert!(matches!(bad_relay, Err(Error::Config(_))));
    }
}
