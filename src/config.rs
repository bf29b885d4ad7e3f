use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::features::endpoint::{DisabledEndpoint, HttpEndpoint, RemoteEndpoint};
use crate::features::storage::preferred_data_dir;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_dir: Option<PathBuf>,
    pub endpoint_url: Option<String>,
    pub endpoint_token: Option<String>,
    pub request_timeout_secs: u64,
    pub start_online: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: None,
            endpoint_url: None,
            endpoint_token: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            start_online: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let vars: HashMap<String, String> = [
            ("storage_dir", "FIELDSIGN_STORAGE_DIR"),
            ("endpoint_url", "FIELDSIGN_ENDPOINT_URL"),
            ("endpoint_token", "FIELDSIGN_ENDPOINT_TOKEN"),
            ("request_timeout_secs", "FIELDSIGN_REQUEST_TIMEOUT"),
            ("start_online", "FIELDSIGN_START_ONLINE"),
        ]
        .into_iter()
        .filter_map(|(field, var)| env::var(var).ok().map(|value| (field.to_string(), value)))
        .collect();
        config.apply_bindings(&vars)?;
        Ok(config)
    }

    /// Overlays string values keyed by field name, as sent by the host.
    pub fn apply_bindings(&mut self, bindings: &HashMap<String, String>) -> Result<(), ConfigError> {
        let non_empty = |key: &str| {
            bindings
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        if let Some(dir) = non_empty("storage_dir") {
            self.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = non_empty("endpoint_url") {
            self.endpoint_url = Some(url);
        }
        if let Some(token) = non_empty("endpoint_token") {
            self.endpoint_token = Some(token);
        }
        if let Some(raw) = non_empty("request_timeout_secs") {
            self.request_timeout_secs = raw
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: "request_timeout_secs",
                    value: raw,
                })?;
        }
        if let Some(raw) = non_empty("start_online") {
            self.start_online = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "start_online",
                        value: raw,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn resolved_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(preferred_data_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn build_endpoint(&self) -> Result<Arc<dyn RemoteEndpoint>, ConfigError> {
        match &self.endpoint_url {
            Some(url) => Ok(Arc::new(HttpEndpoint::new(
                url,
                self.endpoint_token.clone(),
                self.request_timeout(),
            )?)),
            None => {
                log::warn!("no sync endpoint configured; signatures will stay pending");
                Ok(Arc::new(DisabledEndpoint))
            }
        }
    }
}
