use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{
    constants::{DEFAULT_CLIENT_ID, DEFAULT_RESOURCE},
    http::ClientSettings,
};

/// Library configuration, loadable from a TOML file with environment
/// overrides (`ENTRA_AUTH_*`).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    pub scope: Option<String>,

    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_resource() -> String {
    DEFAULT_RESOURCE.to_string()
}

fn default_verify_tls() -> bool {
    true
}

fn default_token_file() -> PathBuf {
    PathBuf::from(".roadtools_auth")
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            username: None,
            password: None,
            tenant: None,
            client_id: default_client_id(),
            resource: default_resource(),
            scope: None,
            user_agent: None,
            proxy: None,
            verify_tls: true,
            debug: false,
            token_file: default_token_file(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("entra_auth.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("entra_auth").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            proxy: self.proxy.clone(),
            verify_tls: self.verify_tls,
            user_agent: self.user_agent.clone(),
        }
    }
}
