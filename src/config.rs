//! CLI configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MF_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags (applied by the caller)

use mflux_client::{ConnectionConfig, ProxyConfig, Scheme, TlsClientConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    /// Forward proxy as `[user:password@]host:port`.
    pub proxy: Option<String>,
    /// Namespace new assets are created in.
    pub namespace: String,
}

impl Config {
    /// Loads configuration from `path` (or MF_CONFIG), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("MF_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(ref path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.server.apply_env_overrides(&lookup);
        self.auth.apply_env_overrides(&lookup);
        if let Some(proxy) = lookup("MF_PROXY") {
            self.proxy = Some(proxy);
        }
        if let Some(namespace) = lookup("MF_NAMESPACE") {
            self.namespace = namespace;
        }
    }

    /// Builds the client connection configuration.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let scheme: Scheme = self
            .server
            .transport
            .parse()
            .map_err(|e: mflux_client::ClientError| ConfigError::ValidationError(e.to_string()))?;
        if self.server.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "server host is not set (MF_HOST)".to_string(),
            ));
        }

        let mut config = ConnectionConfig::new(self.server.host.clone(), self.server.port)
            .with_transport(scheme)
            .with_connect_timeout(Duration::from_secs(self.server.connect_timeout_secs))
            .with_recv_timeout(Duration::from_secs(self.server.recv_timeout_secs))
            .with_tls(self.tls.client_config());

        if let Some(ref app) = self.server.app {
            config = config.with_app(app);
        }
        if let Some(ref proxy) = self.proxy {
            config = config.with_proxy(parse_proxy(proxy)?);
        }
        if let (Some(domain), Some(user), Some(password)) =
            (&self.auth.domain, &self.auth.user, &self.auth.password)
        {
            config = config.with_credentials(domain, user, password);
        }
        if let Some(ref token) = self.auth.token {
            config = config.with_token(token, self.auth.token_type.clone());
        }
        Ok(config)
    }
}

/// Server endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `http` or `https`.
    pub transport: String,
    pub connect_timeout_secs: u64,
    pub recv_timeout_secs: u64,
    pub app: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            transport: "https".to_string(),
            connect_timeout_secs: 10,
            recv_timeout_secs: 10,
            app: None,
        }
    }
}

impl ServerConfig {
    fn apply_env_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MF_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("MF_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Some(transport) = lookup("MF_TRANSPORT") {
            self.transport = transport;
        }
        if let Some(timeout) = lookup("MF_RECV_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.recv_timeout_secs = secs;
            }
        }
    }
}

/// Logon credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub domain: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub token_type: Option<String>,
}

impl AuthConfig {
    fn apply_env_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(domain) = lookup("MF_DOMAIN") {
            self.domain = Some(domain);
        }
        if let Some(user) = lookup("MF_USER").or_else(|| lookup("MF_USERNAME")) {
            self.user = Some(user);
        }
        if let Some(password) = lookup("MF_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(token) = lookup("MF_TOKEN") {
            self.token = Some(token);
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("domain", &self.domain)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_cert_path: Option<PathBuf>,
    /// Skip server certificate verification (development only).
    pub insecure: bool,
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn client_config(&self) -> TlsClientConfig {
        let mut tls = TlsClientConfig::new();
        tls.ca_cert_path = self.ca_cert_path.clone();
        tls.insecure = self.insecure;
        tls.server_name = self.server_name.clone();
        tls
    }
}

/// Parses `[user:password@]host:port`.
pub fn parse_proxy(value: &str) -> Result<ProxyConfig, ConfigError> {
    let invalid = || ConfigError::ValidationError(format!("invalid proxy {:?}", value));

    let (userinfo, address) = match value.rsplit_once('@') {
        Some((userinfo, address)) => (Some(userinfo), address),
        None => (None, value),
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }

    let proxy = ProxyConfig::new(host, port);
    match userinfo {
        Some(userinfo) => {
            let (user, password) = userinfo.split_once(':').ok_or_else(invalid)?;
            Ok(proxy.with_credentials(user, password))
        }
        None => Ok(proxy),
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file {0:?}: {1}")]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}
