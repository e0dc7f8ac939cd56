//! Configuration management

use std::{collections::BTreeMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before `${VAR}` expansion.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Token verification configuration
    pub auth: AuthConfig,
    /// Claims cache configuration
    pub cache: CacheConfig,
    /// Pipeline configuration
    pub gateway: GatewayConfig,
    /// Backend services and their routes
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Whole-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Bearer token verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity provider region (e.g. `eu-west-1`)
    pub region: Option<String>,
    /// User pool identifier
    pub user_pool_id: Option<String>,
    /// Expected `iss` claim; derived from region and pool when unset
    pub issuer: Option<String>,
    /// Key set URL; `<issuer>/.well-known/jwks.json` when unset
    pub jwks_uri: Option<String>,
    /// Background key set refresh interval
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    /// Timeout for a single key set fetch
    #[serde(with = "humantime_serde")]
    pub jwks_fetch_timeout: Duration,
    /// Refuse to fetch the key set over plain HTTP
    pub require_https: bool,
    /// Claim holding the caller's groups/roles
    pub role_claim: String,
    /// Clock skew tolerance for `exp`, in seconds
    pub leeway_secs: u64,
    /// Re-check every newly seen token with the identity provider
    pub secondary_verification: bool,
    /// Identity provider API endpoint; derived from region when unset
    pub identity_provider_endpoint: Option<String>,
    /// Timeout for a single identity provider call
    #[serde(with = "humantime_serde")]
    pub identity_provider_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            region: None,
            user_pool_id: None,
            issuer: None,
            jwks_uri: None,
            jwks_refresh_interval: Duration::from_secs(3600),
            jwks_fetch_timeout: Duration::from_secs(10),
            require_https: true,
            role_claim: "cognito:groups".to_string(),
            leeway_secs: 0,
            secondary_verification: false,
            identity_provider_endpoint: None,
            identity_provider_timeout: Duration::from_secs(5),
        }
    }
}

impl AuthConfig {
    /// Expected token issuer
    #[must_use]
    pub fn resolve_issuer(&self) -> Option<String> {
        if let Some(ref issuer) = self.issuer {
            return Some(issuer.trim_end_matches('/').to_string());
        }
        match (&self.region, &self.user_pool_id) {
            (Some(region), Some(pool)) => Some(format!(
                "https://cognito-idp.{region}.amazonaws.com/{pool}"
            )),
            _ => None,
        }
    }

    /// Key set document URL
    #[must_use]
    pub fn resolve_jwks_uri(&self) -> Option<String> {
        self.jwks_uri
            .clone()
            .or_else(|| self.resolve_issuer().map(|issuer| default_jwks_uri(&issuer)))
    }

    /// Identity provider API endpoint
    #[must_use]
    pub fn resolve_identity_provider_endpoint(&self) -> Option<String> {
        self.identity_provider_endpoint.clone().or_else(|| {
            self.region
                .as_ref()
                .map(|region| format!("https://cognito-idp.{region}.amazonaws.com/"))
        })
    }
}

/// Derive the key set URL from the issuer using the well-known path.
#[must_use]
pub fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}

/// Which store backs the claims cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local map
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
    /// No caching: every request is fully validated
    Disabled,
}

/// Claims cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store backing the cache
    pub backend: CacheBackend,
    /// Redis connection URL (required for the redis backend)
    pub url: Option<String>,
    /// How often the memory backend drops expired entries
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            url: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Request pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `POST` to this path invalidates the caller's cached claims before forwarding
    pub sign_out_path: String,
    /// Deadline for connecting to a backend and receiving its response headers
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sign_out_path: "/api/v1/sign-out".to_string(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// A backend service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Base URL requests are forwarded to
    pub target: String,
    /// Route pattern -> roles allowed (empty list = public)
    #[serde(default)]
    pub routes: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (API_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("API_GATEWAY_").split("__"));

        Self::from_figment(&figment)
    }

    /// Parse configuration from a YAML string (no environment merge)
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let figment = Figment::new().merge(Yaml::string(yaml));
        Self::from_figment(&figment)
    }

    fn from_figment(figment: &Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Check the settings the gateway cannot start without
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.auth.resolve_jwks_uri().is_none() {
            return Err(Error::Config(
                "auth.region and auth.user_pool_id (or auth.jwks_uri) are required".to_string(),
            ));
        }
        if self.auth.resolve_issuer().is_none() {
            return Err(Error::Config(
                "auth.issuer cannot be derived; set auth.region and auth.user_pool_id or auth.issuer"
                    .to_string(),
            ));
        }
        if self.auth.secondary_verification
            && self.auth.resolve_identity_provider_endpoint().is_none()
        {
            return Err(Error::Config(
                "auth.secondary_verification needs auth.region or auth.identity_provider_endpoint"
                    .to_string(),
            ));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.url.is_none() {
            return Err(Error::Config(
                "cache.url is required for the redis backend".to_string(),
            ));
        }
        if !self.gateway.sign_out_path.starts_with('/') {
            return Err(Error::Config(format!(
                "gateway.sign_out_path must start with '/': {}",
                self.gateway.sign_out_path
            )));
        }
        if self.auth.jwks_refresh_interval.is_zero() {
            return Err(Error::Config(
                "auth.jwks_refresh_interval must be greater than zero".to_string(),
            ));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(Error::Config(
                "cache.sweep_interval must be greater than zero".to_string(),
            ));
        }
        // Pattern syntax and duplicates
        crate::registry::RouteRegistry::from_services(&self.services)?;
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let auth = &mut self.auth;
        for value in [
            &mut auth.region,
            &mut auth.user_pool_id,
            &mut auth.issuer,
            &mut auth.jwks_uri,
            &mut auth.identity_provider_endpoint,
            &mut self.cache.url,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }

        for service in self.services.values_mut() {
            service.target = Self::expand_string(&re, &service.target);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Human-readable `Duration` (de)serialization: `"500ms"`, `"30s"`, `"15m"`, `"1h"`
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as whole seconds, or milliseconds when not a whole second
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a duration string; a bare number is seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s}")))
    }

    pub(super) fn parse(s: &str) -> Option<Duration> {
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse().ok().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse().ok().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
        } else {
            s.parse().ok().map(Duration::from_secs)
        }
    }
}
