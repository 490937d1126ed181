//! Configuration management

use std::{
    env,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::matcher::{PathBypass, TrustedIps};
use crate::signer::SignatureKey;
use crate::verifier::BearerIssuer;
use crate::{Error, Result};

/// Pattern: `${VAR}` or `${VAR:-default}`
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern")
});

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Listener and routing configuration
    pub server: ServerConfig,
    /// Upstream services, matched by longest path prefix
    pub upstreams: Vec<UpstreamConfig>,
    /// Identity provider configuration
    pub provider: ProviderConfig,
    /// Session cookie configuration
    pub cookie: CookieConfig,
    /// Session persistence configuration
    pub session: SessionConfig,
    /// Authentication bypass and fallback configuration
    pub auth: AuthConfig,
    /// Identity header propagation flags
    pub headers: HeaderConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// URL root for the proxy's own endpoints (`/oauth2/start`, ...)
    pub proxy_prefix: String,
    /// Health check path, never authenticated
    pub ping_path: String,
    /// Accept client IP headers from a fronting proxy
    pub reverse_proxy: bool,
    /// Header carrying the real client IP when `reverse_proxy` is set
    pub real_client_ip_header: String,
    /// Absolute OAuth callback URL; derived from the request host when unset
    pub redirect_url: Option<String>,
    /// Domains allowed as post-login redirect targets (`.example.com` allows subdomains)
    pub whitelist_domains: Vec<String>,
    /// Timeout for forwarded upstream requests
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4180,
            proxy_prefix: "/oauth2".to_string(),
            ping_path: "/ping".to_string(),
            reverse_proxy: false,
            real_client_ip_header: "X-Real-IP".to_string(),
            redirect_url: None,
            whitelist_domains: Vec::new(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// A single upstream service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Path prefix routed to this upstream
    #[serde(default = "default_upstream_path")]
    pub path: String,
    /// Base URL of the upstream service
    pub url: String,
}

fn default_upstream_path() -> String {
    "/".to_string()
}

/// Identity provider flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenID Connect with discovery and ID-token verification
    #[default]
    Oidc,
    /// Plain OAuth2 with explicit endpoints and a profile URL
    #[serde(rename = "oauth2")]
    OAuth2,
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider identifier, recorded in every session
    pub id: String,
    /// Provider flavour
    pub kind: ProviderKind,
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret (supports `${VAR}`)
    pub client_secret: String,
    /// OIDC issuer URL (discovery base)
    pub issuer_url: Option<String>,
    /// Skip `.well-known/openid-configuration` and use the explicit URLs below
    pub skip_discovery: bool,
    /// Authorization endpoint
    pub login_url: Option<String>,
    /// Token endpoint
    pub redeem_url: Option<String>,
    /// Profile / userinfo endpoint
    pub profile_url: Option<String>,
    /// Token validation endpoint (plain OAuth2)
    pub validate_url: Option<String>,
    /// JWKS endpoint (OIDC, when discovery is skipped)
    pub jwks_url: Option<String>,
    /// Requested scopes
    pub scope: String,
    /// Timeout for token endpoint and profile calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempts for discovery and JWKS fetches at startup
    pub discovery_attempts: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: "oidc".to_string(),
            kind: ProviderKind::Oidc,
            client_id: String::new(),
            client_secret: String::new(),
            issuer_url: None,
            skip_discovery: false,
            login_url: None,
            redeem_url: None,
            profile_url: None,
            validate_url: None,
            jwks_url: None,
            scope: "openid email profile".to_string(),
            timeout: Duration::from_secs(10),
            discovery_attempts: 3,
        }
    }
}

/// Session cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Cookie name; chunks are suffixed `_1`, `_2`, ...
    pub name: String,
    /// Secret used to sign and encrypt cookies (16, 24 or 32 bytes)
    pub secret: String,
    /// Cookie domain
    pub domain: Option<String>,
    /// Cookie path
    pub path: String,
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub expire: Duration,
    /// Refresh sessions older than this (0 disables)
    #[serde(with = "humantime_serde")]
    pub refresh: Duration,
    /// Set the `Secure` attribute
    pub secure: bool,
    /// Set the `HttpOnly` attribute
    pub http_only: bool,
    /// `SameSite` attribute (`lax`, `strict`, `none`)
    pub same_site: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "_oauth2_proxy".to_string(),
            secret: String::new(),
            domain: None,
            path: "/".to_string(),
            expire: Duration::from_secs(168 * 3600),
            refresh: Duration::ZERO,
            secure: true,
            http_only: true,
            same_site: None,
        }
    }
}

/// Where session payloads live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    /// Entire session in (chunked) browser cookies
    #[default]
    Cookie,
    /// Server-side in Redis, ticket in the cookie
    Redis,
    /// Server-side in process memory, ticket in the cookie
    Memory,
}

/// Session persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Store type
    pub store: SessionStoreKind,
    /// Refresh when the access token expires within this window
    #[serde(with = "humantime_serde")]
    pub refresh_skew: Duration,
    /// Deadline for a provider refresh call on the request path
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,
    /// Encrypt session payloads (AES-256-GCM) in addition to authenticating them
    pub encrypt: bool,
    /// Deadline for each server-side store operation
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
    /// How often the in-memory store evicts expired tickets
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// Redis connection settings
    pub redis: RedisConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: SessionStoreKind::Cookie,
            refresh_skew: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(10),
            encrypt: true,
            store_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_secs(60),
            redis: RedisConfig::default(),
        }
    }
}

/// Redis connection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    /// One Redis node
    #[default]
    Single,
    /// Master discovered through Sentinel
    Sentinel,
    /// Redis Cluster
    Cluster,
}

/// Redis session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection strategy
    pub mode: RedisMode,
    /// `redis://HOST[:PORT]` for single-node mode
    pub connection_url: Option<String>,
    /// Password for data nodes; overrides any password in the URLs
    pub password: Option<String>,
    /// Sentinel master name
    pub sentinel_master_name: Option<String>,
    /// Sentinel URLs
    pub sentinel_connection_urls: Vec<String>,
    /// Password for the sentinels themselves
    pub sentinel_password: Option<String>,
    /// Cluster node URLs
    pub cluster_connection_urls: Vec<String>,
    /// Prefix prepended to every ticket key
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Single,
            connection_url: None,
            password: None,
            sentinel_master_name: None,
            sentinel_connection_urls: Vec::new(),
            sentinel_password: None,
            cluster_connection_urls: Vec::new(),
            key_prefix: String::new(),
        }
    }
}

/// Authentication bypass and fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// IPs or CIDR ranges that bypass authentication
    pub trusted_ips: Vec<String>,
    /// Path regexes that bypass authentication
    pub skip_auth_regex: Vec<String>,
    /// Strip identity headers on bypassed paths
    pub skip_auth_strip_headers: bool,
    /// Let CORS preflight (`OPTIONS`) requests through
    pub skip_auth_preflight: bool,
    /// Accept verified JWT bearer tokens instead of a session
    pub skip_jwt_bearer_tokens: bool,
    /// Extra `issuer=audience` pairs accepted for bearer tokens
    pub extra_jwt_issuers: Vec<String>,
    /// htpasswd file for basic-auth fallback
    pub htpasswd_file: Option<PathBuf>,
    /// Allowed email domains (`*` = any)
    pub email_domains: Vec<String>,
    /// File of allowed email addresses, one per line
    pub authenticated_emails_file: Option<PathBuf>,
    /// Upstream request signing key (`sha256:secret`)
    pub signature_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            trusted_ips: Vec::new(),
            skip_auth_regex: Vec::new(),
            skip_auth_strip_headers: false,
            skip_auth_preflight: false,
            skip_jwt_bearer_tokens: false,
            extra_jwt_issuers: Vec::new(),
            htpasswd_file: None,
            email_domains: vec!["*".to_string()],
            authenticated_emails_file: None,
            signature_key: None,
        }
    }
}

/// Identity header propagation flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct HeaderConfig {
    /// Pass `Authorization: Basic` and `X-Forwarded-*` upstream
    pub pass_basic_auth: bool,
    /// Password used in the passed basic-auth header
    pub basic_auth_password: Option<String>,
    /// Pass `X-Forwarded-User/Email/Preferred-Username` upstream
    pub pass_user_headers: bool,
    /// Use the email as the user where available
    pub prefer_email_to_user: bool,
    /// Pass `X-Forwarded-Access-Token` upstream
    pub pass_access_token: bool,
    /// Pass `Authorization: Bearer <id_token>` upstream
    pub pass_authorization_header: bool,
    /// Set `X-Auth-Request-*` response headers
    pub set_xauthrequest: bool,
    /// Set `Authorization: Bearer <id_token>` on the response
    pub set_authorization_header: bool,
    /// Set `Authorization: Basic` on the response
    pub set_basic_auth: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            pass_basic_auth: true,
            basic_auth_password: None,
            pass_user_headers: true,
            prefer_email_to_user: false,
            pass_access_token: false,
            pass_authorization_header: false,
            set_xauthrequest: false,
            set_authorization_header: false,
            set_basic_auth: false,
        }
    }
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

        // Merge environment variables (AUTHGATE_ prefix)
        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Check the configuration for values that cannot work at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        match self.cookie.secret.len() {
            16 | 24 | 32 => {}
            n => {
                return Err(Error::Config(format!(
                    "cookie.secret must be 16, 24 or 32 bytes, got {n}"
                )));
            }
        }

        if self.cookie.refresh >= self.cookie.expire {
            return Err(Error::Config(
                "cookie.refresh must be less than cookie.expire".to_string(),
            ));
        }

        if let Some(ref same_site) = self.cookie.same_site {
            if !matches!(same_site.to_ascii_lowercase().as_str(), "lax" | "strict" | "none") {
                return Err(Error::Config(format!("Invalid cookie.same_site: {same_site}")));
            }
        }

        if self.provider.client_id.is_empty() {
            return Err(Error::Config("provider.client_id is required".to_string()));
        }

        match self.provider.kind {
            ProviderKind::Oidc if self.provider.issuer_url.is_none() => {
                return Err(Error::Config(
                    "provider.issuer_url is required for OIDC providers".to_string(),
                ));
            }
            ProviderKind::OAuth2
                if self.provider.login_url.is_none() || self.provider.redeem_url.is_none() =>
            {
                return Err(Error::Config(
                    "provider.login_url and provider.redeem_url are required for OAuth2 providers"
                        .to_string(),
                ));
            }
            _ => {}
        }

        if self.session.store == SessionStoreKind::Redis {
            let redis = &self.session.redis;
            let ok = match redis.mode {
                RedisMode::Single => redis.connection_url.is_some(),
                RedisMode::Sentinel => {
                    redis.sentinel_master_name.is_some() && !redis.sentinel_connection_urls.is_empty()
                }
                RedisMode::Cluster => !redis.cluster_connection_urls.is_empty(),
            };
            if !ok {
                return Err(Error::Config(format!(
                    "session.redis is missing connection settings for {:?} mode",
                    redis.mode
                )));
            }
        }

        for upstream in &self.upstreams {
            url::Url::parse(&upstream.url)
                .map_err(|e| Error::Config(format!("Invalid upstream URL {}: {e}", upstream.url)))?;
        }

        TrustedIps::parse(&self.auth.trusted_ips)?;
        PathBypass::compile(&self.auth.skip_auth_regex, self.auth.skip_auth_strip_headers)?;
        BearerIssuer::parse_all(&self.auth.extra_jwt_issuers)?;
        if let Some(ref key) = self.auth.signature_key {
            SignatureKey::parse(key)?;
        }

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

    /// Expand ${VAR} and ${VAR:-default} patterns in secret-bearing values
    fn expand_env_vars(&mut self) {
        let re = &*ENV_VAR_PATTERN;

        self.cookie.secret = Self::expand_string(re, &self.cookie.secret);
        self.provider.client_secret = Self::expand_string(re, &self.provider.client_secret);

        for value in [
            &mut self.session.redis.password,
            &mut self.session.redis.sentinel_password,
            &mut self.session.redis.connection_url,
            &mut self.auth.signature_key,
            &mut self.headers.basic_auth_password,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(re, value);
        }

        for upstream in &mut self.upstreams {
            upstream.url = Self::expand_string(re, &upstream.url);
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

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "100ms", "30s", "5m", "168h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "168h" or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
