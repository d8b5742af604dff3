use config::{Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub invite_store: InviteStoreConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    pub app_base_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub autocreate: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_db_timeout")]
    pub timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InviteStoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InviteStoreConfig {
    #[serde(default = "default_invite_backend")]
    pub backend: InviteStoreBackend,
    #[serde(default = "default_invite_ttl")]
    pub ttl_secs: i64,
    #[serde(default = "default_invite_grace")]
    pub grace_secs: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for InviteStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_invite_backend(),
            ttl_secs: default_invite_ttl(),
            grace_secs: default_invite_grace(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_url_ttl")]
    pub url_ttl_secs: u64,
}

impl StorageConfig {
    /// Endpoint без схемы дополняется http/https в зависимости от `secure`.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.clone()
        } else if self.secure {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_chat_api")]
    pub api_url: String,
    /// Таймаут запроса к Bot API в секундах
    #[serde(default = "default_chat_timeout")]
    pub timeout: u64,
    #[serde(default = "default_chat_concurrency")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_url: default_chat_api(),
            timeout: default_chat_timeout(),
            max_concurrent: default_chat_concurrency(),
            webhook_secret: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_true")]
    pub include_manager_in_split: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            include_manager_in_split: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_gateway_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_max_connections() -> u32 {
    10
}
fn default_db_timeout() -> u64 {
    5
}
fn default_invite_backend() -> InviteStoreBackend {
    InviteStoreBackend::Postgres
}
fn default_invite_ttl() -> i64 {
    24 * 60 * 60
}
fn default_invite_grace() -> i64 {
    60 * 60
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_url_ttl() -> u64 {
    3600
}
fn default_chat_api() -> String {
    "https://api.telegram.org".to_string()
}
fn default_chat_timeout() -> u64 {
    30
}
fn default_chat_concurrency() -> usize {
    8
}
fn default_token_ttl() -> i64 {
    7 * 24 * 60 * 60
}
fn default_true() -> bool {
    true
}
fn default_gateway_timeout() -> u64 {
    30
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting: {0}")]
    Invalid(&'static str),
}

impl Config {
    /// Читает `config.yaml` (или `CONFIG_PATH`) и переменные окружения `APP__*`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Missing("auth.jwt_secret"));
        }
        if self.app_base_url.trim().is_empty() {
            return Err(ConfigError::Missing("app_base_url"));
        }
        // деление счёта должно закончиться раньше таймаута запроса
        if self.server.request_timeout_secs < 2 {
            return Err(ConfigError::Invalid(
                "server.request_timeout_secs must be at least 2",
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.database
        )
    }
}
