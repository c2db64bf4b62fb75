//! courier-config - 配置加载库

use std::collections::HashMap;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),
}

/// SASL 认证配置
#[derive(Debug, Clone, Deserialize)]
pub struct SaslSettings {
    /// PLAIN / SCRAM-SHA-256 / SCRAM-SHA-512
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
    pub username: String,
    pub password: Secret<String>,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

/// Broker 连接配置
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// Broker 地址列表
    #[serde(default)]
    pub addresses: Vec<String>,
    /// 客户端 ID
    pub client_id: Option<String>,
    /// 生产者队列容量
    pub queue_capacity: Option<usize>,
    /// 关闭时后台 flush 的最长时间（毫秒）
    pub close_timeout_ms: Option<u64>,
    /// 建立连接时元数据请求的超时（毫秒）
    pub connect_timeout_ms: Option<u64>,
    /// plaintext / ssl / sasl_plaintext / sasl_ssl
    pub security_protocol: Option<String>,
    pub sasl: Option<SaslSettings>,
    /// 透传给 librdkafka 的额外配置
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct CourierConfig {
    pub app_name: String,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    pub broker: BrokerSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// relay 订阅并转发到日志的频道
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_app_env() -> String {
    "development".to_string()
}

impl CourierConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 依次合并 `default.toml`、`{APP_ENV}.toml` 与 `COURIER_` 前缀的环境变量，
    /// 嵌套字段用 `__` 分隔（如 `COURIER_BROKER__CLIENT_ID`）
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| default_app_env());

        let config: Self = Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("COURIER_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }
}
