//! Kafka 配置模块
//!
//! `KafkaOptions` 在 `start` 之前构建，之后只读

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use courier_config::BrokerSettings;
use courier_errors::{BrokerError, BrokerResult};
use secrecy::{ExposeSecret, Secret};

/// 默认客户端 ID
pub const DEFAULT_CLIENT_ID: &str = "courier";

/// 默认生产者队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// 错误回调，接收不会返回给调用方的错误
pub type ErrorSink = Arc<dyn Fn(&BrokerError) + Send + Sync>;

/// Kafka 安全协议
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// 明文（默认）
    #[default]
    Plaintext,
    /// SSL
    Ssl,
    /// SASL 明文
    SaslPlaintext,
    /// SASL SSL
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    /// 是否启用 SASL 认证
    pub fn is_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }

    /// 对应的 SASL 协议，保留是否加密
    pub fn with_sasl(self) -> Self {
        match self {
            SecurityProtocol::Plaintext | SecurityProtocol::SaslPlaintext => {
                SecurityProtocol::SaslPlaintext
            }
            SecurityProtocol::Ssl | SecurityProtocol::SaslSsl => SecurityProtocol::SaslSsl,
        }
    }
}

impl FromStr for SecurityProtocol {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" => Ok(Self::Plaintext),
            "ssl" => Ok(Self::Ssl),
            "sasl_plaintext" => Ok(Self::SaslPlaintext),
            "sasl_ssl" => Ok(Self::SaslSsl),
            other => Err(BrokerError::configuration(format!(
                "unknown security protocol: {other}"
            ))),
        }
    }
}

/// SASL 认证机制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            other => Err(BrokerError::configuration(format!(
                "unknown SASL mechanism: {other}"
            ))),
        }
    }
}

/// SASL 配置
#[derive(Debug, Clone)]
pub struct SaslConfig {
    /// 认证机制
    pub mechanism: SaslMechanism,
    /// 用户名
    pub username: String,
    /// 密码
    pub password: Secret<String>,
}

impl SaslConfig {
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mechanism: SaslMechanism::Plain,
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }

    pub fn scram_sha256(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mechanism: SaslMechanism::ScramSha256,
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }

    pub fn scram_sha512(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mechanism: SaslMechanism::ScramSha512,
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }
}

/// `KafkaOptions::configure` 接受的单个选项
#[derive(Clone)]
pub enum KafkaOption {
    Addresses(Vec<String>),
    ClientId(String),
    QueueCapacity(usize),
    CloseTimeout(Duration),
    ConnectTimeout(Duration),
    SecurityProtocol(SecurityProtocol),
    Sasl(SaslConfig),
    Extra(String, String),
    ErrorSink(ErrorSink),
}

/// Broker 地址列表
pub fn addrs<I, S>(addresses: I) -> KafkaOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    KafkaOption::Addresses(addresses.into_iter().map(Into::into).collect())
}

/// 客户端 ID
pub fn client_id(id: impl Into<String>) -> KafkaOption {
    KafkaOption::ClientId(id.into())
}

/// Kafka 连接配置
#[derive(Clone)]
pub struct KafkaOptions {
    /// Broker 地址列表（保持顺序）
    pub addresses: Vec<String>,
    /// 客户端 ID
    pub client_id: String,
    /// 生产者队列容量，队列满时 emit 直接丢弃消息
    pub queue_capacity: usize,
    /// stop 时后台 flush 的最长时间
    pub close_timeout: Duration,
    /// 建立连接时元数据请求的超时
    pub connect_timeout: Duration,
    /// 安全协议
    pub security_protocol: SecurityProtocol,
    /// SASL 配置
    pub sasl: Option<SaslConfig>,
    /// 额外配置
    pub extra: HashMap<String, String>,
    /// 错误回调
    pub error_sink: Option<ErrorSink>,
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            close_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            security_protocol: SecurityProtocol::default(),
            sasl: None,
            extra: HashMap::new(),
            error_sink: None,
        }
    }
}

impl KafkaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次应用一组选项
    pub fn configure<I>(options: I) -> Self
    where
        I: IntoIterator<Item = KafkaOption>,
    {
        options.into_iter().fold(Self::default(), Self::apply)
    }

    fn apply(self, option: KafkaOption) -> Self {
        match option {
            KafkaOption::Addresses(addresses) => self.with_addresses(addresses),
            KafkaOption::ClientId(id) => self.with_client_id(id),
            KafkaOption::QueueCapacity(capacity) => self.with_queue_capacity(capacity),
            KafkaOption::CloseTimeout(timeout) => self.with_close_timeout(timeout),
            KafkaOption::ConnectTimeout(timeout) => self.with_connect_timeout(timeout),
            KafkaOption::SecurityProtocol(protocol) => self.with_security_protocol(protocol),
            KafkaOption::Sasl(sasl) => self.with_sasl(sasl),
            KafkaOption::Extra(key, value) => self.with_extra(key, value),
            KafkaOption::ErrorSink(sink) => Self {
                error_sink: Some(sink),
                ..self
            },
        }
    }

    /// 从配置文件中的 broker 配置构建
    pub fn from_settings(settings: &BrokerSettings) -> BrokerResult<Self> {
        let mut options = Self::new().with_addresses(settings.addresses.clone());

        if let Some(id) = &settings.client_id {
            options = options.with_client_id(id);
        }
        if let Some(capacity) = settings.queue_capacity {
            options = options.with_queue_capacity(capacity);
        }
        if let Some(ms) = settings.close_timeout_ms {
            options = options.with_close_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.connect_timeout_ms {
            options = options.with_connect_timeout(Duration::from_millis(ms));
        }
        if let Some(protocol) = &settings.security_protocol {
            options = options.with_security_protocol(protocol.parse()?);
        }
        if let Some(sasl) = &settings.sasl {
            options = options.with_sasl(SaslConfig {
                mechanism: sasl.mechanism.parse()?,
                username: sasl.username.clone(),
                password: sasl.password.clone(),
            });
        }
        for (key, value) in &settings.extra {
            options = options.with_extra(key, value);
        }

        Ok(options)
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 已配置 SASL 时协议会升级为对应的 `sasl_*`，与调用顺序无关
    pub fn with_security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.security_protocol = if self.sasl.is_some() {
            protocol.with_sasl()
        } else {
            protocol
        };
        self
    }

    pub fn with_sasl(mut self, sasl: SaslConfig) -> Self {
        self.sasl = Some(sasl);
        self.security_protocol = self.security_protocol.with_sasl();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_error_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&BrokerError) + Send + Sync + 'static,
    {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    /// 非空白的 broker 地址
    pub fn bootstrap_addresses(&self) -> Vec<&str> {
        self.addresses
            .iter()
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .collect()
    }

    /// 启动前校验，失败时 `start` 返回配置错误
    pub fn validate(&self) -> BrokerResult<()> {
        if self.bootstrap_addresses().is_empty() {
            return Err(BrokerError::configuration(
                "at least one broker address is required",
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(BrokerError::configuration("client id must not be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(BrokerError::configuration(
                "producer queue capacity must be greater than zero",
            ));
        }
        if self.sasl.is_some() && !self.security_protocol.is_sasl() {
            return Err(BrokerError::configuration(format!(
                "SASL credentials require a sasl_* security protocol, got {}",
                self.security_protocol.as_str()
            )));
        }
        Ok(())
    }

    /// 上报不会返回给调用方的错误
    pub(crate) fn report(&self, err: &BrokerError) {
        if let Some(sink) = &self.error_sink {
            sink(err);
        }
    }

    /// 转换为 rdkafka ClientConfig 的配置项
    pub fn to_client_config_entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            (
                "bootstrap.servers".to_string(),
                self.bootstrap_addresses().join(","),
            ),
            ("client.id".to_string(), self.client_id.clone()),
            (
                "security.protocol".to_string(),
                self.security_protocol.as_str().to_string(),
            ),
        ];

        if let Some(sasl) = &self.sasl {
            entries.push((
                "sasl.mechanism".to_string(),
                sasl.mechanism.as_str().to_string(),
            ));
            entries.push(("sasl.username".to_string(), sasl.username.clone()));
            entries.push((
                "sasl.password".to_string(),
                sasl.password.expose_secret().clone(),
            ));
        }

        for (key, value) in &self.extra {
            entries.push((key.clone(), value.clone()));
        }

        entries
    }
}

impl fmt::Debug for KafkaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaOptions")
            .field("addresses", &self.addresses)
            .field("client_id", &self.client_id)
            .field("queue_capacity", &self.queue_capacity)
            .field("close_timeout", &self.close_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("security_protocol", &self.security_protocol)
            .field("sasl", &self.sasl)
            .field("extra", &self.extra)
            .field("error_sink", &self.error_sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use secrecy::Secret;

    #[test]
    fn test_configure_applies_options_in_order() {
        let options = KafkaOptions::configure([
            addrs(["kafka-1:9092", "kafka-2:9092"]),
            client_id("orders-service"),
            KafkaOption::QueueCapacity(16),
            client_id("billing-service"),
        ]);

        assert_eq!(options.addresses, vec!["kafka-1:9092", "kafka-2:9092"]);
        assert_eq!(options.client_id, "billing-service");
        assert_eq!(options.queue_capacity, 16);
    }

    #[test]
    fn test_validate_requires_an_address() {
        let err = KafkaOptions::new().validate().unwrap_err();
        assert!(matches!(err, BrokerError::Configuration(_)));

        let blank = KafkaOptions::new().with_addresses(["  ", ""]);
        assert!(blank.validate().is_err());

        let ok = KafkaOptions::new().with_address("localhost:9092");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let options = KafkaOptions::new()
            .with_address("localhost:9092")
            .with_queue_capacity(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_sasl_upgrades_protocol_in_any_order() {
        let ssl_first = KafkaOptions::new()
            .with_security_protocol(SecurityProtocol::Ssl)
            .with_sasl(SaslConfig::plain("user", "pass"));
        assert_eq!(ssl_first.security_protocol, SecurityProtocol::SaslSsl);
        assert!(ssl_first
            .to_client_config_entries()
            .iter()
            .any(|(k, v)| k == "security.protocol" && v == "sasl_ssl"));

        let sasl_first = KafkaOptions::configure([
            addrs(["x:9092"]),
            KafkaOption::Sasl(SaslConfig::plain("user", "pass")),
            KafkaOption::SecurityProtocol(SecurityProtocol::Ssl),
        ]);
        assert_eq!(sasl_first.security_protocol, SecurityProtocol::SaslSsl);
        assert!(sasl_first.validate().is_ok());

        let plaintext = KafkaOptions::new().with_sasl(SaslConfig::plain("user", "pass"));
        assert_eq!(plaintext.security_protocol, SecurityProtocol::SaslPlaintext);
    }

    #[test]
    fn test_validate_rejects_sasl_without_sasl_protocol() {
        let mut options = KafkaOptions::new()
            .with_address("x:9092")
            .with_sasl(SaslConfig::plain("user", "pass"));
        options.security_protocol = SecurityProtocol::Ssl;

        let err = options.validate().unwrap_err();
        assert!(matches!(err, BrokerError::Configuration(_)));
        assert!(err.to_string().contains("ssl"));
    }

    #[test]
    fn test_client_config_entries() {
        let options = KafkaOptions::new()
            .with_addresses(["kafka-1:9092", " ", "kafka-2:9092"])
            .with_client_id("test-client")
            .with_sasl(SaslConfig::scram_sha256("user", "pass"))
            .with_extra("linger.ms", "5");

        let entries = options.to_client_config_entries();
        assert!(entries
            .iter()
            .any(|(k, v)| k == "bootstrap.servers" && v == "kafka-1:9092,kafka-2:9092"));
        assert!(entries
            .iter()
            .any(|(k, v)| k == "client.id" && v == "test-client"));
        assert!(entries
            .iter()
            .any(|(k, v)| k == "security.protocol" && v == "sasl_plaintext"));
        assert!(entries
            .iter()
            .any(|(k, v)| k == "sasl.mechanism" && v == "SCRAM-SHA-256"));
        assert!(entries.iter().any(|(k, v)| k == "linger.ms" && v == "5"));
    }

    #[test]
    fn test_from_settings() {
        let settings = BrokerSettings {
            addresses: vec!["x:9092".to_string()],
            client_id: Some("from-file".to_string()),
            queue_capacity: Some(64),
            close_timeout_ms: Some(500),
            connect_timeout_ms: None,
            security_protocol: Some("SASL_SSL".to_string()),
            sasl: Some(courier_config::SaslSettings {
                mechanism: "scram-sha-512".to_string(),
                username: "svc".to_string(),
                password: Secret::new("pw".to_string()),
            }),
            extra: HashMap::from([("acks".to_string(), "1".to_string())]),
        };

        let options = KafkaOptions::from_settings(&settings).unwrap();
        assert_eq!(options.addresses, vec!["x:9092"]);
        assert_eq!(options.client_id, "from-file");
        assert_eq!(options.queue_capacity, 64);
        assert_eq!(options.close_timeout, Duration::from_millis(500));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.security_protocol, SecurityProtocol::SaslSsl);
        assert_eq!(
            options.sasl.as_ref().map(|s| s.mechanism),
            Some(SaslMechanism::ScramSha512)
        );
        assert_eq!(options.extra.get("acks").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_from_settings_rejects_unknown_protocol() {
        let settings = BrokerSettings {
            addresses: vec!["x:9092".to_string()],
            client_id: None,
            queue_capacity: None,
            close_timeout_ms: None,
            connect_timeout_ms: None,
            security_protocol: Some("carrier-pigeon".to_string()),
            sasl: None,
            extra: HashMap::new(),
        };

        let err = KafkaOptions::from_settings(&settings).unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_error_sink_receives_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = KafkaOptions::new()
            .with_error_sink(move |err: &BrokerError| sink.lock().push(err.kind()));

        options.report(&BrokerError::subscription("orders", "boom"));

        assert_eq!(seen.lock().as_slice(), &["subscription"]);
        assert!(format!("{:?}", options).contains("error_sink: true"));
    }

    #[test]
    fn test_debug_redacts_sasl_password() {
        let options = KafkaOptions::new().with_sasl(SaslConfig::plain("user", "hunter2"));
        assert!(!format!("{:?}", options).contains("hunter2"));
    }
}
