//! Processor configuration structures

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::{ProcessorError, ProcessorResult};
use crate::retry::RetryPolicy;

/// Client properties that may be passed through to the broker client
pub const ALLOWED_CLIENT_PROPERTIES: &[&str] = &[
    // Compression
    "compression.type",
    "compression.level",
    // Fetch
    "fetch.min.bytes",
    "fetch.wait.max.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    // Requests
    "request.timeout.ms",
    "metadata.max.age.ms",
    "socket.timeout.ms",
    // Group membership
    "session.timeout.ms",
    "heartbeat.interval.ms",
    "max.poll.interval.ms",
    "partition.assignment.strategy",
    // Producer
    "linger.ms",
    "batch.size",
    "message.timeout.ms",
    "queue.buffering.max.messages",
    "enable.idempotence",
    "acks",
    // Connection
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "socket.keepalive.enable",
    "ssl.ca.location",
    // Monitoring
    "statistics.interval.ms",
];

/// Transport security of the broker connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
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

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL authentication mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
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

/// Broker connection shared by the consumer and the producer
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Comma-separated broker addresses
    pub bootstrap_servers: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub security_protocol: SecurityProtocol,
    pub sasl_mechanism: Option<SaslMechanism>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            username: None,
            password: None,
            security_protocol: SecurityProtocol::Plaintext,
            sasl_mechanism: None,
        }
    }
}

impl ConnectionSettings {
    /// Client properties for these settings
    pub fn client_properties(&self) -> Vec<(&'static str, String)> {
        let mut properties = vec![
            ("bootstrap.servers", self.bootstrap_servers.clone()),
            ("security.protocol", self.security_protocol.as_str().to_string()),
        ];
        if let Some(mechanism) = self.sasl_mechanism {
            properties.push(("sasl.mechanism", mechanism.as_str().to_string()));
        }
        if let Some(username) = &self.username {
            properties.push(("sasl.username", username.clone()));
        }
        if let Some(password) = &self.password {
            properties.push(("sasl.password", password.clone()));
        }
        properties
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("bootstrap_servers", &self.bootstrap_servers)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .finish()
    }
}

/// Where a new group member starts when nothing was committed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Output topic, created on activation if it does not exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTopic {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_partitions")]
    pub replication_factor: i32,
    /// Topic-level configs such as `cleanup.policy`
    #[serde(default)]
    pub configs: HashMap<String, String>,
}

fn default_partitions() -> i32 {
    1
}

impl OutputTopic {
    /// Single-partition, single-replica topic
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 1,
            replication_factor: 1,
            configs: HashMap::new(),
        }
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configs.insert(key.into(), value.into());
        self
    }
}

/// Processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorOptions {
    /// Broker connection
    pub connection: ConnectionSettings,

    /// Client id, also the key of the processor in a gap tracker
    pub client_id: String,

    /// Consumer group id; defaults to the client id
    pub group_id: Option<String>,

    /// Topics to consume; duplicates are ignored
    pub input_topics: Vec<String>,

    /// Default destination of outputs
    pub output_topic: Option<OutputTopic>,

    /// Longest single wait for a record, in milliseconds
    pub poll_timeout_ms: u64,

    /// Interval of the periodic commit, in milliseconds; 0 disables it
    pub commit_interval_ms: u64,

    /// Budget for draining the producer, in milliseconds
    pub flush_timeout_ms: u64,

    /// Maximum unacknowledged deliveries
    pub max_in_flight: usize,

    /// Start position without a committed offset
    pub auto_offset_reset: OffsetReset,

    /// Retries of commits failing with a transient error
    pub commit_retry: RetryPolicy,

    /// Extra client properties, restricted to [`ALLOWED_CLIENT_PROPERTIES`]
    pub client_properties: HashMap<String, String>,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            client_id: String::new(),
            group_id: None,
            input_topics: Vec::new(),
            output_topic: None,
            poll_timeout_ms: 1000,
            commit_interval_ms: 5000,
            flush_timeout_ms: 30_000,
            max_in_flight: 1000,
            auto_offset_reset: OffsetReset::Earliest,
            commit_retry: RetryPolicy::default(),
            client_properties: HashMap::new(),
        }
    }
}

impl ProcessorOptions {
    /// Parse and validate options from YAML
    pub fn from_yaml_str(yaml: &str) -> ProcessorResult<Self> {
        let options: ProcessorOptions = serde_yaml::from_str(yaml)
            .map_err(|e| ProcessorError::Config(format!("invalid YAML: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Effective group id
    pub fn group_id(&self) -> &str {
        match &self.group_id {
            Some(group_id) if !group_id.is_empty() => group_id,
            _ => &self.client_id,
        }
    }

    /// Input topics in first-occurrence order without duplicates
    pub fn input_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::with_capacity(self.input_topics.len());
        for topic in &self.input_topics {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }

    /// Name of the default output topic
    pub fn output_topic_name(&self) -> Option<&str> {
        self.output_topic.as_ref().map(|topic| topic.name.as_str())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// `None` when periodic commits are disabled
    pub fn commit_interval(&self) -> Option<Duration> {
        (self.commit_interval_ms > 0).then(|| Duration::from_millis(self.commit_interval_ms))
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ProcessorResult<()> {
        let invalid = |message: String| Err(ProcessorError::Config(message));

        if self.client_id.trim().is_empty() {
            return invalid("client id cannot be empty".into());
        }
        if self.connection.bootstrap_servers.trim().is_empty() {
            return invalid("bootstrap servers cannot be empty".into());
        }
        if self.connection.security_protocol.uses_sasl()
            && (self.connection.username.is_none() || self.connection.password.is_none())
        {
            return invalid(format!(
                "security protocol '{}' requires a username and a password",
                self.connection.security_protocol.as_str()
            ));
        }
        if self.input_topics.is_empty() {
            return invalid("at least one input topic is required".into());
        }
        if self.input_topics.iter().any(|topic| topic.trim().is_empty()) {
            return invalid("input topic names cannot be empty".into());
        }
        if let Some(output) = &self.output_topic {
            if output.name.trim().is_empty() {
                return invalid("output topic name cannot be empty".into());
            }
            if output.partitions < 1 || output.replication_factor < 1 {
                return invalid(format!(
                    "output topic '{}' needs at least one partition and one replica",
                    output.name
                ));
            }
        }
        if self.poll_timeout_ms == 0 {
            return invalid("poll timeout must be greater than 0".into());
        }
        if self.flush_timeout_ms == 0 {
            return invalid("flush timeout must be greater than 0".into());
        }
        if self.max_in_flight == 0 {
            return invalid("max in-flight must be greater than 0".into());
        }
        if let Some(key) = self
            .client_properties
            .keys()
            .find(|key| !ALLOWED_CLIENT_PROPERTIES.contains(&key.as_str()))
        {
            return invalid(format!(
                "client property '{key}' is not allowed; allowed properties: {ALLOWED_CLIENT_PROPERTIES:?}"
            ));
        }
        Ok(())
    }
}
