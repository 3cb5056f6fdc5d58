use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use eventing_core::Subscription;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

pub const ENV_PREFIX: &str = "EVENTING_";

pub const DEFAULT_NATS_ENDPOINT: &str = "nats://localhost:4222";

pub const DEFAULT_STREAM_NAME: &str = "kyma";

pub const DEFAULT_SUBJECT_PREFIX: &str = "kyma";

pub const DEFAULT_EVENT_TYPE_PREFIX: &str = "sap.kyma.custom";

/// JetStream limits stream names to 32 characters.
pub const MAX_STREAM_NAME_LENGTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub nats: NatsConfig,
    pub jetstream: JetStreamConfig,
    pub default_subscription: DefaultSubscriptionConfig,
    pub backend: BackendKind,
    pub event_type_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats: NatsConfig::default(),
            jetstream: JetStreamConfig::default(),
            default_subscription: DefaultSubscriptionConfig::default(),
            backend: BackendKind::default(),
            event_type_prefix: DEFAULT_EVENT_TYPE_PREFIX.to_string(),
            log_level: None,
            subscriptions: vec![],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let stream_name = &self.jetstream.stream_name;
        if stream_name.is_empty() {
            bail!("stream name cannot be empty");
        }
        if stream_name.len() > MAX_STREAM_NAME_LENGTH {
            bail!(
                "stream name \"{stream_name}\" is longer than {MAX_STREAM_NAME_LENGTH} characters"
            );
        }
        if self.jetstream.subject_prefix.is_empty() {
            bail!("jetstream subject prefix cannot be empty");
        }
        if self.default_subscription.max_in_flight == 0 {
            bail!("default max in-flight messages must be greater than zero");
        }
        if let Some(credentials) = &self.nats.credentials {
            credentials.validate()?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsConfig {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<NatsCredentials>,
    /// Unlimited reconnect attempts when not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnects: Option<usize>,
    pub reconnect_wait_ms: u64,
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_NATS_ENDPOINT.to_string(),
            credentials: None,
            max_reconnects: None,
            reconnect_wait_ms: 2000,
            connection_timeout_ms: 5000,
            request_timeout_ms: 5000,
        }
    }
}

impl NatsConfig {
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Upper bound for a single round-trip to the broker.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl NatsCredentials {
    /// Exactly one of nkey, token or username with password is allowed.
    pub fn validate(&self) -> Result<()> {
        match (
            &self.nkey,
            &self.token,
            &self.username,
            &self.password,
        ) {
            (Some(_), None, None, None)
            | (None, Some(_), None, None)
            | (None, None, Some(_), Some(_)) => Ok(()),
            _ => bail!("ambigious nats credentials configuration"),
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for NatsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsCredentials")
            .field("nkey", &self.nkey.as_ref().map(|_| "***"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JetStreamConfig {
    pub stream_name: String,
    /// Every subject captured by the stream starts with this prefix.
    pub subject_prefix: String,
    pub storage_type: StorageType,
    pub replicas: usize,
    pub retention_policy: RetentionPolicy,
    pub discard_policy: DiscardPolicy,
    /// Negative values mean unlimited, as on the NATS server.
    pub max_messages: i64,
    pub max_bytes: i64,
    pub max_messages_per_subject: i64,
    pub consumer_deliver_policy: ConsumerDeliverPolicy,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            storage_type: StorageType::default(),
            replicas: 1,
            retention_policy: RetentionPolicy::default(),
            discard_policy: DiscardPolicy::default(),
            max_messages: -1,
            max_bytes: -1,
            max_messages_per_subject: -1,
            consumer_deliver_policy: ConsumerDeliverPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultSubscriptionConfig {
    pub max_in_flight: u32,
    pub ack_wait_secs: u64,
    pub max_deliver: i64,
    pub nak_delay_secs: u64,
    pub idle_heartbeat_secs: u64,
}

impl Default for DefaultSubscriptionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            ack_wait_secs: 30,
            max_deliver: 100,
            nak_delay_secs: 30,
            idle_heartbeat_secs: 60,
        }
    }
}

impl DefaultSubscriptionConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn nak_delay(&self) -> Duration {
        Duration::from_secs(self.nak_delay_secs)
    }

    pub fn idle_heartbeat(&self) -> Duration {
        Duration::from_secs(self.idle_heartbeat_secs)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Jetstream,
    Nats,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StorageType {
    Memory,
    #[default]
    File,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiscardPolicy {
    #[default]
    New,
    Old,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerDeliverPolicy {
    All,
    Last,
    LastPerSubject,
    #[default]
    New,
}

#[derive(Parser, Serialize, Debug, Default)]
#[command(
    name = "eventing-backend",
    about = "Synchronizes Kyma subscriptions with NATS JetStream consumers",
    long_about = None,
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long, value_name = "PATH")]
    #[serde(skip_serializing)]
    config: Option<PathBuf>,

    #[arg(short = 'n', long, value_name = "URL")]
    #[serde(skip_serializing)]
    nats_endpoint: Option<String>,

    #[arg(short = 'b', long, value_name = "jetstream|nats")]
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<BackendKind>,

    #[arg(short = 'l', long, value_name = "LEVEL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

/// Defaults, then the YAML file, then `EVENTING_` environment variables, then the command line.
///
/// Nested keys are separated by a double underscore in environment variables, for example
/// `EVENTING_NATS__ENDPOINT`.
fn figment(cli: &Cli) -> Figment {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut figment = Figment::from(Serialized::defaults(Config::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(Serialized::defaults(cli));

    if let Some(endpoint) = &cli.nats_endpoint {
        figment = figment.merge(Serialized::default("nats.endpoint", endpoint));
    }
    figment
}

pub fn load_config() -> Result<Config> {
    let cli = Cli::parse();
    let config: Config = figment(&cli).extract()?;
    config.validate()?;
    Ok(config)
}
