//! Configuration module for environment variable parsing.
//!
//! Every setting has a default so the worker starts against a local
//! RabbitMQ and SMTP server without any environment at all.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::queue::DEFAULT_QUEUE;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// RabbitMQ connection and consumer settings
    pub broker: BrokerConfig,

    /// Outbound mail transport settings (used by the SMTP health probe)
    pub mail: MailConfig,

    /// Port for the health server to listen on
    pub port: u16,

    /// Path of the JSON-lines activity log
    pub activity_log_path: String,

    /// Interval between background stash flush attempts
    pub stash_flush_interval: Duration,
}

/// RabbitMQ settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,

    /// Queue drained by the background consumer
    pub queue: String,

    /// Maximum number of unacknowledged deliveries held by the consumer
    pub prefetch_count: u16,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailTls {
    /// Plaintext session, no TLS at all
    #[default]
    None,
    /// Plaintext connect, then upgrade with STARTTLS before login
    StartTls,
    /// TLS from the first byte (SMTPS)
    Tls,
}

impl MailTls {
    /// Conventional port for the mode.
    pub fn default_port(self) -> u16 {
        match self {
            MailTls::None => 25,
            MailTls::StartTls => 587,
            MailTls::Tls => 465,
        }
    }
}

impl FromStr for MailTls {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "plain" => Ok(MailTls::None),
            "starttls" => Ok(MailTls::StartTls),
            "tls" | "smtps" => Ok(MailTls::Tls),
            other => Err(format!("unknown SMTP TLS mode: {other}")),
        }
    }
}

/// SMTP settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub tls: MailTls,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Address the health probe sends its test message from and to
    pub probe_address: String,

    /// Upper bound for a whole probe round trip
    pub timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            broker: BrokerConfig::from_env(),
            mail: MailConfig::from_env(),
            port: parse_or("PORT", 8080),
            activity_log_path: env::var("ACTIVITY_LOG_PATH")
                .unwrap_or_else(|_| "activity-log.jsonl".to_string()),
            stash_flush_interval: Duration::from_secs(parse_or("STASH_FLUSH_INTERVAL_SECS", 30)),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        BrokerConfig {
            host: env::var("RABBITMQ_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: parse_or("RABBITMQ_PORT", 5672),
            username: env::var("RABBITMQ_USERNAME").unwrap_or_else(|_| "guest".to_string()),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or_else(|_| "guest".to_string()),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or_else(|_| "/".to_string()),
            queue: env::var("RABBITMQ_QUEUE").unwrap_or_else(|_| DEFAULT_QUEUE.to_string()),
            prefetch_count: non_zero_or("RABBITMQ_PREFETCH", 10),
        }
    }

    /// Build the `amqp://` URL lapin connects to.
    ///
    /// Credentials and the vhost are percent-encoded, so passwords containing
    /// `@` or `/` and the default `/` vhost survive the round trip.
    pub fn amqp_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))?;
        url.set_username(&self.username)
            .map_err(|_| url::ParseError::EmptyHost)?;
        url.set_password(Some(&self.password))
            .map_err(|_| url::ParseError::EmptyHost)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .clear()
            .push(&self.vhost);
        Ok(url)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            prefetch_count: 10,
        }
    }
}

impl MailConfig {
    pub fn from_env() -> Self {
        let username = non_empty("SMTP_USERNAME");
        let probe_address = non_empty("SMTP_FROM")
            .or_else(|| username.clone())
            .unwrap_or_else(|| "healthcheck@localhost".to_string());

        let tls = parse_or("SMTP_TLS", MailTls::None);

        MailConfig {
            host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: parse_or("SMTP_PORT", tls.default_port()),
            tls,
            username,
            password: non_empty("SMTP_PASSWORD"),
            probe_address,
            timeout: Duration::from_millis(parse_or("SMTP_TIMEOUT_MS", 5000)),
        }
    }
}

/// Parse a variable, falling back to `default` when it is unset or malformed.
fn parse_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, default = ?default, "Invalid value, using default");
            default
        }
    }
}

/// Like [`parse_or`], but 0 also falls back to `default`. A prefetch count of
/// 0 means "unlimited" to the broker.
fn non_zero_or(name: &str, default: u16) -> u16 {
    match parse_or(name, default) {
        0 => {
            warn!(env_var = name, default = default, "Zero is not allowed, using default");
            default
        }
        value => value,
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
