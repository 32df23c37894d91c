// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! `ConnectionConfig` is the single validated value describing how the
//! supervisor reaches the broker and how persistently it retries. Validation
//! runs once, when a [`Connection`](crate::connection::Connection) is built.

use crate::{errors::AmqpError, exchange::ExchangeKind, logging::LogLevel};
use std::{env, time::Duration};
use url::Url;

pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-resilience";
pub const DEFAULT_HEARTBEAT: u16 = 3;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FALLBACK_REPLAY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PUBLISH_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const SUPPORTED_SCHEMES: [&str; 2] = ["amqp", "amqps"];

/// Settings for one logical broker connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub dsn: String,
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub connection_name: String,
    pub log_level: LogLevel,
    pub heartbeat: Option<u16>,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_connection_attempts: Option<u32>,
    pub fail_on_first_connect_error: bool,
    pub exit_process_on_failure: bool,
    pub fallback_replay_interval: Duration,
    pub publish_retry_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            dsn: String::new(),
            exchange_name: String::new(),
            exchange_kind: ExchangeKind::Topic,
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
            log_level: LogLevel::Info,
            heartbeat: Some(DEFAULT_HEARTBEAT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_connection_attempts: None,
            fail_on_first_connect_error: false,
            exit_process_on_failure: false,
            fallback_replay_interval: DEFAULT_FALLBACK_REPLAY_INTERVAL,
            publish_retry_interval: DEFAULT_PUBLISH_RETRY_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    pub fn new(dsn: &str, exchange_name: &str, connection_name: &str) -> ConnectionConfig {
        ConnectionConfig {
            dsn: dsn.to_owned(),
            exchange_name: exchange_name.to_owned(),
            connection_name: connection_name.to_owned(),
            ..Default::default()
        }
    }

    /// Reads `RABBITMQ_DSN`, `RABBITMQ_EXCHANGE`, `RABBITMQ_CONNECTION_NAME`
    /// and `LOG_LEVEL`. The DSN and the exchange are required.
    pub fn from_env() -> Result<ConnectionConfig, AmqpError> {
        let dsn = env::var("RABBITMQ_DSN")
            .map_err(|_| AmqpError::invalid("RABBITMQ_DSN is not set"))?;

        let mut cfg = ConnectionConfig {
            dsn,
            ..Default::default()
        };

        if let Ok(exchange) = env::var("RABBITMQ_EXCHANGE") {
            cfg.exchange_name = exchange;
        }

        if let Ok(name) = env::var("RABBITMQ_CONNECTION_NAME") {
            cfg.connection_name = name;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            cfg.log_level = level.parse()?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<u16>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Gives up after `max` consecutive failed attempts instead of retrying forever.
    pub fn with_max_connection_attempts(mut self, max: u32) -> Self {
        self.max_connection_attempts = Some(max);
        self
    }

    /// Surfaces hard transport errors raised before the first successful
    /// connection instead of retrying them. Timeouts are always retried.
    pub fn fail_on_first_connect_error(mut self) -> Self {
        self.fail_on_first_connect_error = true;
        self
    }

    /// Exits the process once the supervisor reaches a terminal failure.
    pub fn exit_process_on_failure(mut self) -> Self {
        self.exit_process_on_failure = true;
        self
    }

    pub fn with_fallback_replay_interval(mut self, interval: Duration) -> Self {
        self.fallback_replay_interval = interval;
        self
    }

    pub fn with_publish_retry_interval(mut self, interval: Duration) -> Self {
        self.publish_retry_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        validate_dsn(&self.dsn)?;

        if self.exchange_name.trim().is_empty() {
            return Err(AmqpError::invalid("exchange name must not be empty"));
        }

        if self.connect_timeout.is_zero() {
            return Err(AmqpError::invalid("connect timeout must be greater than zero"));
        }

        if self.max_connection_attempts == Some(0) {
            return Err(AmqpError::invalid(
                "max connection attempts must be greater than zero",
            ));
        }

        if self.fallback_replay_interval.is_zero() {
            return Err(AmqpError::invalid(
                "fallback replay interval must be greater than zero",
            ));
        }

        Ok(())
    }

    /// The address handed to the transport, with the heartbeat query pair
    /// appended unless the DSN already carries one.
    pub fn connection_uri(&self) -> Result<String, AmqpError> {
        let mut url = validate_dsn(&self.dsn)?;

        if let Some(heartbeat) = self.heartbeat {
            let present = url.query_pairs().any(|(key, _)| key == "heartbeat");
            if !present {
                url.query_pairs_mut()
                    .append_pair("heartbeat", &heartbeat.to_string());
            }
        }

        Ok(url.to_string())
    }

    /// Properties advertised to the broker on connect.
    pub fn client_properties(&self) -> ClientProperties {
        ClientProperties {
            product: format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            connection_name: self.connection_name.clone(),
        }
    }
}

/// Identity reported to the broker when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProperties {
    pub product: String,
    pub connection_name: String,
}

/// Parses the broker address. Only `amqp` and `amqps` URLs are accepted.
pub fn validate_dsn(dsn: &str) -> Result<Url, AmqpError> {
    let url = Url::parse(dsn).map_err(|_| AmqpError::InvalidDsn(dsn.to_owned()))?;

    let missing_host = url.host_str().map_or(true, str::is_empty);

    if !SUPPORTED_SCHEMES.contains(&url.scheme()) || missing_host {
        return Err(AmqpError::InvalidDsn(dsn.to_owned()));
    }

    Ok(url)
}
