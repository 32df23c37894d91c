// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Output
//!
//! Every component logs through `tracing`. This module only decides whether a
//! default `tracing-subscriber` is installed and at which level.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::{fmt, str::FromStr};
use tracing_subscriber::EnvFilter;

/// Verbosity requested through the connection configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Do not install any subscriber.
    None,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level, `None` when logging is off.
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            LogLevel::None => None,
            LogLevel::Error => Some("error"),
            LogLevel::Warn => Some("warn"),
            LogLevel::Info => Some("info"),
            LogLevel::Debug => Some("debug"),
            LogLevel::Trace => Some("trace"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LogLevel::None),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "verbose" | "debug" => Ok(LogLevel::Debug),
            "silly" | "trace" => Ok(LogLevel::Trace),
            other => Err(AmqpError::invalid(format!("unknown log level `{other}`"))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive().unwrap_or("none"))
    }
}

/// Installs a fmt subscriber filtered at `level`.
///
/// `RUST_LOG` takes precedence over the configured level. Nothing happens when
/// the level is [`LogLevel::None`] or when the application already installed
/// its own global subscriber.
pub fn install(level: LogLevel) {
    let Some(directive) = level.directive() else {
        return;
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
