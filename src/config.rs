// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Settings are layered: built-in defaults, then an optional
//! `config/default.toml`, then environment variables prefixed with `PEDIDOS`
//! and split on `__` (`PEDIDOS__RABBITMQ__HOST=broker`). A `.env` file in the
//! working directory is loaded into the environment first.

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppSettings {
    /// Used as the AMQP connection name and in log lines
    pub name: String,
    pub log_level: String,
    /// When set, the payment handler fails every message
    pub simulate_failure: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            name: "pedidos".to_owned(),
            log_level: "info".to_owned(),
            simulate_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQSettings {
    fn default() -> Self {
        RabbitMQSettings {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

impl RabbitMQSettings {
    /// AMQP URI for these settings. Credentials and vhost are
    /// percent-encoded, so the default vhost `/` becomes `%2F`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub rabbitmq: RabbitMQSettings,
}

impl AppConfig {
    pub fn load() -> Result<AppConfig, AmqpError> {
        dotenvy::dotenv().ok();

        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("PEDIDOS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}
