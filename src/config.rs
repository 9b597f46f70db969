use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Server settings, read from the environment after `.env` is loaded.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub jwt_secret: String,
    pub bind_address: String,
    pub port: u16,
    pub cors_origin: String,
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        dotenv::dotenv().ok();

        Ok(Config {
            database_url: var_or("DATABASE_URL", "sqlite://letschat.db"),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 16)?,
            jwt_secret: dotenv::var("JWT_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .ok_or(ConfigError::Missing("JWT_SECRET"))?,
            bind_address: var_or("BIND_ADDRESS", "0.0.0.0"),
            port: parse_var("PORT", 4000)?,
            cors_origin: var_or("CORS_ORIGIN", "http://localhost:5173"),
            json_logs: matches!(
                dotenv::var("LOG_JSON").as_deref(),
                Ok("1") | Ok("true")
            ),
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        addr.parse().map_err(|_| ConfigError::Invalid {
            key: "BIND_ADDRESS",
            value: addr,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    dotenv::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match dotenv::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
