//! Server configuration loaded from the environment

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Bearer token shared with the bot front-end and operator tooling.
    pub internal_api_token: String,
    pub db_max_connections: u32,
    /// Comma-separated CORS allowlist.
    pub allowed_origins: Vec<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("db_max_connections", &self.db_max_connections)
            .field("allowed_origins", &self.allowed_origins)
            .finish_non_exhaustive()
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let internal_api_token = required("INTERNAL_API_TOKEN")?;
        if internal_api_token.len() < 16 {
            return Err(ConfigError::Invalid {
                name: "INTERNAL_API_TOKEN",
                reason: "must be at least 16 characters".into(),
            });
        }

        let db_max_connections = match env::var("DB_MAX_CONNECTIONS") {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "DB_MAX_CONNECTIONS",
                reason: format!("'{raw}' is not a number"),
            })?,
            Err(_) => 10,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            internal_api_token,
            db_max_connections,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for name in [
            "DATABASE_URL",
            "BIND_ADDRESS",
            "INTERNAL_API_TOKEN",
            "DB_MAX_CONNECTIONS",
            "ALLOWED_ORIGINS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_apply() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/tunnelshop");
        env::set_var("INTERNAL_API_TOKEN", "0123456789abcdef");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.allowed_origins, vec!["http://localhost:3000"]);
        clear();
    }

    #[test]
    #[serial]
    fn test_token_is_required_and_long_enough() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/tunnelshop");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("INTERNAL_API_TOKEN"))
        ));

        env::set_var("INTERNAL_API_TOKEN", "short");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid { .. })));
        clear();
    }

    #[test]
    #[serial]
    fn test_bad_pool_size_is_rejected() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/tunnelshop");
        env::set_var("INTERNAL_API_TOKEN", "0123456789abcdef");
        env::set_var("DB_MAX_CONNECTIONS", "lots");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "DB_MAX_CONNECTIONS",
                ..
            })
        ));
        clear();
    }
}
