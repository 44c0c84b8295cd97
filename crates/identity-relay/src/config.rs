//! Relay configuration from environment variables

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing or empty
    #[error("{0} environment variable is required")]
    MissingVar(&'static str),
}

/// Configuration for the outbox relay service.
///
/// This is a minimal config that only includes what the relay needs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// PostgreSQL DSN
    pub database_url: String,

    /// AMQP URL
    pub rabbitmq_url: String,

    /// Both the AMQP queue name and the `event_type` dispatch filter
    pub baby_queue_name: String,
}

impl RelayConfig {
    /// Load the configuration from the process environment.
    ///
    /// `DB_CONNECTION_STRING` and `RABBITMQ_URL` are required;
    /// `BABY_QUEUE_NAME` defaults to `babies`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DB_CONNECTION_STRING")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingVar("DB_CONNECTION_STRING"))?;

        let rabbitmq_url = lookup("RABBITMQ_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingVar("RABBITMQ_URL"))?;

        let baby_queue_name = lookup("BABY_QUEUE_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "babies".to_string());

        Ok(Self {
            database_url,
            rabbitmq_url,
            baby_queue_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_loads_full_config() {
        let config = RelayConfig::from_lookup(env(&[
            ("DB_CONNECTION_STRING", "postgres://localhost/identity"),
            ("RABBITMQ_URL", "amqp://localhost"),
            ("BABY_QUEUE_NAME", "maternity"),
        ]))
        .unwrap();

        assert_eq!(config.database_url, "postgres://localhost/identity");
        assert_eq!(config.rabbitmq_url, "amqp://localhost");
        assert_eq!(config.baby_queue_name, "maternity");
    }

    #[test]
    fn test_queue_name_defaults_to_babies() {
        let config = RelayConfig::from_lookup(env(&[
            ("DB_CONNECTION_STRING", "postgres://localhost/identity"),
            ("RABBITMQ_URL", "amqp://localhost"),
        ]))
        .unwrap();

        assert_eq!(config.baby_queue_name, "babies");
    }

    #[test]
    fn test_missing_database_url_fails() {
        let result = RelayConfig::from_lookup(env(&[("RABBITMQ_URL", "amqp://localhost")]));
        assert!(matches!(
            result,
            Err(ConfigError::MissingVar("DB_CONNECTION_STRING"))
        ));
    }

    #[test]
    fn test_missing_rabbitmq_url_fails() {
        let result = RelayConfig::from_lookup(env(&[(
            "DB_CONNECTION_STRING",
            "postgres://localhost/identity",
        )]));
        assert!(matches!(result, Err(ConfigError::MissingVar("RABBITMQ_URL"))));
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let result = RelayConfig::from_lookup(env(&[
            ("DB_CONNECTION_STRING", ""),
            ("RABBITMQ_URL", "amqp://localhost"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::MissingVar("DB_CONNECTION_STRING"))
        ));
    }
}
