use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Service Configuration
// ============================================================================
//
// Loaded once from the environment at startup. Untyped values fall back to
// defaults; typed values that are present but unparsable are an error.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// When stream offsets are committed relative to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverySemantics {
    /// Offsets advance on read. A batch that fails to persist is lost.
    #[default]
    AtMostOnce,
    /// Offsets advance only after the batch commits; a failed batch stops the
    /// consumer so the stream redelivers it after restart.
    AtLeastOnce,
}

impl FromStr for DeliverySemantics {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "at-most-once" | "at_most_once" => Ok(Self::AtMostOnce),
            "at-least-once" | "at_least_once" => Ok(Self::AtLeastOnce),
            other => Err(format!("expected at-most-once or at-least-once, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode=disable",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub http_port: u16,
    pub shutdown_timeout: Duration,
    /// Orders per persistence transaction. Always at least 1.
    pub batch_size: usize,
    pub delivery_semantics: DeliverySemantics,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`, `DB_MAX_CONNECTIONS`
    /// - `KAFKA_BROKERS` (comma separated), `KAFKA_TOPIC`, `KAFKA_GROUP_ID`
    /// - `HTTP_PORT` (default: 8081)
    /// - `SHUTDOWN_TIMEOUT` (default: 5s)
    /// - `BATCH_SIZE` (default: 1)
    /// - `DELIVERY_SEMANTICS`: at-most-once (default) or at-least-once
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let database = DatabaseConfig {
            host: string("DB_HOST", "localhost"),
            port: parse(&lookup, "DB_PORT", 5432)?,
            user: string("DB_USER", "orders_user"),
            password: string("DB_PASSWORD", "securepassword"),
            name: string("DB_NAME", "orders_db"),
            max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", 20)?,
        };

        let kafka = KafkaConfig {
            brokers: string("KAFKA_BROKERS", "localhost:9092")
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect(),
            topic: string("KAFKA_TOPIC", "orders"),
            group_id: string("KAFKA_GROUP_ID", "orders_group"),
        };

        let shutdown_timeout = match lookup("SHUTDOWN_TIMEOUT").filter(|v| !v.is_empty()) {
            Some(raw) => parse_duration(&raw).ok_or_else(|| ConfigError::Invalid {
                name: "SHUTDOWN_TIMEOUT",
                value: raw.clone(),
                reason: "expected e.g. 5s, 500ms or a number of seconds".to_string(),
            })?,
            None => Duration::from_secs(5),
        };

        let batch_size: usize = parse(&lookup, "BATCH_SIZE", 1)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database,
            kafka,
            http_port: parse(&lookup, "HTTP_PORT", 8081)?,
            shutdown_timeout,
            batch_size,
            delivery_semantics: parse(&lookup, "DELIVERY_SEMANTICS", DeliverySemantics::AtMostOnce)?,
        })
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name).filter(|v| !v.is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = raw.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs);
    }
    raw.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.kafka.brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(config.kafka.topic, "orders");
        assert_eq!(config.http_port, 8081);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.delivery_semantics, DeliverySemantics::AtMostOnce);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("KAFKA_BROKERS", "k1:9092, k2:9092"),
            ("BATCH_SIZE", "50"),
            ("SHUTDOWN_TIMEOUT", "1500ms"),
            ("DELIVERY_SEMANTICS", "at-least-once"),
        ])
        .unwrap();

        assert_eq!(config.kafka.brokers, vec!["k1:9092".to_string(), "k2:9092".to_string()]);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(1500));
        assert_eq!(config.delivery_semantics, DeliverySemantics::AtLeastOnce);
    }

    #[test]
    fn test_invalid_typed_values_are_errors() {
        assert!(config_from(&[("DB_PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("BATCH_SIZE", "0")]).is_err());
        assert!(config_from(&[("SHUTDOWN_TIMEOUT", "soon")]).is_err());
        assert!(config_from(&[("DELIVERY_SEMANTICS", "exactly-once")]).is_err());
    }

    #[test]
    fn test_overflowing_minute_timeout_is_error() {
        let err = config_from(&[("SHUTDOWN_TIMEOUT", "18446744073709551615m")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SHUTDOWN_TIMEOUT", .. }));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_database_url() {
        let config = config_from(&[("DB_HOST", "db"), ("DB_NAME", "orders")]).unwrap();
        assert_eq!(
            config.database.url(),
            "postgres://orders_user:securepassword@db:5432/orders?sslmode=disable"
        );
    }
}
