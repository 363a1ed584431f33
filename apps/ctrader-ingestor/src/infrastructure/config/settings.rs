//! Ingestor Configuration Settings
//!
//! Configuration types for the ingestor, loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{LivenessConfig, RestartConfig};
use crate::domain::symbols::SymbolAliases;
use crate::infrastructure::ctrader::{
    ClientConfig, Credentials, CredentialsError, DEFAULT_PORT, DEMO_HOST, Endpoint,
    KeepaliveConfig, LIVE_HOST, Timeouts,
};

/// Symbols streamed when `CTRADER_SYMBOLS` is unset.
pub const DEFAULT_SYMBOLS: [&str; 8] = [
    "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD", "USDZAR",
];

/// Broker environment (demo vs live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerEnvironment {
    /// Demo accounts.
    #[default]
    Demo,
    /// Live accounts.
    Live,
}

impl BrokerEnvironment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "live" => Self::Live,
            _ => Self::Demo,
        }
    }

    /// Default Open API host for this environment.
    #[must_use]
    pub const fn host(&self) -> &'static str {
        match self {
            Self::Demo => DEMO_HOST,
            Self::Live => LIVE_HOST,
        }
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Live => "live",
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Demo or live.
    pub environment: BrokerEnvironment,
    /// Open API host.
    pub host: String,
    /// Open API port.
    pub port: u16,
    /// Whether to wrap the socket in TLS.
    pub tls: bool,
    /// Socket open plus authentication.
    pub connect_timeout: Duration,
    /// History and symbol-list requests.
    pub request_timeout: Duration,
    /// Outbound heartbeat interval.
    pub keepalive_interval: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            environment: BrokerEnvironment::Demo,
            host: DEMO_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: true,
            connect_timeout: timeouts.connect,
            request_timeout: timeouts.request,
            keepalive_interval: KeepaliveConfig::default().interval,
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

/// Complete ingestor configuration.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Open API credentials.
    pub credentials: Credentials,
    /// Broker connection settings.
    pub broker: BrokerSettings,
    /// Caller-facing names to stream.
    pub symbols: Vec<String>,
    /// Caller name to broker name overrides.
    pub aliases: SymbolAliases,
    /// Redis settings.
    pub redis: RedisSettings,
    /// Liveness heartbeat schedule.
    pub heartbeat: LivenessConfig,
    /// Session restart backoff.
    pub restart: RestartConfig,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl IngestorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or empty, or a
    /// value cannot be used.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let client_id = required(&lookup, "CTRADER_CLIENT_ID")?;
        let client_secret = required(&lookup, "CTRADER_CLIENT_SECRET")?;
        let access_token = required(&lookup, "CTRADER_ACCESS_TOKEN")?;
        let account_id = required(&lookup, "CTRADER_ACCOUNT_ID")?;
        let credentials = Credentials::new(client_id, client_secret, access_token, &account_id)?;

        let environment = lookup("CTRADER_ENV")
            .map(|s| BrokerEnvironment::from_str_case_insensitive(&s))
            .unwrap_or_default();
        let defaults = BrokerSettings::default();

        let broker = BrokerSettings {
            environment,
            host: lookup("CTRADER_HOST")
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| environment.host().to_string()),
            port: parse_or(&lookup, "CTRADER_PORT", defaults.port),
            tls: lookup("CTRADER_TLS").map_or(defaults.tls, |v| parse_bool(&v, defaults.tls)),
            connect_timeout: secs_or(&lookup, "CTRADER_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            request_timeout: secs_or(&lookup, "CTRADER_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            keepalive_interval: secs_or(&lookup, "CTRADER_KEEPALIVE_SECS", defaults.keepalive_interval),
        };

        let symbols = lookup("CTRADER_SYMBOLS")
            .map(|v| parse_symbols(&v))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(ToString::to_string).collect());

        let aliases = match lookup("CTRADER_SYMBOL_ALIASES") {
            Some(v) => SymbolAliases::builtin().with_overrides(parse_aliases(&v)?),
            None => SymbolAliases::builtin(),
        };

        let redis_defaults = RedisSettings::default();
        let redis = RedisSettings {
            host: lookup("REDIS_HOST")
                .filter(|h| !h.is_empty())
                .unwrap_or(redis_defaults.host),
            port: parse_or(&lookup, "REDIS_PORT", redis_defaults.port),
        };

        let heartbeat_defaults = LivenessConfig::default();
        let heartbeat = LivenessConfig {
            key: lookup("INGESTOR_HEARTBEAT_KEY")
                .filter(|k| !k.is_empty())
                .unwrap_or(heartbeat_defaults.key),
            interval: secs_or(&lookup, "INGESTOR_HEARTBEAT_INTERVAL_SECS", heartbeat_defaults.interval),
            expiry: secs_or(&lookup, "INGESTOR_HEARTBEAT_TTL_SECS", heartbeat_defaults.expiry),
        };
        if heartbeat.expiry <= heartbeat.interval {
            return Err(ConfigError::InvalidValue {
                key: "INGESTOR_HEARTBEAT_TTL_SECS".to_string(),
                reason: "heartbeat expiry must be longer than the interval".to_string(),
            });
        }

        let restart_defaults = RestartConfig::default();
        let restart = RestartConfig {
            initial_delay: lookup("INGESTOR_RESTART_DELAY_INITIAL_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(restart_defaults.initial_delay, Duration::from_millis),
            max_delay: secs_or(&lookup, "INGESTOR_RESTART_DELAY_MAX_SECS", restart_defaults.max_delay),
            multiplier: parse_or(&lookup, "INGESTOR_RESTART_MULTIPLIER", restart_defaults.multiplier),
            jitter_factor: restart_defaults.jitter_factor,
            max_attempts: parse_or(&lookup, "INGESTOR_RESTART_MAX_ATTEMPTS", restart_defaults.max_attempts),
        };

        Ok(Self {
            credentials,
            broker,
            symbols,
            aliases,
            redis,
            heartbeat,
            restart,
            metrics_port: parse_or(&lookup, "INGESTOR_METRICS_PORT", 9091),
        })
    }

    /// Broker endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.broker.host.clone(),
            port: self.broker.port,
            tls: self.broker.tls,
        }
    }

    /// Client configuration for this ingestor.
    #[must_use]
    pub fn to_client_config(&self) -> ClientConfig {
        let interval = self.broker.keepalive_interval;
        let inbound_timeout = KeepaliveConfig::default()
            .inbound_timeout
            .max(interval.saturating_mul(3));

        ClientConfig::new(self.endpoint(), self.credentials.clone())
            .with_timeouts(Timeouts {
                connect: self.broker.connect_timeout,
                request: self.broker.request_timeout,
            })
            .with_keepalive(KeepaliveConfig::new(interval, inbound_timeout))
            .with_aliases(self.aliases.clone())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Credentials rejected.
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map_or(default, Duration::from_secs)
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

/// Split a comma-separated symbol list, dropping blanks and duplicates.
#[must_use]
pub fn parse_symbols(value: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for symbol in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
    }
    symbols
}

/// Parse `CALLER=BROKER` pairs separated by commas.
///
/// # Errors
///
/// Returns an error for an entry without `=` or with an empty side.
pub fn parse_aliases(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (caller, broker) = entry
                .split_once('=')
                .map(|(c, b)| (c.trim(), b.trim()))
                .filter(|(c, b)| !c.is_empty() && !b.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "CTRADER_SYMBOL_ALIASES".to_string(),
                    reason: format!("expected CALLER=BROKER, got {entry:?}"),
                })?;
            Ok((caller.to_string(), broker.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut vars: HashMap<String, String> = [
            ("CTRADER_CLIENT_ID", "client"),
            ("CTRADER_CLIENT_SECRET", "secret"),
            ("CTRADER_ACCESS_TOKEN", "token"),
            ("CTRADER_ACCOUNT_ID", "ACC-12 345"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
        for (k, v) in pairs {
            vars.insert((*k).to_string(), (*v).to_string());
        }
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_from_minimal_env() {
        let config = IngestorConfig::from_lookup(env(&[])).unwrap();

        assert_eq!(config.credentials.account_id(), 12345);
        assert_eq!(config.broker.environment, BrokerEnvironment::Demo);
        assert_eq!(config.broker.host, DEMO_HOST);
        assert_eq!(config.broker.port, 5035);
        assert!(config.broker.tls);
        assert_eq!(config.symbols.len(), 8);
        assert_eq!(config.symbols[0], "EURUSD");
        assert_eq!(config.redis, RedisSettings::default());
        assert_eq!(config.heartbeat, LivenessConfig::default());
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.aliases.to_broker("NSXUSD"), "USTEC");
    }

    #[test]
    fn missing_required_var() {
        let lookup = |key: &str| (key != "CTRADER_ACCESS_TOKEN").then(|| "x1".to_string());
        let err = IngestorConfig::from_lookup(lookup).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "CTRADER_ACCESS_TOKEN"));
    }

    #[test]
    fn empty_required_var() {
        let err = IngestorConfig::from_lookup(env(&[("CTRADER_CLIENT_ID", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn account_id_without_digits_is_rejected() {
        let err = IngestorConfig::from_lookup(env(&[("CTRADER_ACCOUNT_ID", "abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::Credentials(_)));
    }

    #[test]
    fn live_environment_and_overrides() {
        let config = IngestorConfig::from_lookup(env(&[
            ("CTRADER_ENV", "LIVE"),
            ("CTRADER_PORT", "5036"),
            ("CTRADER_TLS", "false"),
            ("CTRADER_REQUEST_TIMEOUT_SECS", "5"),
            ("CTRADER_SYMBOLS", "EURUSD, NSXUSD,,EURUSD"),
            ("INGESTOR_METRICS_PORT", "0"),
        ]))
        .unwrap();

        assert_eq!(config.broker.host, LIVE_HOST);
        assert_eq!(config.broker.port, 5036);
        assert!(!config.broker.tls);
        assert_eq!(config.broker.request_timeout, Duration::from_secs(5));
        assert_eq!(config.symbols, vec!["EURUSD", "NSXUSD"]);
        assert_eq!(config.metrics_port, 0);

        let client = config.to_client_config();
        assert_eq!(client.endpoint.host, LIVE_HOST);
        assert_eq!(client.timeouts.request, Duration::from_secs(5));
    }

    #[test]
    fn explicit_host_wins_over_environment() {
        let config =
            IngestorConfig::from_lookup(env(&[("CTRADER_ENV", "live"), ("CTRADER_HOST", "127.0.0.1")]))
                .unwrap();
        assert_eq!(config.broker.host, "127.0.0.1");
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config = IngestorConfig::from_lookup(env(&[
            ("CTRADER_PORT", "not-a-port"),
            ("CTRADER_CONNECT_TIMEOUT_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.broker.port, DEFAULT_PORT);
        assert_eq!(config.broker.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn alias_overrides() {
        let config = IngestorConfig::from_lookup(env(&[(
            "CTRADER_SYMBOL_ALIASES",
            "NSXUSD=NAS100, GER40 = DE40",
        )]))
        .unwrap();
        assert_eq!(config.aliases.to_broker("NSXUSD"), "NAS100");
        assert_eq!(config.aliases.to_broker("GER40"), "DE40");
    }

    #[test]
    fn malformed_alias_is_rejected() {
        let err = parse_aliases("NSXUSD").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(parse_aliases("A=").is_err());
    }

    #[test]
    fn heartbeat_expiry_must_exceed_interval() {
        let err = IngestorConfig::from_lookup(env(&[
            ("INGESTOR_HEARTBEAT_INTERVAL_SECS", "30"),
            ("INGESTOR_HEARTBEAT_TTL_SECS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn keepalive_timeout_scales_with_interval() {
        let config =
            IngestorConfig::from_lookup(env(&[("CTRADER_KEEPALIVE_SECS", "20")])).unwrap();
        let keepalive = config.to_client_config().keepalive;
        assert_eq!(keepalive.interval, Duration::from_secs(20));
        assert_eq!(keepalive.inbound_timeout, Duration::from_secs(60));
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("TRUE", false));
        assert!(!parse_bool("0", true));
        assert!(parse_bool("maybe", true));
    }
}
