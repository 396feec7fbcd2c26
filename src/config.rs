use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};

const DEFAULT_DATABASE_URL: &str = "sqlite://chatrooms.db?mode=rwc";
const DEFAULT_RABBITMQ_URL: &str = "amqp://127.0.0.1:5672/%2f";

/// Which fan-out strategy the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// In-process registry, single node only.
    Local,
    /// Topic exchange on an AMQP server.
    Amqp,
}

impl FromStr for BrokerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BrokerKind::Local),
            "amqp" | "rabbitmq" => Ok(BrokerKind::Amqp),
            other => Err(anyhow!("unknown broker {other:?}, expected local or amqp")),
        }
    }
}

/// Timeouts and buffer sizes shared by every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub delivery_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            // Idle websockets get dropped after about a minute.
            heartbeat_interval: Duration::from_secs(55),
            pong_timeout: Duration::from_secs(10),
            delivery_buffer: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub broker: BrokerKind,
    pub rabbitmq_url: String,
    pub connection: ConnectionSettings,
    pub session_inactivity: time::Duration,
}

impl Config {
    /// Reads the process environment, `.env` included.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        fn parse<T>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> anyhow::Result<T>
        where
            T: FromStr,
            T::Err: Into<anyhow::Error>,
        {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<T>()
                    .map_err(|err| -> anyhow::Error { err.into() })
                    .with_context(|| format!("invalid {key}={raw:?}")),
                None => Ok(default),
            }
        }

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            send_timeout: Duration::from_secs(parse(
                &lookup,
                "SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
            heartbeat_interval: Duration::from_secs(parse(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            pong_timeout: Duration::from_secs(parse(
                &lookup,
                "PONG_TIMEOUT_SECS",
                defaults.pong_timeout.as_secs(),
            )?),
            delivery_buffer: parse(&lookup, "DELIVERY_BUFFER", defaults.delivery_buffer)?,
        };
        if connection.delivery_buffer == 0 {
            return Err(anyhow!("DELIVERY_BUFFER must be positive"));
        }
        if connection.heartbeat_interval.is_zero() {
            return Err(anyhow!("HEARTBEAT_INTERVAL_SECS must be positive"));
        }

        Ok(Config {
            bind_addr: parse(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned()),
            broker: parse(&lookup, "BROKER", BrokerKind::Local)?,
            rabbitmq_url: lookup("RABBITMQ_URL").unwrap_or_else(|| DEFAULT_RABBITMQ_URL.to_owned()),
            connection,
            session_inactivity: time::Duration::minutes(parse(
                &lookup,
                "SESSION_INACTIVITY_MINS",
                60,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config(&[]).unwrap();
        assert_eq!(config.broker, BrokerKind::Local);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.connection.send_timeout, Duration::from_secs(5));
        assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(55));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("BROKER", "amqp"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("DELIVERY_BUFFER", "8"),
            ("RABBITMQ_URL", "amqp://mq:5672/%2f"),
        ])
        .unwrap();
        assert_eq!(config.broker, BrokerKind::Amqp);
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.connection.delivery_buffer, 8);
        assert_eq!(config.rabbitmq_url, "amqp://mq:5672/%2f");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(config(&[("BROKER", "carrier-pigeon")]).is_err());
        assert!(config(&[("SEND_TIMEOUT_SECS", "soon")]).is_err());
        assert!(config(&[("DELIVERY_BUFFER", "0")]).is_err());
    }
}
