//! Configuration types.

use std::time::Duration;

/// Broker connection configuration.
///
/// Passed explicitly to [`Producer`](crate::transport::Producer) and
/// [`Consumer`](crate::transport::Consumer) constructors — there is no
/// ambient global configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Total budget for establishing a connection. Unavailability within
    /// the budget is not an error; exhausting it is.
    pub connect_timeout: Duration,
    /// Sleep between connection attempts.
    pub retry_interval: Duration,
    /// Sleep between reply-channel polls while waiting for responses.
    pub reply_poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
            reply_poll_interval: Duration::from_millis(50),
        }
    }
}

impl BrokerConfig {
    /// Build a config from `TASKBUS_QUEUE_HOST` / `TASKBUS_QUEUE_PORT`,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let host = std::env::var("TASKBUS_QUEUE_HOST").unwrap_or(defaults.host);
        let port = std::env::var("TASKBUS_QUEUE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        Self {
            host,
            port,
            ..defaults
        }
    }

    /// `host:port` address string, used in diagnostics.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
