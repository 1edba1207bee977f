//! Broker readiness probe.

use std::sync::Arc;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::error::TransportError;
use crate::transport::connection::ConnectionManager;

/// Well-known dummy queue used by the probe.
pub const HEALTH_CHECK_QUEUE: &str = "taskbus-health";

/// Outcome of a broker health check.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub ok: bool,
    /// Human-readable explanation when the check failed.
    pub diagnostic: Option<String>,
}

/// Check that a connection to the broker can be established.
///
/// Opens a short-lived connection, declares [`HEALTH_CHECK_QUEUE`], deletes
/// it again, and reports the result. The dummy queue is never left behind:
/// deletion happens on the success path and a failed connect declares
/// nothing.
pub async fn check_broker(broker: Arc<dyn Broker>, config: &BrokerConfig) -> HealthReport {
    match probe(broker, config).await {
        Ok(()) => HealthReport {
            ok: true,
            diagnostic: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, addr = %config.addr(), "Broker health check failed");
            HealthReport {
                ok: false,
                diagnostic: Some(format!(
                    "cannot connect to queue exchange at {} with dummy queue \"{}\": {}",
                    config.addr(),
                    HEALTH_CHECK_QUEUE,
                    e
                )),
            }
        }
    }
}

async fn probe(broker: Arc<dyn Broker>, config: &BrokerConfig) -> Result<(), TransportError> {
    let mut conn = ConnectionManager::new(broker, config.clone(), HEALTH_CHECK_QUEUE);
    conn.connect().await?;
    let result = conn.delete_queue().await;
    conn.reset().await;
    result
}
