//! Prometheus metrics and the `/metrics` + `/health` endpoint

use crate::config::MetricsSettings;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Pipeline metrics
#[derive(Clone)]
pub struct OceansMetrics {
    registry: Registry,
    pub epochs_finalized: IntCounter,
    pub epochs_failed: IntCounter,
    pub publish_attempts: IntCounter,
    pub observer_unit_failures: IntCounter,
    pub current_epoch: IntGauge,
    pub epoch_stale: IntGauge,
    pub epoch_degraded: IntGauge,
}

impl OceansMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let epochs_finalized =
            IntCounter::new("oceans_epochs_finalized_total", "Epochs that reached Finalized")?;
        let epochs_failed = IntCounter::new("oceans_epochs_failed_total", "Epochs marked Failed")?;
        let publish_attempts =
            IntCounter::new("oceans_publish_attempts_total", "Reward vector submissions")?;
        let observer_unit_failures = IntCounter::new(
            "oceans_observer_unit_failures_total",
            "Position reads that produced no value",
        )?;
        let current_epoch = IntGauge::new("oceans_current_epoch", "Most recently processed epoch")?;
        let epoch_stale = IntGauge::new(
            "oceans_epoch_stale",
            "1 when the last epoch reused a prior weight vector",
        )?;
        let epoch_degraded = IntGauge::new(
            "oceans_epoch_degraded",
            "1 when the last epoch had degraded sources",
        )?;

        registry.register(Box::new(epochs_finalized.clone()))?;
        registry.register(Box::new(epochs_failed.clone()))?;
        registry.register(Box::new(publish_attempts.clone()))?;
        registry.register(Box::new(observer_unit_failures.clone()))?;
        registry.register(Box::new(current_epoch.clone()))?;
        registry.register(Box::new(epoch_stale.clone()))?;
        registry.register(Box::new(epoch_degraded.clone()))?;

        Ok(Self {
            registry,
            epochs_finalized,
            epochs_failed,
            publish_attempts,
            observer_unit_failures,
            current_epoch,
            epoch_stale,
            epoch_degraded,
        })
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Metrics server
pub struct MetricsServer {
    config: MetricsSettings,
    metrics: Arc<OceansMetrics>,
}

impl MetricsServer {
    pub fn new(config: &MetricsSettings, metrics: Arc<OceansMetrics>) -> Self {
        Self {
            config: config.clone(),
            metrics,
        }
    }

    /// Run the metrics server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.address.parse()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Starting metrics server on {}", addr);

        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
            };
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let Ok(n) = stream.read(&mut buf).await else {
                    return;
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                let response = respond(&request, &metrics);
                let _ = stream.write_all(&response).await;
            });
        }
    }
}

fn respond(request: &str, metrics: &OceansMetrics) -> Vec<u8> {
    if request.starts_with("GET /metrics") {
        match metrics.render() {
            Ok(body) => {
                let mut response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(&body);
                response
            }
            Err(e) => {
                tracing::error!("Metrics encoding failed: {}", e);
                b"HTTP/1.1 500 Internal Server Error\r\n\r\n".to_vec()
            }
        }
    } else if request.starts_with("GET /health") {
        let body = r#"{"status":"healthy"}"#;
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    } else {
        b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = OceansMetrics::new().unwrap();
        metrics.epochs_finalized.inc();
        metrics.current_epoch.set(42);

        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains("oceans_epochs_finalized_total 1"));
        assert!(text.contains("oceans_current_epoch 42"));
    }

    #[test]
    fn test_routes() {
        let metrics = OceansMetrics::new().unwrap();
        let ok = String::from_utf8(respond("GET /health HTTP/1.1", &metrics)).unwrap();
        assert!(ok.starts_with("HTTP/1.1 200"));
        let missing = String::from_utf8(respond("GET /nope HTTP/1.1", &metrics)).unwrap();
        assert!(missing.starts_with("HTTP/1.1 404"));
    }
}
