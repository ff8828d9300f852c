//! Health snapshot webhook
//!
//! POSTs each `HealthSnapshot` as JSON to a configured URL. Delivery goes
//! through a circuit breaker so a dead endpoint costs one rejected call per
//! cycle instead of a full request timeout.

use crate::config::WebhookConfig;
use crate::coordination::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitError,
};
use crate::error::{Result, VigilError};
use crate::monitoring::health::HealthSnapshot;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

pub struct WebhookReporter {
    client: Client,
    url: String,
    breaker: CircuitBreaker,
}

impl WebhookReporter {
    pub fn new(url: impl Into<String>, timeout: Duration, breaker: CircuitBreakerConfig) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            breaker: CircuitBreaker::new(breaker),
        })
    }

    /// Reporter for the configured URL, or None when no URL is set
    pub fn from_config(config: &WebhookConfig) -> Result<Option<Self>> {
        let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };

        let breaker = CircuitBreakerConfig {
            name: "webhook".to_string(),
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            half_open_max_calls: config.half_open_max_calls,
        };
        Self::new(url, Duration::from_secs(config.timeout_secs), breaker).map(Some)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.snapshot().await
    }

    /// Deliver one snapshot. Errors are returned for the caller to log.
    pub async fn report(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let result = self.breaker.call(|| self.post(snapshot)).await;

        match result {
            Ok(()) => {
                debug!("Health snapshot delivered to {}", self.url);
                Ok(())
            }
            Err(CircuitError::Open { name, retry_in }) => {
                debug!("Webhook skipped, breaker {} open for {:?}", name, retry_in);
                Err(VigilError::CircuitOpen(name))
            }
            Err(CircuitError::Inner(e)) => {
                warn!("Webhook delivery failed: {}", e);
                Err(e)
            }
        }
    }

    async fn post(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let response = self.client.post(&self.url).json(snapshot).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(VigilError::Webhook(format!("HTTP {}: {}", status, body)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::circuit_breaker::CircuitState;
    use crate::monitoring::health::{DetectedIssues, HealthState};
    use chrono::Utc;

    fn snapshot() -> HealthSnapshot {
        HealthSnapshot {
            timestamp: Utc::now(),
            health_score: 1.0,
            health_state: HealthState::Healthy,
            memory_sample: None,
            performance_sample: None,
            system_metrics: None,
            detected_issues: DetectedIssues::default(),
            predictive_alerts: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn test_no_url_means_no_reporter() {
        assert!(WebhookReporter::from_config(&WebhookConfig::default())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_trips_breaker() {
        let reporter = WebhookReporter::new(
            "http://127.0.0.1:1/hook",
            Duration::from_millis(200),
            CircuitBreakerConfig {
                name: "webhook".to_string(),
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        )
        .unwrap();

        assert!(reporter.report(&snapshot()).await.is_err());
        assert!(reporter.report(&snapshot()).await.is_err());
        assert_eq!(reporter.breaker_state().await.state, CircuitState::Open);

        assert!(matches!(
            reporter.report(&snapshot()).await,
            Err(VigilError::CircuitOpen(_))
        ));
    }
}
