//! Health prober
//!
//! Confirms that a started component is actually serving before its readiness
//! signal fires. Any transport error or non-2xx status is retried on a fixed
//! interval up to a bounded number of attempts.

use std::time::Duration;

use reqwest::{Client, Method, Request, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Send `request` until it returns a 2xx status, at most `max_attempts` times
///
/// Waits `interval` between attempts but not after the last one, so a probe that
/// never succeeds takes about `(max_attempts - 1) * interval`. Zero attempts is
/// rejected rather than treated as unbounded.
pub async fn poll(
    client: &Client,
    request: Request,
    max_attempts: u32,
    interval: Duration,
) -> Result<()> {
    let url = request.url().clone();
    if max_attempts == 0 {
        return Err(Error::health(format!(
            "health check of {} needs at least one attempt",
            url
        )));
    }
    let config = RetryConfig::fixed(max_attempts, interval);

    retry_with_backoff(&config, url.as_str(), || {
        let attempt = request.try_clone();
        let url = url.clone();
        async move {
            let attempt = attempt
                .ok_or_else(|| Error::health(format!("request to {} cannot be replayed", url)))?;
            let response = client
                .execute(attempt)
                .await
                .map_err(|e| Error::health(format!("request to {} failed: {}", url, e)))?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(Error::health(format!("{} returned {}", url, status)))
            }
        }
    })
    .await
    .map_err(|e| {
        Error::health(format!(
            "{} not healthy after {} attempts: {}",
            request.url(),
            max_attempts,
            e
        ))
    })
}

/// A component health endpoint with the client needed to reach it
#[derive(Debug, Clone)]
pub struct HealthProbe {
    component: &'static str,
    url: Url,
    client: Client,
    max_attempts: u32,
    interval: Duration,
}

impl HealthProbe {
    fn build(component: &'static str, url: &str, builder: reqwest::ClientBuilder) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::config(format!("invalid health URL {}: {}", url, e)))?;
        let client = builder
            .timeout(crate::DEFAULT_PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::health(format!("failed to build probe client: {}", e)))?;
        let schedule = RetryConfig::health_probe();

        Ok(Self {
            component,
            url,
            client,
            max_attempts: schedule.max_attempts,
            interval: schedule.initial_delay,
        })
    }

    /// Plain HTTP endpoint
    pub fn http(component: &'static str, url: &str) -> Result<Self> {
        Self::build(component, url, Client::builder())
    }

    /// HTTPS endpoint whose certificate is not verified
    pub fn insecure_https(component: &'static str, url: &str) -> Result<Self> {
        Self::build(
            component,
            url,
            Client::builder().danger_accept_invalid_certs(true),
        )
    }

    /// HTTPS endpoint that requires a client certificate
    pub fn mutual_tls(
        component: &'static str,
        url: &str,
        cert_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<Self> {
        let identity = reqwest::Identity::from_pem(&[cert_pem, key_pem].concat())
            .map_err(|e| Error::health(format!("invalid client identity: {}", e)))?;
        Self::build(
            component,
            url,
            Client::builder()
                .danger_accept_invalid_certs(true)
                .identity(identity),
        )
    }

    /// Override the retry schedule
    pub fn with_schedule(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.interval = interval;
        self
    }

    /// Probed URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Poll until healthy, giving up early if `cancel` fires
    pub async fn wait_healthy(&self, cancel: &CancellationToken) -> Result<()> {
        debug!(component = self.component, url = %self.url, "Waiting for health endpoint");
        let request = Request::new(Method::GET, self.url.clone());

        tokio::select! {
            result = poll(&self.client, request, self.max_attempts, self.interval) => {
                result?;
                info!(component = self.component, "Health check passed");
                Ok(())
            }
            _ = cancel.cancelled() => Err(Error::health(format!(
                "{} health check cancelled",
                self.component
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Serve `/healthz` returning 500 for the first `failures` hits, then 200
    async fn serve_flaky(failures: u32) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/healthz",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/healthz", addr), hits)
    }

    fn get_request(url: &str) -> Request {
        Request::new(Method::GET, Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn always_failing_endpoint_is_polled_exactly_max_attempts() {
        let (url, hits) = serve_flaky(u32::MAX).await;
        let client = Client::new();
        let interval = Duration::from_millis(50);

        let start = std::time::Instant::now();
        let err = poll(&client, get_request(&url), 4, interval).await.unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(elapsed >= interval * 3);
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn zero_attempts_is_rejected_without_a_request() {
        let (url, hits) = serve_flaky(u32::MAX).await;

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            poll(&Client::new(), get_request(&url), 0, Duration::from_millis(10)),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::Health(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovering_endpoint_stops_polling_once_healthy() {
        let (url, hits) = serve_flaky(2).await;
        poll(&Client::new(), get_request(&url), 5, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_refused_is_retried_then_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = poll(
            &Client::new(),
            get_request(&format!("http://{}/healthz", addr)),
            2,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Health(_)));
    }

    #[tokio::test]
    async fn probe_gives_up_on_cancellation() {
        let (url, _) = serve_flaky(u32::MAX).await;
        let probe = HealthProbe::http("test", &url)
            .unwrap()
            .with_schedule(100, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = probe.wait_healthy(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn probe_reports_healthy_endpoint() {
        let (url, _) = serve_flaky(0).await;
        let probe = HealthProbe::http("test", &url).unwrap();
        probe.wait_healthy(&CancellationToken::new()).await.unwrap();
        assert_eq!(probe.url().path(), "/healthz");
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        assert!(matches!(
            HealthProbe::http("test", "not a url"),
            Err(Error::Config(_))
        ));
    }
}
