//! # Request Metrics
//!
//! In-process atomic counters, exposed in Prometheus text format at
//! `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Extension;

/// Shared request counters.
#[derive(Debug, Clone, Default)]
pub struct ApiMetrics {
    pub request_count: Arc<AtomicU64>,
    pub client_error_count: Arc<AtomicU64>,
    pub server_error_count: Arc<AtomicU64>,
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests served.
    pub fn requests(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Responses with a 4xx or 5xx status.
    pub fn errors(&self) -> u64 {
        self.client_error_count.load(Ordering::Relaxed)
            + self.server_error_count.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of the counters.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP nutri_http_requests_total Requests served.\n");
        out.push_str("# TYPE nutri_http_requests_total counter\n");
        out.push_str(&format!("nutri_http_requests_total {}\n", self.requests()));
        out.push_str("# HELP nutri_http_errors_total Responses with an error status.\n");
        out.push_str("# TYPE nutri_http_errors_total counter\n");
        out.push_str(&format!(
            "nutri_http_errors_total{{class=\"4xx\"}} {}\n",
            self.client_error_count.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "nutri_http_errors_total{{class=\"5xx\"}} {}\n",
            self.server_error_count.load(Ordering::Relaxed)
        ));
        out
    }
}

/// Middleware that increments request and error counters.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let metrics = request.extensions().get::<ApiMetrics>().cloned();

    let response = next.run(request).await;

    if let Some(m) = metrics {
        m.request_count.fetch_add(1, Ordering::Relaxed);
        if response.status().is_client_error() {
            m.client_error_count.fetch_add(1, Ordering::Relaxed);
        } else if response.status().is_server_error() {
            m.server_error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    response
}

/// GET /metrics
pub async fn metrics_handler(Extension(metrics): Extension<ApiMetrics>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::middleware::from_fn;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[tokio::test]
    async fn counts_requests_and_errors() {
        let metrics = ApiMetrics::new();
        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .layer(from_fn(metrics_middleware))
            .layer(Extension(metrics.clone()));

        for path in ["/ok", "/missing", "/boom", "/ok"] {
            let req = axum::http::Request::builder().uri(path).body(Body::empty()).unwrap();
            app.clone().oneshot(req).await.unwrap();
        }

        assert_eq!(metrics.requests(), 4);
        assert_eq!(metrics.errors(), 2);
        let text = metrics.render();
        assert!(text.contains("nutri_http_requests_total 4"));
        assert!(text.contains("class=\"4xx\"} 1"));
        assert!(text.contains("class=\"5xx\"} 1"));
    }
}
