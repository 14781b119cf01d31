use crate::ingest::{Ingestor, TelemetrySet};
use crate::status::ReportStatus;
use axum::Json;
use axum::Router;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{HeaderMap, Uri, header};
use axum::routing::any;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;

/// Routes the weather station reports to. Any other path is accepted as well.
pub fn router(ingestor: Arc<Ingestor>) -> Router {
    Router::new()
        .route("/", any(report))
        .route("/data/report", any(report))
        .route("/data/report/*rest", any(report))
        .fallback(report)
        .with_state(ingestor)
}

/// Handles one report. The station always gets an `accepted` answer.
async fn report(
    State(ingestor): State<Arc<Ingestor>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Json<ReportStatus> {
    let host = remote
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    info!("Request: host={host}, user-agent={user_agent} url={uri}");

    let telemetry = TelemetrySet::from_query(query.as_deref().unwrap_or_default());
    let summary = ingestor.process(&telemetry).await;
    debug!("Report processed: {summary:?}");

    Json(ReportStatus::accepted(summary.num_values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::MemoryPublisher;
    use crate::{Components, Configuration};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(publisher: Arc<MemoryPublisher>) -> Router {
        let config = Configuration::load("conf/ambient2mqtt.conf")
            .expect("Failed to load default config");
        let components = Arc::new(Components::embedded().expect("embedded registry must load"));

        router(Arc::new(Ingestor::new(&config, components, publisher)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_paths() {
        for uri in [
            "/?tempf=70",
            "/data/report?tempf=70",
            "/data/report/?tempf=70",
            "/data/report/anything?tempf=70",
            "/somewhere/else?tempf=70",
        ] {
            let publisher = Arc::new(MemoryPublisher::new());
            let (status, body) = get(app(publisher.clone()), uri).await;

            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body, r#"{"status":"accepted","num_values":1}"#, "{uri}");
            assert_eq!(publisher.topics(), vec!["ambient2mqtt/weather/tempf"]);
        }
    }

    #[tokio::test]
    async fn test_empty_report() {
        let publisher = Arc::new(MemoryPublisher::new());
        let (status, body) = get(app(publisher.clone()), "/data/report/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"accepted","num_values":0}"#);
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_post() {
        let publisher = Arc::new(MemoryPublisher::new());
        let response = app(publisher.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/data/report/?a=1&b=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(publisher.messages().len(), 2);
    }
}
