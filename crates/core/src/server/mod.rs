mod error;
mod handlers;

use crate::analytics::AnalyticsStore;
use crate::config::ServerConfig;
use crate::inference::InferenceService;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use handlers::{AnalyzeResponse, HealthResponse, FILE_FIELD, USER_FIELD};

pub(crate) const LOG_TARGET: &str = "server";

#[derive(Clone)]
pub struct AppState {
    pub service: InferenceService,
    pub analytics: Option<Arc<AnalyticsStore>>,
}

impl AppState {
    pub fn new(service: InferenceService) -> Self {
        Self {
            service,
            analytics: None,
        }
    }

    pub fn with_analytics(mut self, store: AnalyticsStore) -> Self {
        self.analytics = Some(Arc::new(store));
        self
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/analyze", post(handlers::analyze))
        .route("/api/analytics", get(handlers::analytics))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `config.bind` and serves until Ctrl-C.
pub async fn serve(app: Router, config: &ServerConfig) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(
        target: LOG_TARGET,
        addr = %listener.local_addr()?,
        max_upload_bytes = config.max_upload_bytes,
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: LOG_TARGET, error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!(target: LOG_TARGET, "shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsSummary;
    use crate::decode::test_support::wav_bytes;
    use crate::decode::{Decoder, SymphoniaAudioDecoder};
    use crate::emotion::{CrnnConfig, CrnnEmotionClassifier, EmotionLabel};
    use crate::features::FeatureExtractor;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    const BOUNDARY: &str = "moodtale-test-boundary";

    fn service() -> InferenceService {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let classifier = CrnnEmotionClassifier::from_var_builder(vb, CrnnConfig::default()).unwrap();
        InferenceService::new(
            Decoder::new(Arc::new(SymphoniaAudioDecoder)),
            FeatureExtractor::default(),
            Arc::new(classifier),
        )
        .unwrap()
    }

    enum Part<'a> {
        File(Option<&'a str>, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::File(filename, bytes) => {
                    let disposition = match filename {
                        Some(f) => format!("form-data; name=\"{FILE_FIELD}\"; filename=\"{f}\""),
                        None => format!("form-data; name=\"{FILE_FIELD}\""),
                    };
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                            .as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn analyze_request(parts: &[Part<'_>]) -> Request<Body> {
        let body = multipart_body(parts);
        Request::builder()
            .method("POST")
            .uri("/api/analyze")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    fn json<T: DeserializeOwned>(body: &[u8]) -> T {
        serde_json::from_slice(body).unwrap()
    }

    fn silent_wav() -> Vec<u8> {
        wav_bytes(22_050, 1, &vec![0.0; 22_050])
    }

    #[tokio::test]
    async fn health_lists_labels() {
        let app = router(AppState::new(service()), 1 << 20);
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = json(&body);
        assert_eq!(health.status, "ok");
        assert_eq!(health.labels, EmotionLabel::ALL.to_vec());
    }

    #[tokio::test]
    async fn analyze_returns_label_and_records_analytics() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(service())
            .with_analytics(AnalyticsStore::new(dir.path().join("analytics.json")));
        let store = state.analytics.clone().unwrap();
        let app = router(state, 1 << 20);

        let wav = silent_wav();
        let req = analyze_request(&[
            Part::Text(USER_FIELD, "ana"),
            Part::File(Some("clip.wav"), &wav),
        ]);
        let (status, body) = send(app.clone(), req).await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

        let res: AnalyzeResponse = json(&body);
        assert_eq!(res.emotion, EmotionLabel::Neutral);
        assert!((res.confidence - 0.125).abs() < 1e-6);
        assert_eq!(res.scores.len(), EmotionLabel::COUNT);

        let records = store.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user.as_deref(), Some("ana"));

        let req = Request::get("/api/analytics").body(Body::empty()).unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        let summary: AnalyticsSummary = json(&body);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.most_detected.unwrap().label, EmotionLabel::Neutral);
    }

    #[tokio::test]
    async fn analytics_write_failure_does_not_fail_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.json");
        std::fs::write(&path, b"[{ truncated").unwrap();
        let app = router(
            AppState::new(service()).with_analytics(AnalyticsStore::new(&path)),
            1 << 20,
        );

        let wav = silent_wav();
        let (status, body) = send(app, analyze_request(&[Part::File(Some("clip.wav"), &wav)])).await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
        let res: AnalyzeResponse = json(&body);
        assert_eq!(res.emotion, EmotionLabel::Neutral);
        assert_eq!(std::fs::read(&path).unwrap(), b"[{ truncated");
    }

    #[tokio::test]
    async fn missing_filename_is_treated_as_wav_recording() {
        let app = router(AppState::new(service()), 1 << 20);
        let wav = silent_wav();
        let (status, _) = send(app, analyze_request(&[Part::File(None, &wav)])).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_file_field_is_bad_request() {
        let app = router(AppState::new(service()), 1 << 20);
        let (status, body) = send(app, analyze_request(&[Part::Text(USER_FIELD, "ana")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: serde_json::Value = json(&body);
        assert!(err["error"].as_str().unwrap().contains("no audio file"));
    }

    #[tokio::test]
    async fn disallowed_extension_is_bad_request() {
        let app = router(AppState::new(service()), 1 << 20);
        let req = analyze_request(&[Part::File(Some("notes.txt"), b"hello")]);
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: serde_json::Value = json(&body);
        assert!(err["error"].as_str().unwrap().contains("wav"));
    }

    #[tokio::test]
    async fn undecodable_upload_is_unprocessable() {
        let app = router(AppState::new(service()), 1 << 20);
        for bytes in [&b""[..], &[0x42u8; 2048][..]] {
            let req = analyze_request(&[Part::File(Some("clip.wav"), bytes)]);
            let (status, _) = send(app.clone(), req).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        }
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let app = router(AppState::new(service()), 1024);
        let wav = silent_wav();
        let (status, _) = send(app, analyze_request(&[Part::File(Some("clip.wav"), &wav)])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn analytics_is_not_found_when_disabled() {
        let app = router(AppState::new(service()), 1 << 20);
        let req = Request::get("/api/analytics").body(Body::empty()).unwrap();
        let (status, _) = send(app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
