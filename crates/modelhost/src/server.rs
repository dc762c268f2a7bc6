//! Server startup and routing.
//!
//! Loads the repository into the registry, serves the REST surface until
//! Ctrl-C, then unloads every model before returning.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    api::{self, AppState},
    config::Config,
    model_runtime::{AdapterCatalog, ModelRegistry},
    repository::ModelRepository,
};

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.parallel_workers)
        .thread_name(|i| format!("modelhost-score-{}", i))
        .build_global()
    {
        warn!("Scoring pool already initialized: {}", e);
    }

    let registry = Arc::new(ModelRegistry::new(AdapterCatalog::discover()));
    let repository = ModelRepository::new(&cfg.model_repository);

    if cfg.load_models_at_startup {
        let settings = repository.list()?;
        info!("Loading {} models from {}", settings.len(), repository.root().display());
        let failed = registry
            .load_all(&settings)
            .await
            .into_iter()
            .filter(|(key, outcome)| match outcome {
                Ok(()) => false,
                Err(e) => {
                    warn!("Model {} failed to load: {}", key, e);
                    true
                }
            })
            .count();
        info!("{} models ready, {} failed", settings.len() - failed, failed);
    }

    let addr = cfg.api_addr()?;
    let state = AppState {
        registry: registry.clone(),
        repository,
        config: Arc::new(cfg),
    };

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, unloading models");
    registry.unload_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Streaming routes are exempt from the request timeout; a long generation
/// is bounded by the model, not the transport.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{
        routing::{get, post},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let unary = Router::new()
        .route("/v2/health/live", get(api::live))
        .route("/v2/health/ready", get(api::ready))
        .route("/v2/models/:name", get(api::model_metadata))
        .route("/v2/models/:name/versions/:version", get(api::model_metadata))
        .route("/v2/models/:name/infer", post(api::infer))
        .route("/v2/models/:name/versions/:version/infer", post(api::infer))
        .route("/v2/repository/index", post(api::repository_index))
        .route("/v2/repository/models/:name/load", post(api::load_model))
        .route("/v2/repository/models/:name/unload", post(api::unload_model))
        .route(
            "/v2/repository/models/:name/versions/:version/unload",
            post(api::unload_model),
        )
        .route("/metrics", get(api::get_metrics))
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.request_timeout_seconds,
        )));

    let streaming = Router::new()
        .route("/v2/models/:name/infer_stream", post(api::infer_stream))
        .route(
            "/v2/models/:name/versions/:version/infer_stream",
            post(api::infer_stream),
        );

    unary
        .merge(streaming)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::estimator::{Estimator, EstimatorArtifact};
    use crate::streaming::decode_frame;
    use crate::types::InferenceResponse;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::path::Path;
    use tower::ServiceExt;

    fn test_config(repository: &Path) -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 0,
            model_repository: repository.to_path_buf(),
            load_models_at_startup: false,
            parallel_workers: 1,
            stream_keepalive_seconds: 0,
            request_timeout_seconds: 30,
        }
    }

    /// A repository holding `clf` v1 (a dummy classifier over 2 features).
    fn write_repository(root: &Path) {
        let dir = root.join("clf");
        std::fs::create_dir_all(&dir).unwrap();
        EstimatorArtifact::new(Estimator::DummyClassifier {
            classes: vec![3, 7],
            class_prior: vec![0.2, 0.8],
            n_features: Some(2),
        })
        .write_to(&dir.join("model.bin"))
        .unwrap();
        std::fs::write(
            dir.join("model-settings.json"),
            r#"{"name": "clf", "version": "v1", "parameters": {"uri": "./model.bin"}}"#,
        )
        .unwrap();
    }

    fn test_state(root: &Path) -> AppState {
        AppState {
            registry: Arc::new(ModelRegistry::new(AdapterCatalog::discover())),
            repository: ModelRepository::new(root),
            config: Arc::new(test_config(root)),
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    fn infer_body() -> Value {
        json!({
            "id": "req-1",
            "inputs": [{"name": "input-0", "shape": [2, 2], "datatype": "FP32", "data": [[1, 2], [3, 4]]}]
        })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let root = tempfile::tempdir().unwrap();
        let app = build_router(test_state(root.path()));

        let live = app
            .clone()
            .oneshot(Request::get("/v2/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);

        let ready = app
            .oneshot(Request::get("/v2/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(ready).await["models_loaded"], 0);
    }

    #[tokio::test]
    async fn test_load_infer_unload() {
        let root = tempfile::tempdir().unwrap();
        write_repository(root.path());
        let app = build_router(test_state(root.path()));

        let missing = app
            .clone()
            .oneshot(post_json("/v2/models/clf/versions/v1/infer", infer_body()))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let load = app
            .clone()
            .oneshot(post_empty("/v2/repository/models/clf/load"))
            .await
            .unwrap();
        assert_eq!(load.status(), StatusCode::OK);

        let infer = app
            .clone()
            .oneshot(post_json("/v2/models/clf/versions/v1/infer", infer_body()))
            .await
            .unwrap();
        assert_eq!(infer.status(), StatusCode::OK);
        let body = body_json(infer).await;
        assert_eq!(body["model_name"], "clf");
        assert_eq!(body["model_version"], "v1");
        assert_eq!(body["id"], "req-1");
        assert_eq!(body["outputs"][0]["datatype"], "INT64");
        assert_eq!(body["outputs"][0]["shape"], json!([2, 1]));
        assert_eq!(body["outputs"][0]["data"], json!([7, 7]));

        let latest = app
            .clone()
            .oneshot(post_json("/v2/models/clf/infer", infer_body()))
            .await
            .unwrap();
        assert_eq!(latest.status(), StatusCode::OK);

        let index = app
            .clone()
            .oneshot(post_empty("/v2/repository/index"))
            .await
            .unwrap();
        assert_eq!(body_json(index).await[0]["state"], "READY");

        let unload = app
            .clone()
            .oneshot(post_empty("/v2/repository/models/clf/versions/v1/unload"))
            .await
            .unwrap();
        assert_eq!(unload.status(), StatusCode::OK);

        let again = app
            .oneshot(post_empty("/v2/repository/models/clf/versions/v1/unload"))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_request_maps_to_400() {
        let root = tempfile::tempdir().unwrap();
        write_repository(root.path());
        let app = build_router(test_state(root.path()));
        app.clone()
            .oneshot(post_empty("/v2/repository/models/clf/load"))
            .await
            .unwrap();

        let wrong_features = json!({
            "inputs": [{"name": "input-0", "shape": [1, 3], "datatype": "FP64", "data": [1, 2, 3]}]
        });
        let response = app
            .oneshot(post_json("/v2/models/clf/versions/v1/infer", wrong_features))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "shape_mismatch");
    }

    #[tokio::test]
    async fn test_infer_stream_frames() {
        let root = tempfile::tempdir().unwrap();
        write_repository(root.path());
        let app = build_router(test_state(root.path()));
        app.clone()
            .oneshot(post_empty("/v2/repository/models/clf/load"))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json("/v2/models/clf/versions/v1/infer_stream", infer_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            crate::streaming::EVENT_STREAM_CONTENT_TYPE
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"data: "));
        assert!(bytes.ends_with(b"\n\n"));
        let frame: InferenceResponse = decode_frame(&bytes).unwrap();
        assert_eq!(frame.model_name, "clf");
        assert_eq!(frame.id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_infer_stream_error_frame() {
        let root = tempfile::tempdir().unwrap();
        write_repository(root.path());
        let app = build_router(test_state(root.path()));
        app.clone()
            .oneshot(post_empty("/v2/repository/models/clf/load"))
            .await
            .unwrap();

        let request = json!({
            "inputs": [{"name": "input-0", "shape": [1, 2], "datatype": "FP64", "data": [1, 2]}],
            "outputs": [{"name": "transform"}]
        });
        let response = app
            .oneshot(post_json("/v2/models/clf/versions/v1/infer_stream", request))
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: Value = decode_frame(&bytes).unwrap();
        assert_eq!(error["kind"], "unknown_output");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::init_metrics();
        let root = tempfile::tempdir().unwrap();
        let app = build_router(test_state(root.path()));

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
        assert!(text.contains("modelhost_models_loaded"));
    }
}
