//! HTTP 入口（axum）
//!
//! - POST /orchestrate        统一分发入口
//! - GET  /jobs/:job_id       查询作业
//! - POST /callbacks/ingest   外部系统回推结果（配置了密钥时校验签名）
//! - GET  /health

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower::limit::ConcurrencyLimitLayer;

use crate::core::DispatchError;
use crate::dispatch::{DispatchRequest, DispatchResponse, Dispatcher, IngestAck, JobView};

/// 错误响应：`{"error": kind, "detail": message}`
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.kind(),
            "detail": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// 创建路由；max_in_flight 限制同时处理的请求数
pub fn create_router(dispatcher: Arc<Dispatcher>, max_in_flight: usize) -> Router {
    Router::new()
        .route("/orchestrate", post(orchestrate))
        .route("/jobs/:job_id", get(get_job))
        .route("/callbacks/ingest", post(ingest_callback))
        .route("/health", get(|| async { "OK" }))
        .layer(ConcurrencyLimitLayer::new(max_in_flight.max(1)))
        .with_state(dispatcher)
}

async fn orchestrate(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Bytes,
) -> Result<Json<DispatchResponse>, ApiError> {
    let req: DispatchRequest = serde_json::from_slice(&body)
        .map_err(|e| DispatchError::Validation(format!("Invalid request body: {}", e)))?;
    Ok(Json(dispatcher.dispatch(req).await?))
}

async fn get_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(dispatcher.get_job(&job_id).await?))
}

async fn ingest_callback(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(signer) = dispatcher.signer() {
        let signature = headers
            .get(signer.header())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !signer.verify(&body, signature) {
            tracing::warn!("Rejected callback with invalid signature");
            let body = json!({"error": "unauthorized", "detail": "Invalid signature"});
            return Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response());
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| DispatchError::Validation(format!("Invalid JSON: {}", e)))?;
    let ack: IngestAck = dispatcher.ingest_callback(payload).await?;
    Ok(Json(ack).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::Signer;
    use crate::dispatch::{JobStore, MemoryJobStore, Mode};
    use crate::test_support::{uniform_set, FakeExecutor};
    use axum::body::Body;
    use axum::http::Request;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app_with(cfg: AppConfig, executor: FakeExecutor) -> Router {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let dispatcher = Dispatcher::new(&cfg, store, uniform_set(executor), CancellationToken::new()).unwrap();
        create_router(Arc::new(dispatcher), 8)
    }

    fn app() -> Router {
        app_with(AppConfig::default(), FakeExecutor::ok(Mode::Agent, json!({"answer": 42})))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_orchestrate_then_get_job() {
        let app = app();
        let (status, body) = send(
            app.clone(),
            post_json("/orchestrate", json!({"intent": "memory.search", "inputs": {"query": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("succeeded"));
        assert_eq!(body["result"]["answer"], json!(42));
        assert_eq!(body["will_callback"], json!(false));

        let uri = format!("/jobs/{}", body["job_id"].as_str().unwrap());
        let (status, job) = send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], json!("succeeded"));
        assert_eq!(job["mode"], json!("agent"));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (status, body) = send(
            app(),
            Request::builder().uri("/jobs/job_nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("not_found"));

        let (status, body) = send(app(), post_json("/orchestrate", json!({"inputs": {}}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("validation_error"));

        let (status, _) = send(app(), post_json("/callbacks/ingest", json!({"status": "succeeded"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_agent_intent_is_404() {
        let app = app_with(
            AppConfig::default(),
            FakeExecutor::failing(Mode::Agent, DispatchError::NotFound("no.such.tool".into())),
        );
        let (status, body) = send(
            app,
            post_json("/orchestrate", json!({"intent": "no.such.tool", "mode": "agent"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("not_found"));
    }

    #[tokio::test]
    async fn test_ingest_signature_is_checked_when_configured() {
        let mut cfg = AppConfig::default();
        cfg.callback.hmac_secret = Some("topsecret".to_string());
        let app = app_with(cfg, FakeExecutor::ok(Mode::Flow, json!({})));

        let payload = json!({"job_id": "ext_9", "result": {"ok": true}}).to_string();
        let unsigned = Request::builder()
            .method("POST")
            .uri("/callbacks/ingest")
            .body(Body::from(payload.clone()))
            .unwrap();
        let (status, _) = send(app.clone(), unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let sig = Signer::new(b"topsecret".to_vec(), "X-Signature").sign(payload.as_bytes());
        let signed = Request::builder()
            .method("POST")
            .uri("/callbacks/ingest")
            .header("X-Signature", sig)
            .body(Body::from(payload))
            .unwrap();
        let (status, body) = send(app, signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_id"], json!("ext_9"));
        assert_eq!(body["applied"], json!(true));
    }
}
