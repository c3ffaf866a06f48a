//! JSON-over-HTTP front end to the registry.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use facereg_core::NameHint;
use facereg_registry::{
    decode_image_data, with_deadline, EnrollRequest, FaceRegistry, ImageSource, MatchRequest,
    RegistryError, UploadedFile,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub registry: FaceRegistry,
    /// Cancelled on shutdown; each request works under a child token.
    pub shutdown: CancellationToken,
    pub operation_timeout: Duration,
}

impl AppState {
    fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Await `fut` under the configured deadline, cancelling `token` on expiry.
    async fn deadline<T>(
        &self,
        token: &CancellationToken,
        fut: impl std::future::Future<Output = facereg_registry::Result<T>>,
    ) -> Result<T> {
        Ok(with_deadline(self.operation_timeout, token, fut).await?)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/enroll", post(enroll))
        .route("/api/sync", post(sync))
        .route("/api/match", post(match_probe))
        .route("/api/enrolled", get(list_enrolled))
        .route("/api/enrolled/*image_key", delete(remove_enrolled))
        .route("/api/batch-recognize", post(batch_recognize))
        .route("/api/datasets/:name", post(upload_dataset))
        .with_state(state)
}

type Result<T> = std::result::Result<T, ApiError>;

/// Request body whose rejection is answered with an [`ApiError`].
type JsonBody<T> = std::result::Result<Json<T>, JsonRejection>;

/// A registry failure rendered as `{success: false, kind, message}`.
pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.kind() {
            "NoFaceDetected" => StatusCode::UNPROCESSABLE_ENTITY,
            "SourceNotFound" => StatusCode::NOT_FOUND,
            "InvalidName" | "InvalidRequest" => StatusCode::BAD_REQUEST,
            "Cancelled" => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::info!(kind = self.0.kind(), error = %self.0, "request rejected");
        }
        let body = json!({
            "success": false,
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn invalid(message: impl Into<String>) -> ApiError {
    RegistryError::InvalidRequest(message.into()).into()
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        invalid(rejection.body_text())
    }
}

/// Serialize `body` with `success: true` merged into it.
fn success<T: Serialize>(body: &T) -> Result<Json<Value>> {
    let mut value = serde_json::to_value(body).map_err(RegistryError::from)?;
    if let Value::Object(map) = &mut value {
        map.insert("success".into(), Value::Bool(true));
    }
    Ok(Json(value))
}

/// Exactly one of the given image references must be present.
fn one_image(key: Option<String>, path: Option<PathBuf>, data: Option<String>) -> Result<ImageSource> {
    match (key, path, data) {
        (Some(key), None, None) => Ok(ImageSource::Key(key)),
        (None, Some(path), None) => Ok(ImageSource::Path(path)),
        (None, None, Some(data)) => Ok(ImageSource::Upload(decode_image_data(&data)?)),
        (None, None, None) => Err(invalid("no image given")),
        _ => Err(invalid("give only one image reference")),
    }
}

#[derive(Debug, Deserialize)]
struct FileBody {
    name: String,
    data: String,
}

fn decode_files(files: Vec<FileBody>) -> Result<Vec<UploadedFile>> {
    files
        .into_iter()
        .map(|f| -> Result<UploadedFile> {
            Ok(UploadedFile {
                data: decode_image_data(&f.data)?,
                name: f.name,
            })
        })
        .collect()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.registry.model(),
        "modelsLoaded": state.registry.models_loaded(),
        "registries": state.registry.loaded_registries(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollBody {
    image_key: Option<String>,
    path: Option<PathBuf>,
    image_data: Option<String>,
    subject_name: Option<String>,
    person_name: Option<String>,
    registry_name: Option<String>,
}

async fn enroll(State(state): State<Arc<AppState>>, body: JsonBody<EnrollBody>) -> Result<Json<Value>> {
    let Json(body) = body?;
    let req = EnrollRequest {
        registry: body.registry_name,
        image: one_image(body.image_key, body.path, body.image_data)?,
        subject_name: body.subject_name.or(body.person_name),
    };
    let cancel = state.request_token();
    let outcome = state.deadline(&cancel, state.registry.enroll(req, &cancel)).await?;
    success(&outcome)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncBody {
    registry_name: Option<String>,
    image_source_path: Option<PathBuf>,
    #[serde(default)]
    name_hints: Vec<NameHint>,
}

async fn sync(State(state): State<Arc<AppState>>, body: JsonBody<SyncBody>) -> Result<Json<Value>> {
    let Json(body) = body?;
    let cancel = state.request_token();
    let report = state
        .deadline(
            &cancel,
            state.registry.sync(
                body.registry_name.as_deref(),
                body.image_source_path.as_deref(),
                &body.name_hints,
                &cancel,
            ),
        )
        .await?;
    success(&report)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchBody {
    probe_image_key: Option<String>,
    path: Option<PathBuf>,
    probe_image_data: Option<String>,
    threshold: Option<f32>,
    top_k: Option<usize>,
    registry_name: Option<String>,
}

async fn match_probe(State(state): State<Arc<AppState>>, body: JsonBody<MatchBody>) -> Result<Json<Value>> {
    let Json(body) = body?;
    let req = MatchRequest {
        registry: body.registry_name,
        probe: one_image(body.probe_image_key, body.path, body.probe_image_data)?,
        threshold: body.threshold,
        top_k: body.top_k,
    };
    let cancel = state.request_token();
    let outcome = state.deadline(&cancel, state.registry.match_probe(req, &cancel)).await?;
    success(&outcome)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryQuery {
    registry_name: Option<String>,
}

async fn list_enrolled(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RegistryQuery>,
) -> Result<Json<Value>> {
    let enrolled = state.registry.list(query.registry_name.as_deref()).await?;
    Ok(Json(serde_json::to_value(enrolled).map_err(RegistryError::from)?))
}

async fn remove_enrolled(
    State(state): State<Arc<AppState>>,
    Path(image_key): Path<String>,
    Query(query): Query<RegistryQuery>,
) -> Result<Json<Value>> {
    let removed = state
        .registry
        .remove(query.registry_name.as_deref(), &image_key)
        .await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchBody {
    registry_name: Option<String>,
    probe_files: Vec<FileBody>,
    threshold: Option<f32>,
    top_k: Option<usize>,
}

async fn batch_recognize(State(state): State<Arc<AppState>>, body: JsonBody<BatchBody>) -> Result<Json<Value>> {
    let Json(body) = body?;
    let probes = decode_files(body.probe_files)?;
    let cancel = state.request_token();
    let batch = state.registry.batch_recognize(
        body.registry_name.as_deref(),
        &probes,
        body.threshold,
        body.top_k,
        &cancel,
    );
    let report = state.deadline(&cancel, batch).await?;
    Ok(Json(json!({
        "success": true,
        "csv": report.to_csv(),
        "rows": report.rows,
        "sync": report.sync,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetBody {
    files: Vec<FileBody>,
    #[serde(default)]
    name_hints: Vec<NameHint>,
}

async fn upload_dataset(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: JsonBody<DatasetBody>,
) -> Result<Json<Value>> {
    let Json(body) = body?;
    let files = decode_files(body.files)?;
    let cancel = state.request_token();
    let upload = state
        .registry
        .upload_dataset(&name, &files, &body.name_hints, &cancel);
    let report = state.deadline(&cancel, upload).await?;
    success(&report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use base64::Engine as _;
    use facereg_core::extractor::fake::FakeExtractor;
    use facereg_registry::{spawn_engine, RegistryConfig};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        dir: TempDir,
        router: Router,
    }

    fn app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let mut config = RegistryConfig::under(dir.path());
        config.threshold = 0.9;
        std::fs::create_dir_all(&config.images_dir).unwrap();
        let engine = spawn_engine(Box::new(FakeExtractor::new())).unwrap();
        let state = Arc::new(AppState {
            registry: FaceRegistry::new(config, engine),
            shutdown: CancellationToken::new(),
            operation_timeout: Duration::from_secs(30),
        });
        TestApp {
            dir,
            router: router(state),
        }
    }

    fn b64(faces: &[&[f32]]) -> String {
        base64::engine::general_purpose::STANDARD.encode(FakeExtractor::encode(faces))
    }

    impl TestApp {
        fn write_image(&self, key: &str, faces: &[&[f32]]) {
            let path = self.dir.path().join("images").join(key);
            std::fs::write(path, FakeExtractor::encode(faces)).unwrap();
        }

        async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let request = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => request
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => request.body(Body::empty()).unwrap(),
            };
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = app.call(Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model"], "fake");
        assert_eq!(body["modelsLoaded"], true);
    }

    #[tokio::test]
    async fn test_enroll_upload_then_list() {
        let app = app();
        let (status, body) = app
            .call(
                Method::POST,
                "/api/enroll",
                Some(json!({
                    "imageData": format!("data:image/jpeg;base64,{}", b64(&[&[1.0, 0.0]])),
                    "personName": "Ada Lovelace",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["added"], true);
        assert_eq!(body["embeddingCount"], 1);
        assert_eq!(body["subjectName"], "Ada_Lovelace");

        let (status, list) = app.call(Method::GET, "/api/enrolled", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["subjectName"], "Ada_Lovelace");
        assert!(list[0]["enrolledAt"].is_string());
    }

    #[tokio::test]
    async fn test_enroll_without_face_is_a_failure() {
        let app = app();
        app.write_image("blank.jpg", &[]);
        let (status, body) = app
            .call(Method::POST, "/api/enroll", Some(json!({ "imageKey": "blank.jpg" })))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "NoFaceDetected");

        let (_, list) = app.call(Method::GET, "/api/enrolled", None).await;
        assert_eq!(list, json!([]));
    }

    #[tokio::test]
    async fn test_request_errors() {
        let app = app();
        let (status, body) = app
            .call(Method::POST, "/api/enroll", Some(json!({ "imageData": "%%%", "personName": "X" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "InvalidRequest");

        let (status, _) = app.call(Method::POST, "/api/enroll", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .call(Method::POST, "/api/sync", Some(json!({ "registryName": "no/slashes" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "InvalidName");

        let (status, body) = app
            .call(Method::POST, "/api/match", Some(json!({ "probeImageKey": "ghost.jpg" })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "SourceNotFound");
    }

    #[tokio::test]
    async fn test_malformed_bodies_get_error_shape() {
        let app = app();
        for uri in ["/api/enroll", "/api/sync", "/api/match", "/api/batch-recognize", "/api/datasets/celebs"] {
            let request = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from("{ not json"))
                .unwrap();
            let response = app.router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["success"], false, "{uri}");
            assert_eq!(body["kind"], "InvalidRequest", "{uri}");
            assert!(body["message"].is_string());
        }

        // Wrong field types and a missing content type are rejected the same way.
        let (status, body) = app
            .call(Method::POST, "/api/match", Some(json!({ "topK": "five" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "InvalidRequest");

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/sync")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_match_and_remove() {
        let app = app();
        app.write_image("A_1.jpg", &[&[1.0, 0.0, 0.0]]);
        app.write_image("A_2.jpg", &[&[0.98, 0.1, 0.0]]);
        app.write_image("B_1.jpg", &[&[0.0, 1.0, 0.0]]);

        let (status, body) = app.call(Method::POST, "/api/sync", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], 3);
        assert_eq!(body["removed"], 0);
        assert_eq!(body["total"], 3);

        let (status, body) = app
            .call(Method::POST, "/api/match", Some(json!({ "probeImageKey": "A_1.jpg", "topK": 5 })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["probe"], "A_1.jpg");
        let matches = body["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["imageKey"], "A_2.jpg");
        assert_eq!(matches[0]["subjectName"], "A");

        let (status, body) = app
            .call(
                Method::POST,
                "/api/match",
                Some(json!({ "probeImageData": b64(&[&[0.0, 0.0, 1.0]]) })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matches"], json!([]));

        let (status, body) = app.call(Method::DELETE, "/api/enrolled/A_2.jpg", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);
        let (_, list) = app.call(Method::GET, "/api/enrolled?registryName=default", None).await;
        assert_eq!(list.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dataset_upload_and_batch() {
        let app = app();
        let (status, body) = app
            .call(
                Method::POST,
                "/api/datasets/celebs",
                Some(json!({
                    "files": [
                        { "name": "A_1.jpg", "data": b64(&[&[1.0, 0.0]]) },
                        { "name": "B_1.jpg", "data": b64(&[&[0.0, 1.0]]) },
                    ],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["added"], 2);

        let (status, body) = app
            .call(
                Method::POST,
                "/api/batch-recognize",
                Some(json!({
                    "registryName": "celebs",
                    "probeFiles": [
                        { "name": "p1.jpg", "data": b64(&[&[1.0, 0.0]]) },
                        { "name": "p2.jpg", "data": b64(&[]) },
                        { "name": "p3.jpg", "data": b64(&[&[-1.0, 0.0]]) },
                    ],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let csv = body["csv"].as_str().unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "p1.jpg,A,1.0000");
        assert_eq!(lines[2], "p2.jpg,NO_FACE,");
        assert_eq!(lines[3], "p3.jpg,NO_MATCH,");
        assert_eq!(body["rows"][1]["status"], "noFace");
    }

    #[tokio::test]
    async fn test_cancelled_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig::under(dir.path());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let state = Arc::new(AppState {
            registry: FaceRegistry::new(config, spawn_engine(Box::new(FakeExtractor::new())).unwrap()),
            shutdown,
            operation_timeout: Duration::from_secs(30),
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/match")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "probeImageData": b64(&[&[1.0]]) }).to_string()))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
