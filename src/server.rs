//! HTTP surface.
//!
//! `ANY /mock/<projectId>/<path>` is served by the [`Dispatcher`]; `/api/mock`
//! routes manage definitions through the [`DefinitionStore`]. Management
//! responses and dispatch errors use the envelope
//! `{code, success, message, data}`.

use crate::cache::DefinitionCache;
use crate::config::MockServerConfig;
use crate::counter::InvocationCounter;
use crate::dispatcher::{Dispatcher, MockRequest, MockResponse};
use crate::error::{MockError, MockResult};
use crate::model::NewDefinition;
use crate::proxy::ProxyForwarder;
use crate::repository::MemoryRepository;
use crate::store::{DefinitionStore, ListQuery};
use crate::template::TemplateSandbox;
use axum::body::{Body, Bytes};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<DefinitionStore>,
}

impl AppState {
    /// Wire the engine from configuration, seeding the in-memory repository.
    pub async fn from_config(config: &MockServerConfig) -> MockResult<Self> {
        let repository = Arc::new(MemoryRepository::new());
        for seed in &config.projects {
            repository.upsert_project(seed.project()).await;
        }

        let cache = Arc::new(DefinitionCache::new(
            repository,
            config.cache.ttl(),
            config.cache.max_projects,
        ));
        let store = Arc::new(DefinitionStore::new(cache.clone()));
        for seed in &config.projects {
            for mock in &seed.mocks {
                store.create(&seed.id, mock.clone()).await?;
            }
        }

        let dispatcher = Dispatcher::new(
            cache,
            TemplateSandbox::new(config.sandbox.limits()),
            ProxyForwarder::new(config.proxy.timeout()),
            Arc::new(InvocationCounter::new()),
            config.dispatch_settings(),
        );

        info!(
            projects = config.projects.len(),
            mocks = config.mock_count(),
            "Repository seeded"
        );

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            store,
        })
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/mock", get(list_mocks))
        .route("/api/mock/by_projects", get(mocks_by_projects))
        .route("/api/mock/stats", get(stats))
        .route("/api/mock/create", post(create_mock))
        .route("/api/mock/update", post(update_mock))
        .route("/api/mock/delete", post(delete_mocks))
        .fallback(serve_mock)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    code: i64,
    success: bool,
    message: String,
    data: Option<T>,
}

fn success<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        code: 200,
        success: true,
        message: "success".to_string(),
        data: Some(data),
    })
    .into_response()
}

fn failure(err: &MockError) -> Response {
    let envelope: Envelope<()> = Envelope {
        code: err.code(),
        success: false,
        message: err.to_string(),
        data: None,
    };
    (err.status(), Json(envelope)).into_response()
}

fn respond<T: Serialize>(result: MockResult<T>) -> Response {
    match result {
        Ok(data) => success(data),
        Err(e) => failure(&e),
    }
}

async fn serve_mock(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match mock_request(method, &uri, headers, &body) {
        Ok(request) => request,
        Err(e) => return failure(&e),
    };
    match state.dispatcher.dispatch(request).await {
        Ok(response) => into_response(response),
        Err(e) => failure(&e),
    }
}

fn mock_request(method: Method, uri: &Uri, headers: HeaderMap, body: &[u8]) -> MockResult<MockRequest> {
    let query = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    let body = parse_body(&headers, body)?;
    Ok(MockRequest {
        method,
        path: uri.path().to_string(),
        query,
        headers,
        body,
    })
}

/// JSON or form bodies become a JSON value. Anything else is dropped.
fn parse_body(headers: &HeaderMap, body: &[u8]) -> MockResult<Option<Value>> {
    if body.is_empty() {
        return Ok(None);
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let fields: Map<String, Value> = url::form_urlencoded::parse(body)
            .into_owned()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        return Ok(Some(Value::Object(fields)));
    }
    if content_type.contains("json") {
        return serde_json::from_slice(body)
            .map(Some)
            .map_err(|e| MockError::InvalidRequest(format!("invalid JSON body: {}", e)));
    }
    debug!(content_type = %content_type, "Ignoring unsupported request body");
    Ok(None)
}

fn into_response(response: MockResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    project_id: String,
    keywords: Option<String>,
    page_size: Option<usize>,
    page_index: Option<usize>,
}

async fn list_mocks(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(e) => return failure(&MockError::InvalidRequest(e.body_text())),
    };
    let query = ListQuery {
        keywords: params.keywords,
        page_size: params.page_size,
        page_index: params.page_index,
    };
    respond(state.store.list(&params.project_id, &query).await)
}

#[derive(Debug, Deserialize)]
struct ByProjectsParams {
    #[serde(default)]
    project_ids: String,
}

async fn mocks_by_projects(
    State(state): State<AppState>,
    params: Result<Query<ByProjectsParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(e) => return failure(&MockError::InvalidRequest(e.body_text())),
    };
    let ids: Vec<String> = params
        .project_ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    respond(state.store.by_projects(&ids).await)
}

async fn stats(State(state): State<AppState>) -> Response {
    success(state.dispatcher.counter().snapshot())
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    project_id: String,
    #[serde(flatten)]
    definition: NewDefinition,
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    id: String,
    #[serde(flatten)]
    definition: NewDefinition,
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    project_id: String,
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: usize,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> MockResult<T> {
    body.map(|Json(body)| body)
        .map_err(|e| MockError::InvalidRequest(e.body_text()))
}

async fn create_mock(
    State(state): State<AppState>,
    body: Result<Json<CreateBody>, JsonRejection>,
) -> Response {
    let body = match json_body(body) {
        Ok(body) => body,
        Err(e) => return failure(&e),
    };
    respond(state.store.create(&body.project_id, body.definition).await)
}

async fn update_mock(
    State(state): State<AppState>,
    body: Result<Json<UpdateBody>, JsonRejection>,
) -> Response {
    let body = match json_body(body) {
        Ok(body) => body,
        Err(e) => return failure(&e),
    };
    respond(state.store.update(&body.id, body.definition).await)
}

async fn delete_mocks(
    State(state): State<AppState>,
    body: Result<Json<DeleteBody>, JsonRejection>,
) -> Response {
    let body = match json_body(body) {
        Ok(body) => body,
        Err(e) => return failure(&e),
    };
    respond(
        state
            .store
            .delete(&body.project_id, &body.ids)
            .await
            .map(|deleted| Deleted { deleted }),
    )
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, stopping server");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const PID: &str = "5a0f4e6b3c2d1e0f9a8b7c6d";

    const CONFIG: &str = r#"
jsonp:
  param_name: jsonp_param_name
projects:
  - id: 5a0f4e6b3c2d1e0f9a8b7c6d
    base_path: /api
    mocks:
      - url: /users/{id}
        method: get
        description: one user
        mode: "{ id: function (o) { return o._req.params.id; }, 'tags|2': ['x'] }"
      - url: /login
        method: post
        description: login
        params:
          name: [string]
        mode: "{ token: 'abc', user: function (o) { return o._req.body.name; } }"
"#;

    async fn app() -> Router {
        let config = MockServerConfig::from_yaml(CONFIG).unwrap();
        router(AppState::from_config(&config).await.unwrap())
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_seeded_mock() {
        let app = app().await;
        let (status, headers, body) = call(&app, get_request(&format!("/mock/{}/api/users/42", PID))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[CONTENT_TYPE].to_str().unwrap().starts_with("application/json"));
        assert_eq!(body["id"], "42");
        assert_eq!(body["tags"], serde_json::json!(["x", "x"]));
    }

    #[tokio::test]
    async fn test_unmatched_is_not_found_envelope() {
        let app = app().await;
        let (status, _, body) = call(&app, get_request(&format!("/mock/{}/api/nothing", PID))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
        assert_eq!(body["success"], false);
        assert!(body["data"].is_null());

        let (status, _, _) = call(&app, get_request("/elsewhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_form_body_reaches_template() {
        let app = app().await;
        let request = Request::builder()
            .method("POST")
            .uri(format!("/mock/{}/api/login", PID))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("name=ada"))
            .unwrap();
        let (status, _, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"], "ada");
    }

    #[tokio::test]
    async fn test_missing_param_returns_errors() {
        let app = app().await;
        let (status, _, body) = call(
            &app,
            post_json(&format!("/mock/{}/api/login", PID), serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["field"], "name");
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let app = app().await;
        let request = Request::builder()
            .method("POST")
            .uri(format!("/mock/{}/api/login", PID))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{nope"))
            .unwrap();
        let (status, _, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 10001);
    }

    #[tokio::test]
    async fn test_create_then_serve_and_delete() {
        let app = app().await;
        let (status, _, body) = call(
            &app,
            post_json(
                "/api/mock/create",
                serde_json::json!({
                    "project_id": PID,
                    "url": "/ping",
                    "method": "get",
                    "mode": "{ pong: true }",
                    "description": "ping"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (_, _, served) = call(&app, get_request(&format!("/mock/{}/api/ping", PID))).await;
        assert_eq!(served["pong"], true);

        let (_, _, listed) = call(&app, get_request(&format!("/api/mock?project_id={}", PID))).await;
        assert_eq!(listed["data"]["mocks"].as_array().unwrap().len(), 3);
        assert_eq!(listed["data"]["mocks"][0]["url"], "/ping");

        let (_, _, deleted) = call(
            &app,
            post_json("/api/mock/delete", serde_json::json!({"project_id": PID, "ids": [id]})),
        )
        .await;
        assert_eq!(deleted["data"]["deleted"], 1);

        let (status, _, _) = call(&app, get_request(&format!("/mock/{}/api/ping", PID))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_changes_served_body() {
        let app = app().await;
        let (_, _, listed) = call(
            &app,
            get_request(&format!("/api/mock?project_id={}&keywords=login", PID)),
        )
        .await;
        let id = listed["data"]["mocks"][0]["id"].as_str().unwrap().to_string();

        let (_, _, body) = call(
            &app,
            post_json(
                "/api/mock/update",
                serde_json::json!({
                    "id": id,
                    "url": "/login",
                    "method": "post",
                    "mode": "{ token: 'new' }",
                    "description": "login"
                }),
            ),
        )
        .await;
        assert_eq!(body["success"], true);

        let (_, _, served) = call(
            &app,
            post_json(&format!("/mock/{}/api/login", PID), serde_json::json!({})),
        )
        .await;
        assert_eq!(served["token"], "new");
    }

    #[tokio::test]
    async fn test_create_duplicate_conflicts() {
        let app = app().await;
        let (status, _, body) = call(
            &app,
            post_json(
                "/api/mock/create",
                serde_json::json!({
                    "project_id": PID,
                    "url": "/login",
                    "method": "POST",
                    "mode": "{}",
                    "description": "again"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], -1);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_body() {
        let app = app().await;
        let (_, _, body) = call(&app, post_json("/api/mock/create", serde_json::json!({"url": 1}))).await;
        assert_eq!(body["code"], 10001);
    }

    #[tokio::test]
    async fn test_stats_and_by_projects() {
        let app = app().await;
        call(&app, get_request(&format!("/mock/{}/api/users/1", PID))).await;
        call(&app, get_request(&format!("/mock/{}/api/users/2", PID))).await;

        let (_, _, stats) = call(&app, get_request("/api/mock/stats")).await;
        assert_eq!(stats["data"]["total"], 2);

        let (_, _, grouped) = call(
            &app,
            get_request(&format!("/api/mock/by_projects?project_ids={},unknown", PID)),
        )
        .await;
        assert_eq!(grouped["data"][PID]["mocks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_requires_project() {
        let app = app().await;
        let (_, _, body) = call(&app, get_request("/api/mock")).await;
        assert_eq!(body["code"], 10001);
    }
}
