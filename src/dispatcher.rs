//! Mock request dispatch.
//!
//! A request to `/mock/<projectId>/<path>` moves through:
//!
//! ```text
//! ResolvingDefinition -> Validating -> Synthesizing | Proxying -> Finalizing
//! ```
//!
//! Validation never short-circuits: generation or proxying still runs, and the
//! error list replaces the body at finalization.

use crate::cache::DefinitionCache;
use crate::counter::InvocationCounter;
use crate::error::{MockError, MockResult};
use crate::matcher::find_match;
use crate::model::{HttpMethod, MockDefinition, Mode};
use crate::proxy::ProxyForwarder;
use crate::synthesizer::synthesize;
use crate::template::{RequestContext, TemplateSandbox};
use crate::validator::validate_request;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path prefix served by the dispatcher.
pub const MOCK_PREFIX: &str = "/mock/";

/// Length of a project identifier.
pub const PROJECT_ID_LEN: usize = 24;

const JSON_TYPE: &str = "application/json; charset=utf-8";
const SCRIPT_TYPE: &str = "text/javascript; charset=utf-8";

/// Split `/mock/<projectId>/<rest>` into the project id and the mock path.
///
/// An empty rest becomes `/`.
pub fn parse_mock_path(path: &str) -> MockResult<(&str, String)> {
    let rest = path.strip_prefix(MOCK_PREFIX).ok_or(MockError::NotFound)?;
    let (project_id, tail) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    if project_id.chars().count() != PROJECT_ID_LEN {
        return Err(MockError::NotFound);
    }
    let mock_path = if tail.is_empty() { "/".to_string() } else { tail.to_string() };
    Ok((project_id, mock_path))
}

/// An incoming mock request.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: Method,
    /// Full request path, including `/mock/<projectId>`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

/// The finished response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Query parameter naming the JSONP callback parameter.
    pub jsonp_param_name: String,
    /// Callback used when the named parameter is absent.
    pub default_callback: String,
    /// Projects refused with `Blocked`.
    pub blacklist: HashSet<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            jsonp_param_name: "jsonp_param_name".to_string(),
            default_callback: "callback".to_string(),
            blacklist: HashSet::new(),
        }
    }
}

/// Output before finalization.
enum Output {
    Json(Value),
    Raw {
        content_type: Option<String>,
        body: Bytes,
    },
}

/// Resolves and serves mock requests.
pub struct Dispatcher {
    cache: Arc<DefinitionCache>,
    sandbox: TemplateSandbox,
    proxy: ProxyForwarder,
    counter: Arc<InvocationCounter>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<DefinitionCache>,
        sandbox: TemplateSandbox,
        proxy: ProxyForwarder,
        counter: Arc<InvocationCounter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            cache,
            sandbox,
            proxy,
            counter,
            settings,
        }
    }

    pub fn counter(&self) -> &Arc<InvocationCounter> {
        &self.counter
    }

    /// Serve one mock request.
    pub async fn dispatch(&self, request: MockRequest) -> MockResult<MockResponse> {
        let (project_id, mock_path) = parse_mock_path(&request.path)?;

        if self.settings.blacklist.contains(project_id) {
            warn!(project_id = %project_id, "Blocked project requested");
            return Err(MockError::Blocked);
        }

        // Unsupported verbs can never match a definition
        let method = HttpMethod::try_from(&request.method).map_err(|_| MockError::NotFound)?;

        let definitions = self.cache.load(project_id).await?;
        let mock_path = match definitions.first() {
            Some(first) => first.definition.project.strip_base_path(&mock_path).to_string(),
            None => mock_path,
        };

        let matched = match find_match(&definitions, method, &mock_path) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(project_id = %project_id, method = %method, path = %mock_path, "No mock definition matched");
                return Err(e);
            }
        };
        let definition = matched.definition;
        info!(
            project_id = %project_id,
            definition_id = %definition.id,
            method = %method,
            path = %mock_path,
            "Mock definition matched"
        );

        let errors = validate_request(method, &definition.params, &request.query, request.body.as_ref());
        if !errors.is_empty() {
            debug!(definition_id = %definition.id, errors = errors.len(), "Parameter validation failed");
        }

        let produced = self.produce(definition, &request, method, matched.params).await;
        self.counter.record(&definition.id);
        let (status, mut headers, output) = produced?;

        let output = if errors.is_empty() {
            output
        } else {
            Output::Json(serde_json::to_value(&errors).map_err(|e| MockError::Repository(e.to_string()))?)
        };

        let callback = if errors.is_empty() { self.jsonp_callback(&request.query) } else { None };
        let body = match (output, callback) {
            (output, Some(callback)) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(SCRIPT_TYPE));
                jsonp(&callback, &output_value(output))
            }
            (Output::Json(value), None) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_TYPE));
                Bytes::from(serde_json::to_vec(&value).map_err(|e| MockError::Repository(e.to_string()))?)
            }
            (Output::Raw { content_type, body }, None) => {
                if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                    headers.insert(CONTENT_TYPE, value);
                }
                body
            }
        };

        Ok(MockResponse { status, headers, body })
    }

    /// Run the definition's mode: synthesize from a template or proxy upstream.
    async fn produce(
        &self,
        definition: &MockDefinition,
        request: &MockRequest,
        method: HttpMethod,
        params: crate::matcher::PathParams,
    ) -> MockResult<(StatusCode, HeaderMap, Output)> {
        match definition.mode() {
            Mode::Proxy(upstream) => {
                let response = self
                    .proxy
                    .forward(upstream, method, &params, &request.query, request.body.as_ref())
                    .await
                    .inspect_err(|e| {
                        warn!(definition_id = %definition.id, error = %e, "Upstream request failed")
                    })?;
                let output = Output::Raw {
                    content_type: response.content_type,
                    body: response.body,
                };
                Ok((response.status, HeaderMap::new(), output))
            }
            Mode::Template(mode) => {
                let context = request_context(request, params);
                let generated = self
                    .sandbox
                    .execute(mode, context)
                    .await
                    .inspect_err(|e| {
                        warn!(definition_id = %definition.id, error = %e, "Template evaluation failed")
                    })?;

                let synthesized = synthesize(generated);
                let mut headers = HeaderMap::new();
                for (name, value) in &synthesized.headers {
                    match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                        (Ok(name), Ok(value)) => {
                            headers.insert(name, value);
                        }
                        _ => debug!(header = %name, "Skipping invalid response header"),
                    }
                }
                for (name, value) in &synthesized.cookies {
                    let cookie = format!("{}={}; path=/; httponly", name, value);
                    match HeaderValue::from_str(&cookie) {
                        Ok(value) => {
                            headers.append(SET_COOKIE, value);
                        }
                        Err(_) => debug!(cookie = %name, "Skipping invalid cookie"),
                    }
                }
                Ok((synthesized.status, headers, Output::Json(synthesized.body)))
            }
        }
    }

    /// `?jsonp_param_name=cb&cb=fn` names callback `fn`; without `cb` it is the default.
    fn jsonp_callback(&self, query: &[(String, String)]) -> Option<String> {
        let lookup = |key: &str| query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        let param = lookup(&self.settings.jsonp_param_name).filter(|p| !p.is_empty())?;
        let callback = lookup(param)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.settings.default_callback);
        Some(callback.to_string())
    }
}

fn output_value(output: Output) -> Value {
    match output {
        Output::Json(value) => value,
        Output::Raw { body, .. } => serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned())),
    }
}

/// `callback(<pretty json>)` with line and paragraph separators escaped.
fn jsonp(callback: &str, value: &Value) -> Bytes {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string());
    let script = format!("{}({})", callback, json)
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029");
    Bytes::from(script)
}

fn request_context(request: &MockRequest, params: crate::matcher::PathParams) -> RequestContext {
    let headers = request
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    RequestContext {
        method: request.method.as_str().to_string(),
        path: request.path.clone(),
        params,
        query: request.query.clone(),
        headers,
        cookies: parse_cookies(&request.headers),
        body: request.body.clone(),
    }
}

/// Cookies from every `Cookie` header, first occurrence of a name winning.
pub fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies: Vec<(String, String)> = Vec::new();
    for header in headers.get_all(COOKIE) {
        let Ok(header) = header.to_str() else { continue };
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else { continue };
            let name = name.trim();
            if name.is_empty() || cookies.iter().any(|(n, _)| n == name) {
                continue;
            }
            cookies.push((name.to_string(), value.trim().trim_matches('"').to_string()));
        }
    }
    cookies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParamRule, ParamSchema, Project};
    use crate::repository::{DefinitionFields, DefinitionRepository, MemoryRepository};
    use crate::template::SandboxLimits;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::time::Duration;

    const PID: &str = "5a0f4e6b3c2d1e0f9a8b7c6d";

    async fn setup(base_path: &str, definitions: Vec<DefinitionFields>) -> Dispatcher {
        setup_with(base_path, definitions, DispatchSettings::default()).await
    }

    async fn setup_with(
        base_path: &str,
        definitions: Vec<DefinitionFields>,
        settings: DispatchSettings,
    ) -> Dispatcher {
        let repo = Arc::new(MemoryRepository::new());
        repo.upsert_project(Project {
            id: PID.to_string(),
            base_path: base_path.to_string(),
            owner: "u1".to_string(),
            group: None,
            members: vec![],
        })
        .await;
        for fields in definitions {
            repo.create(PID, fields).await.unwrap();
        }
        let cache = Arc::new(DefinitionCache::new(repo, Duration::from_secs(1800), 100));
        Dispatcher::new(
            cache,
            TemplateSandbox::new(SandboxLimits::default()),
            ProxyForwarder::new(Duration::from_millis(3000)),
            Arc::new(InvocationCounter::new()),
            settings,
        )
    }

    fn def(url: &str, method: HttpMethod, mode: &str) -> DefinitionFields {
        DefinitionFields {
            url: url.to_string(),
            method,
            mode: mode.to_string(),
            params: ParamSchema::new(),
            description: "test".to_string(),
        }
    }

    fn request(method: Method, path: &str, query: &[(&str, &str)]) -> MockRequest {
        MockRequest {
            method,
            path: path.to_string(),
            query: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    fn json_body(response: &MockResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn test_parse_mock_path() {
        let full = format!("/mock/{}/users/1", PID);
        let (pid, path) = parse_mock_path(&full).unwrap();
        assert_eq!((pid, path.as_str()), (PID, "/users/1"));

        let bare = format!("/mock/{}", PID);
        let (_, path) = parse_mock_path(&bare).unwrap();
        assert_eq!(path, "/");

        assert_eq!(parse_mock_path("/mock/short/a"), Err(MockError::NotFound));
        assert_eq!(parse_mock_path("/api/x"), Err(MockError::NotFound));
    }

    #[test]
    fn test_parse_cookies() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("a=1; b=\"two\""));
        headers.append(COOKIE, HeaderValue::from_static("a=3; c=4"));
        assert_eq!(
            parse_cookies(&headers),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
                ("c".to_string(), "4".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_template_dispatch() {
        let dispatcher = setup("/", vec![def("/users/{id}", HttpMethod::Get, "{ id: function (o) { return o._req.params.id; }, ok: true }")]).await;
        let response = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/users/42", PID), &[]))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers[CONTENT_TYPE], JSON_TYPE);
        assert_eq!(json_body(&response), json!({"id": "42", "ok": true}));
        assert_eq!(dispatcher.counter().snapshot().total, 1);
    }

    #[tokio::test]
    async fn test_method_mismatch_is_not_found() {
        let dispatcher = setup("/", vec![def("/a", HttpMethod::Get, "{}")]).await;
        let err = dispatcher
            .dispatch(request(Method::POST, &format!("/mock/{}/a", PID), &[]))
            .await
            .unwrap_err();
        assert_eq!(err, MockError::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let dispatcher = setup("/", vec![]).await;
        let err = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/a", "f".repeat(24)), &[]))
            .await
            .unwrap_err();
        assert_eq!(err, MockError::NotFound);
    }

    #[tokio::test]
    async fn test_base_path_is_stripped() {
        let dispatcher = setup("/v1", vec![def("/", HttpMethod::Get, "{ root: true }"), def("/items", HttpMethod::Get, "{ items: [] }")]).await;

        let response = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/v1/items", PID), &[]))
            .await
            .unwrap();
        assert_eq!(json_body(&response), json!({"items": []}));

        let response = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/v1", PID), &[]))
            .await
            .unwrap();
        assert_eq!(json_body(&response), json!({"root": true}));
    }

    #[tokio::test]
    async fn test_blacklisted_project() {
        let settings = DispatchSettings {
            blacklist: [PID.to_string()].into_iter().collect(),
            ..Default::default()
        };
        let dispatcher = setup_with("/", vec![def("/a", HttpMethod::Get, "{}")], settings).await;
        let err = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/a", PID), &[]))
            .await
            .unwrap_err();
        assert_eq!(err, MockError::Blocked);
    }

    #[tokio::test]
    async fn test_control_key_overrides() {
        let mode = "{ _res: { status: 201, headers: { 'X-Mock': 'yes' }, cookies: { sid: 'abc' }, data: { x: 1 } }, y: 2 }";
        let dispatcher = setup("/", vec![def("/a", HttpMethod::Post, mode)]).await;
        let response = dispatcher
            .dispatch(request(Method::POST, &format!("/mock/{}/a", PID), &[]))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["x-mock"], "yes");
        assert_eq!(response.headers[SET_COOKIE], "sid=abc; path=/; httponly");
        assert_eq!(json_body(&response), json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_jsonp_output() {
        let dispatcher = setup("/", vec![def("/a", HttpMethod::Get, "{ a: 1 }")]).await;
        let response = dispatcher
            .dispatch(request(
                Method::GET,
                &format!("/mock/{}/a", PID),
                &[("jsonp_param_name", "cb"), ("cb", "myFunc")],
            ))
            .await
            .unwrap();
        assert_eq!(response.headers[CONTENT_TYPE], SCRIPT_TYPE);
        assert_eq!(&response.body[..], b"myFunc({\n  \"a\": 1\n})");

        // Named parameter absent: default callback
        let response = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/a", PID), &[("jsonp_param_name", "cb")]))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"callback({\n  \"a\": 1\n})");
    }

    #[tokio::test]
    async fn test_jsonp_escapes_separators() {
        let dispatcher = setup("/", vec![def("/a", HttpMethod::Get, "{ s: 'x\\u2028y\\u2029z' }")]).await;
        let response = dispatcher
            .dispatch(request(
                Method::GET,
                &format!("/mock/{}/a", PID),
                &[("jsonp_param_name", "cb"), ("cb", "f")],
            ))
            .await
            .unwrap();
        let body = String::from_utf8(response.body.to_vec()).unwrap();
        assert_eq!(body, "f({\n  \"s\": \"x\\u2028y\\u2029z\"\n})");
    }

    #[tokio::test]
    async fn test_validation_errors_replace_body() {
        let mut fields = def("/a", HttpMethod::Post, "{ ok: true }");
        fields.params.insert("name".to_string(), vec![ParamRule::Type("string".to_string())]);
        let dispatcher = setup("/", vec![fields]).await;

        let response = dispatcher
            .dispatch(request(Method::POST, &format!("/mock/{}/a", PID), &[]))
            .await
            .unwrap();
        assert_eq!(
            json_body(&response),
            json!([{"message": "required", "field": "name", "code": "missing_field"}])
        );
        // Generation still ran and was counted
        assert_eq!(dispatcher.counter().snapshot().total, 1);
    }

    #[tokio::test]
    async fn test_get_validation_only_checks_presence() {
        let mut fields = def("/a", HttpMethod::Get, "{ ok: true }");
        fields.params.insert("page".to_string(), vec![ParamRule::Type("int".to_string())]);
        let dispatcher = setup("/", vec![fields]).await;

        let response = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/a", PID), &[("page", "abc")]))
            .await
            .unwrap();
        assert_eq!(json_body(&response), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_sandbox_failure_propagates_and_counts() {
        let dispatcher = setup("/", vec![def("/a", HttpMethod::Get, "(function () { while (true) {} })()")]).await;
        let err = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/a", PID), &[]))
            .await
            .unwrap_err();
        assert_eq!(err, MockError::SandboxTimeout);
        assert_eq!(dispatcher.counter().snapshot().total, 1);
    }

    #[tokio::test]
    async fn test_proxy_dispatch() {
        let app = Router::new().route(
            "/items/{id}",
            get(|axum::extract::Path(id): axum::extract::Path<String>,
                 axum::extract::Query(q): axum::extract::Query<std::collections::HashMap<String, String>>| async move {
                Json(json!({"id": id, "q": q}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mode = format!("http://{}/items/{{id}}?from=mode", addr);
        let dispatcher = setup("/", vec![def("/items/{id}", HttpMethod::Get, &mode)]).await;
        let response = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/items/42", PID), &[("from", "req"), ("k", "v")]))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(json_body(&response), json!({"id": "42", "q": {"from": "req", "k": "v"}}));
    }

    #[tokio::test]
    async fn test_proxy_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mode = format!("http://{}/down", addr);
        let dispatcher = setup("/", vec![def("/a", HttpMethod::Get, &mode)]).await;
        let err = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/a", PID), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, MockError::UpstreamFailure(_)));
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let dispatcher = setup(
            "/",
            vec![
                def("/users/{id}", HttpMethod::Get, "{ which: 'param' }"),
                def("/users/me", HttpMethod::Get, "{ which: 'literal' }"),
            ],
        )
        .await;
        let response = dispatcher
            .dispatch(request(Method::GET, &format!("/mock/{}/users/me", PID), &[]))
            .await
            .unwrap();
        assert_eq!(json_body(&response), json!({"which": "param"}));
    }
}
