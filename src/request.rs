//! HTTP request materialization.
//!
//! Turns a template-walked [`Request`] into a `reqwest` builder:
//! method, base-url joining, query parameters, header composition with
//! the body variant's default `Content-Type`, all body encodings, and
//! authenticator application. File-backed bodies resolve relative to
//! the scenario file and must stay under the configured root.

use crate::error::{Error, Result};
use crate::model::{Body, HttpMethod, ParamValue, Request};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method as ReqMethod, RequestBuilder};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Credential material applied to an outgoing request, produced by an
/// auth factory function.
#[derive(Debug, Clone, PartialEq)]
pub enum Authenticator {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: Option<String>,
    },
    Header {
        name: String,
        value: String,
    },
}

impl Authenticator {
    fn apply(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        match self {
            Self::Bearer { token } => Ok(builder.bearer_auth(token)),
            Self::Basic { username, password } => {
                Ok(builder.basic_auth(username, password.as_deref()))
            }
            Self::Header { name, value } => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::validation(format!("bad auth header name: {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| Error::validation(format!("bad auth header value: {e}")))?;
                Ok(builder.header(name, value))
            }
        }
    }
}

/// Filesystem and base-url surroundings of a request build.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestEnv<'a> {
    pub base_url: Option<&'a str>,
    /// Directory of the scenario file; file bodies resolve here.
    pub scenario_dir: Option<&'a Path>,
    /// All file references must stay under this directory.
    pub root: Option<&'a Path>,
}

pub fn convert_method(method: HttpMethod) -> ReqMethod {
    match method {
        HttpMethod::Get => ReqMethod::GET,
        HttpMethod::Post => ReqMethod::POST,
        HttpMethod::Put => ReqMethod::PUT,
        HttpMethod::Delete => ReqMethod::DELETE,
        HttpMethod::Patch => ReqMethod::PATCH,
        HttpMethod::Head => ReqMethod::HEAD,
        HttpMethod::Options => ReqMethod::OPTIONS,
    }
}

/// Assemble a ready-to-send builder from a walked request.
pub async fn build_request(
    client: &Client,
    request: &Request,
    env: &RequestEnv<'_>,
    auth: Option<&Authenticator>,
) -> Result<RequestBuilder> {
    let url = join_url(&request.url, env.base_url)?;
    debug!(url = %url, method = ?request.method, "building request");

    let mut builder = client
        .request(convert_method(request.method), &url)
        .timeout(Duration::from_secs_f64(request.timeout));

    if !request.params.is_empty() {
        let pairs = query_pairs(request)?;
        builder = builder.query(&pairs);
    }

    builder = builder.headers(compose_headers(request)?);

    builder = match &request.body {
        None => builder,
        Some(Body::Json(value)) => builder.body(
            serde_json::to_vec(value)
                .map_err(|e| Error::validation(format!("cannot encode json body: {e}")))?,
        ),
        Some(Body::Graphql { query, variables }) => {
            let envelope = match variables {
                Some(vars) => json!({"query": query, "variables": vars}),
                None => json!({"query": query}),
            };
            builder.body(
                serde_json::to_vec(&envelope)
                    .map_err(|e| Error::validation(format!("cannot encode graphql body: {e}")))?,
            )
        }
        Some(Body::Form(pairs)) => {
            let mut encoded = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in pairs {
                encoded.append_pair(key, value);
            }
            builder.body(encoded.finish())
        }
        Some(Body::Xml(text)) | Some(Body::Text(text)) => builder.body(text.clone()),
        Some(Body::Base64(encoded)) => builder.body(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| Error::validation(format!("invalid base64 body: {e}")))?,
        ),
        Some(Body::Binary(path)) => {
            let resolved = resolve_upload_path(path, env)?;
            let bytes = tokio::fs::read(&resolved).await.map_err(|e| {
                Error::path(format!("cannot read '{}': {e}", resolved.display()))
            })?;
            builder.body(bytes)
        }
        Some(Body::Files(files)) => {
            let mut form = reqwest::multipart::Form::new();
            for (field, path) in files {
                let resolved = resolve_upload_path(path, env)?;
                let bytes = tokio::fs::read(&resolved).await.map_err(|e| {
                    Error::path(format!("cannot read '{}': {e}", resolved.display()))
                })?;
                let file_name = resolved
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| field.clone());
                form = form.part(
                    field.clone(),
                    reqwest::multipart::Part::bytes(bytes).file_name(file_name),
                );
            }
            builder.multipart(form)
        }
    };

    if let Some(auth) = auth {
        builder = auth.apply(builder)?;
    }

    Ok(builder)
}

/// Relative URLs are joined onto the configured base URL; absolute
/// URLs pass through untouched.
fn join_url(raw: &str, base_url: Option<&str>) -> Result<String> {
    if raw.contains("://") {
        return Ok(raw.to_string());
    }
    let Some(base) = base_url else {
        return Ok(raw.to_string());
    };

    let base = reqwest::Url::parse(base)
        .map_err(|e| Error::validation(format!("invalid base url '{base}': {e}")))?;
    if raw.is_empty() {
        return Ok(base.to_string());
    }
    let normalized = raw.trim_start_matches('/');
    let joined = base
        .join(normalized)
        .map_err(|e| Error::validation(format!("cannot join '{raw}' onto base: {e}")))?;
    Ok(joined.to_string())
}

fn query_pairs(request: &Request) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (key, value) in &request.params {
        match value {
            ParamValue::One(scalar) => pairs.push((key.clone(), scalar_string(scalar)?)),
            ParamValue::Many(values) => {
                for scalar in values {
                    pairs.push((key.clone(), scalar_string(scalar)?));
                }
            }
        }
    }
    Ok(pairs)
}

fn scalar_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(_) | Value::Bool(_) => Ok(value.to_string()),
        other => Err(Error::validation(format!(
            "query parameter values must be scalars, got {}",
            crate::model::json_kind(other)
        ))),
    }
}

/// Explicit headers, with the body variant's default `Content-Type`
/// added only when none is present (case-insensitive).
fn compose_headers(request: &Request) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    let has_content_type = request
        .headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("content-type"));
    if !has_content_type {
        if let Some(default) = request.body.as_ref().and_then(default_content_type) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(default));
        }
    }

    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::validation(format!("bad header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::validation(format!("bad header value: {e}")))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

fn default_content_type(body: &Body) -> Option<&'static str> {
    match body {
        Body::Json(_) | Body::Graphql { .. } => Some("application/json"),
        Body::Form(_) => Some("application/x-www-form-urlencoded"),
        Body::Xml(_) => Some("application/xml"),
        Body::Text(_) => Some("text/plain"),
        Body::Base64(_) | Body::Binary(_) => Some("application/octet-stream"),
        // reqwest stamps the multipart boundary itself.
        Body::Files(_) => None,
    }
}

/// Resolve an upload path against the scenario directory and keep it
/// inside the root.
fn resolve_upload_path(path: &str, env: &RequestEnv<'_>) -> Result<PathBuf> {
    let raw = Path::new(path);
    let joined = match env.scenario_dir {
        Some(dir) if raw.is_relative() => dir.join(raw),
        _ => raw.to_path_buf(),
    };
    let canonical = joined
        .canonicalize()
        .map_err(|e| Error::path(format!("cannot resolve '{}': {e}", joined.display())))?;

    if let Some(root) = env.root {
        let root = root
            .canonicalize()
            .map_err(|e| Error::path(format!("bad root '{}': {e}", root.display())))?;
        if !canonical.starts_with(&root) {
            return Err(Error::path(format!(
                "'{}' escapes the scenario root '{}'",
                canonical.display(),
                root.display()
            )));
        }
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    fn base_request(url: &str) -> Request {
        serde_json::from_value(json!({"url": url})).unwrap()
    }

    #[tokio::test]
    async fn absolute_url_ignores_base() {
        let client = Client::new();
        let request = base_request("http://other.example/x");
        let env = RequestEnv {
            base_url: Some("http://base.example"),
            ..Default::default()
        };
        let built = build_request(&client, &request, &env, None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.url().as_str(), "http://other.example/x");
    }

    #[tokio::test]
    async fn relative_url_joins_base() {
        let client = Client::new();
        let request = base_request("/api/ping");
        let env = RequestEnv {
            base_url: Some("http://base.example/"),
            ..Default::default()
        };
        let built = build_request(&client, &request, &env, None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.url().as_str(), "http://base.example/api/ping");
    }

    #[tokio::test]
    async fn scalar_and_list_params_expand() {
        let client = Client::new();
        let mut request = base_request("http://h/x");
        request.params = serde_json::from_value(json!({
            "page": 2,
            "tag": ["a", "b"]
        }))
        .unwrap();

        let built = build_request(&client, &request, &RequestEnv::default(), None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.url().query(), Some("page=2&tag=a&tag=b"));
    }

    #[tokio::test]
    async fn json_body_sets_default_content_type() {
        let client = Client::new();
        let mut request = base_request("http://h/x");
        request.method = HttpMethod::Post;
        request.body = Some(Body::Json(json!({"a": 1})));

        let built = build_request(&client, &request, &RequestEnv::default(), None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            built.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(built.body().unwrap().as_bytes().unwrap(), br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn explicit_content_type_wins() {
        let client = Client::new();
        let mut request = base_request("http://h/x");
        request.method = HttpMethod::Post;
        request.body = Some(Body::Json(json!({})));
        let mut headers = IndexMap::new();
        headers.insert("Content-Type".to_string(), "application/vnd.custom".to_string());
        request.headers = headers;

        let built = build_request(&client, &request, &RequestEnv::default(), None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            built.headers().get(CONTENT_TYPE).unwrap(),
            "application/vnd.custom"
        );
    }

    #[tokio::test]
    async fn form_body_urlencodes() {
        let client = Client::new();
        let mut request = base_request("http://h/x");
        request.method = HttpMethod::Post;
        let mut pairs = IndexMap::new();
        pairs.insert("user".to_string(), "a b".to_string());
        pairs.insert("role".to_string(), "admin".to_string());
        request.body = Some(Body::Form(pairs));

        let built = build_request(&client, &request, &RequestEnv::default(), None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            built.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(
            built.body().unwrap().as_bytes().unwrap(),
            b"user=a+b&role=admin"
        );
    }

    #[tokio::test]
    async fn base64_body_decodes() {
        let client = Client::new();
        let mut request = base_request("http://h/x");
        request.method = HttpMethod::Post;
        request.body = Some(Body::Base64("aGVsbG8=".to_string()));

        let built = build_request(&client, &request, &RequestEnv::default(), None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.body().unwrap().as_bytes().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn invalid_base64_rejected() {
        let client = Client::new();
        let mut request = base_request("http://h/x");
        request.body = Some(Body::Base64("!!! not base64 !!!".to_string()));
        let err = build_request(&client, &request, &RequestEnv::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn graphql_body_wraps_envelope() {
        let client = Client::new();
        let mut request = base_request("http://h/graphql");
        request.method = HttpMethod::Post;
        request.body = Some(Body::Graphql {
            query: "query { me { id } }".to_string(),
            variables: Some(json!({"limit": 3})),
        });

        let built = build_request(&client, &request, &RequestEnv::default(), None)
            .await
            .unwrap()
            .build()
            .unwrap();
        let body: Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["query"], "query { me { id } }");
        assert_eq!(body["variables"]["limit"], 3);
    }

    #[tokio::test]
    async fn binary_body_reads_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.bin"), b"\x00\x01\x02").unwrap();

        let client = Client::new();
        let mut request = base_request("http://h/upload");
        request.method = HttpMethod::Post;
        request.body = Some(Body::Binary("payload.bin".to_string()));
        let env = RequestEnv {
            base_url: None,
            scenario_dir: Some(dir.path()),
            root: Some(dir.path()),
        };

        let built = build_request(&client, &request, &env, None)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.body().unwrap().as_bytes().unwrap(), b"\x00\x01\x02");
    }

    #[tokio::test]
    async fn upload_path_escape_fails() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(outer.path().join("secret.bin"), b"x").unwrap();

        let client = Client::new();
        let mut request = base_request("http://h/upload");
        request.body = Some(Body::Binary("../secret.bin".to_string()));
        let env = RequestEnv {
            base_url: None,
            scenario_dir: Some(&root),
            root: Some(&root),
        };

        let err = build_request(&client, &request, &env, None).await.unwrap_err();
        assert!(matches!(err, Error::Path { .. }));
    }

    #[tokio::test]
    async fn authenticators_apply() {
        let client = Client::new();
        let request = base_request("http://h/x");

        let bearer = Authenticator::Bearer { token: "T".into() };
        let built = build_request(&client, &request, &RequestEnv::default(), Some(&bearer))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.headers().get("authorization").unwrap(), "Bearer T");

        let header = Authenticator::Header {
            name: "X-Api-Key".into(),
            value: "k".into(),
        };
        let built = build_request(&client, &request, &RequestEnv::default(), Some(&header))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.headers().get("x-api-key").unwrap(), "k");
    }
}
