//! HTTP front end: `/gotapi/<profile>[/<attribute>]`.

use std::net::SocketAddr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN,
};
use axum::http::{HeaderMap, HeaderValue, Method as HttpMethod, StatusCode};
use axum::response::{IntoResponse, Response};
use gotapi_core::GatewayError;
use gotapi_types::{Command, ErrorKind, Method, Reply, attribute, profile};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::server::AppState;

pub(crate) const ACCESS_DENIED: &str =
    "The access has not been allowed by the access restriction.";
const INVALID_URL: &str = "The URL of the request is invalid.";
const ALLOWED_METHODS: &str = "POST, GET, OPTIONS, PUT, DELETE";

pub(crate) async fn profile_only(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: HttpMethod,
    Path(profile): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = Request {
        method,
        profile,
        attribute: String::new(),
        query,
        headers,
        body,
    };
    handle(&state, addr, request).await
}

pub(crate) async fn with_attribute(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: HttpMethod,
    Path((profile, attribute)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = Request {
        method,
        profile,
        attribute,
        query,
        headers,
        body,
    };
    handle(&state, addr, request).await
}

/// Fallback for every path outside `/gotapi/...`.
#[allow(clippy::unused_async)] // axum handler
pub(crate) async fn not_found(headers: HeaderMap) -> Response {
    let error = GatewayError::with_status(ErrorKind::Error, 404, INVALID_URL);
    respond(error.into(), origin_of(&headers))
}

struct Request {
    method: HttpMethod,
    profile: String,
    attribute: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

async fn handle(state: &AppState, addr: SocketAddr, request: Request) -> Response {
    let origin = origin_of(&request.headers);
    if !state.access.allows_address(addr.ip()) || !state.access.allows_origin(origin.as_deref()) {
        debug!("Rejected {addr} (origin {origin:?}): access restriction");
        return respond(GatewayError::not_authorized(ACCESS_DENIED).into(), origin);
    }

    if request.method == HttpMethod::OPTIONS {
        return preflight(origin);
    }

    let method = match request.method.as_str().parse::<Method>() {
        Ok(method) => method,
        Err(_) => {
            let error = GatewayError::new(
                ErrorKind::InvalidMethod,
                format!(
                    "The HTTP method `{}` is not allowed.",
                    request.method.as_str().to_ascii_lowercase()
                ),
            );
            return respond(error.into(), origin);
        }
    };

    let params = match collect_params(request.query.as_deref(), &request.headers, &request.body) {
        Ok(params) => params,
        Err(error) => return respond(error.into(), origin),
    };

    trace!(
        "HTTP {} /gotapi/{}/{} from {addr}",
        method, request.profile, request.attribute
    );
    let command = Command {
        method,
        profile: request.profile,
        attribute: request.attribute,
        params,
        package: origin.clone(),
    };
    let is_grant = command.profile == profile::AUTHORIZATION && command.attribute == attribute::GRANT;

    let mut reply = state.core.handle(command).await;
    reply.profile = None;
    reply.attribute = None;
    if !is_grant {
        reply.client_id = None;
    }
    respond(reply, origin)
}

/// Query parameters merged with a JSON or form body.
fn collect_params(
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Map<String, Value>, GatewayError> {
    let mut params: Map<String, Value> = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(params);
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => params.extend(fields),
            _ => {
                return Err(GatewayError::invalid_parameter(
                    "The request body is not a JSON object.",
                ));
            }
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        params.extend(
            url::form_urlencoded::parse(body)
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned()))),
        );
    } else {
        return Err(GatewayError::new(
            ErrorKind::InvalidMethod,
            format!("The content type `{content_type}` is not supported."),
        ));
    }
    Ok(params)
}

fn origin_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn preflight(origin: Option<String>) -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    allow_origin(headers, origin);
    response
}

/// Serialize `reply` with its status and the CORS origin echo.
pub(crate) fn respond(reply: Reply, origin: Option<String>) -> Response {
    let status = StatusCode::from_u16(reply.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(reply)).into_response();
    allow_origin(response.headers_mut(), origin);
    response
}

fn allow_origin(headers: &mut HeaderMap, origin: Option<String>) {
    if let Some(value) = origin.and_then(|o| HeaderValue::from_str(&o).ok()) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    #[test]
    fn test_query_params_are_decoded() {
        let params = collect_params(Some("msg=hello%20world&serviceId=s1"), &HeaderMap::new(), b"")
            .unwrap();
        assert_eq!(params["msg"], "hello world");
        assert_eq!(params["serviceId"], "s1");
    }

    #[test]
    fn test_json_body_merges_over_query() {
        let params = collect_params(
            Some("lightId=1&color=red"),
            &json_headers("application/json; charset=utf-8"),
            br#"{"color": "blue", "brightness": 0.5}"#,
        )
        .unwrap();
        assert_eq!(params["lightId"], "1");
        assert_eq!(params["color"], "blue");
        assert_eq!(params["brightness"], 0.5);
    }

    #[test]
    fn test_form_body() {
        let params = collect_params(
            None,
            &json_headers("application/x-www-form-urlencoded"),
            b"name=desk+lamp",
        )
        .unwrap();
        assert_eq!(params["name"], "desk lamp");
    }

    #[test]
    fn test_unsupported_body_type() {
        let err = collect_params(None, &json_headers("text/plain"), b"hi").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMethod);
        assert_eq!(err.status, 405);
    }

    #[test]
    fn test_json_body_must_be_object() {
        let err = collect_params(None, &json_headers("application/json"), b"[1, 2]").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_empty_body_ignores_content_type() {
        assert!(collect_params(None, &json_headers("text/plain"), b"  ").is_ok());
    }

    #[test]
    fn test_respond_sets_status_and_origin() {
        let reply = Reply::error(ErrorKind::Timeout, 408, "late");
        let response = respond(reply, Some("http://localhost:4035".to_string()));
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:4035"
        );
    }
}
