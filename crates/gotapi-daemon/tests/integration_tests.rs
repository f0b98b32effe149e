//! End-to-end tests through the axum router and a live WebSocket server.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode, header};
use futures_util::{SinkExt, StreamExt};
use gotapi_core::config::Config;
use gotapi_core::{Command, GatewayCore, Method, ids};
use gotapi_daemon::{AppState, plugins, router, serve};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{self, Message};
use tower::ServiceExt;

const ECHO: &str = "com.github.futomi.hello-world.echo";
const LIGHT: &str = "com.github.futomi.lightemulator.light";
const CLOCK: &str = "com.github.futomi.hello-clock.clock";

fn state(config: &Config) -> AppState {
    let core = GatewayCore::start(config, plugins::catalog(&config.plugins).load());
    AppState::new(config, core)
}

fn app_from(state: AppState, peer: [u8; 4]) -> Router {
    router(state).layer(MockConnectInfo(SocketAddr::from((peer, 50000))))
}

fn app() -> Router {
    app_from(state(&Config::default()), [127, 0, 0, 1])
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    call(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

/// Availability, grant and accesstoken over HTTP; returns the token.
async fn authorize_http(app: &Router, key: &str, scope: &str) -> String {
    let (status, body) = get(app, &format!("/gotapi/availability?key={key}")).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (_, body) = get(app, &format!("/gotapi/authorization/grant?key={key}&nonce=n1")).await;
    assert_eq!(body["hmac"], ids::sign(key, "n1").unwrap());
    let client_id = body["clientId"].as_str().unwrap().to_string();

    let (status, body) = get(
        app,
        &format!("/gotapi/authorization/accesstoken?clientId={client_id}&scope={scope}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body.get("clientId").is_none());
    body["accessToken"].as_str().unwrap().to_string()
}

/// Same chain straight through the core, for WebSocket tests.
async fn authorize_core(core: &GatewayCore) -> String {
    core.handle(Command::new(Method::Get, "availability", "").with_param("key", "ws-app"))
        .await;
    let grant = core
        .handle(Command::new(Method::Get, "authorization", "grant").with_param("key", "ws-app"))
        .await;
    let reply = core
        .handle(
            Command::new(Method::Get, "authorization", "accesstoken")
                .with_param("clientId", grant.client_id.unwrap())
                .with_param("scope", "clock"),
        )
        .await;
    reply.access_token.unwrap()
}

#[tokio::test]
async fn test_http_authorization_and_echo() {
    let app = app();
    let token = authorize_http(&app, "secret", "echo,light,clock").await;

    let (status, body) = get(
        &app,
        &format!("/gotapi/echo?serviceId={ECHO}&accessToken={token}&msg=hello%20world&nonce=n2"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"], 0);
    assert_eq!(body["data"], "hello world");
    assert_eq!(body["hmac"], ids::sign("secret", "n2").unwrap());
    assert_eq!(body["product"], "GotAPI Server");
    assert!(body.get("profile").is_none());
    assert!(body.get("attribute").is_none());
}

#[tokio::test]
async fn test_http_service_discovery_lists_builtins() {
    let app = app();
    let token = authorize_http(&app, "k", "servicediscovery").await;

    let (status, body) = get(&app, &format!("/gotapi/servicediscovery?accessToken={token}")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<_> = body["services"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["serviceId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec![ECHO, LIGHT, CLOCK]);
}

#[tokio::test]
async fn test_http_json_body_reaches_plugin() {
    let app = app();
    let token = authorize_http(&app, "k", "light").await;

    let request = Request::post("/gotapi/light")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "serviceId": LIGHT, "accessToken": token, "lightId": "1" }).to_string(),
        ))
        .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let request = Request::post("/gotapi/light")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "serviceId": LIGHT, "accessToken": token, "lightId": "7" }).to_string(),
        ))
        .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorText"], "ERROR");
    assert_eq!(body["errorMessage"], "The specified lightId is unknown.");
}

#[tokio::test]
async fn test_http_missing_and_forged_tokens() {
    let app = app();

    let (status, body) = get(&app, &format!("/gotapi/echo?serviceId={ECHO}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorText"], "INVALID_PARAMETER");

    let (status, body) = get(&app, &format!("/gotapi/echo?serviceId={ECHO}&accessToken=x")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errorText"], "INVALID_TOKEN");
}

#[tokio::test]
async fn test_http_unknown_path_is_404() {
    let (status, body) = get(&app(), "/index.html").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["result"], 404);
    assert_eq!(body["errorMessage"], "The URL of the request is invalid.");
}

#[tokio::test]
async fn test_http_preflight() {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/gotapi/echo")
        .header(header::ORIGIN, "http://localhost:4035")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
        "POST, GET, OPTIONS, PUT, DELETE"
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:4035"
    );
}

#[tokio::test]
async fn test_http_unsupported_method() {
    let request = Request::builder()
        .method("PATCH")
        .uri("/gotapi/echo")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app(), request).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["errorText"], "INVALID_METHOD");
}

#[tokio::test]
async fn test_http_access_restrictions() {
    let request = Request::get("/gotapi/availability?key=k")
        .header(header::ORIGIN, "https://evil.example.com")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app(), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errorText"], "NOT_AUTHORIZED");

    let remote = app_from(state(&Config::default()), [192, 168, 1, 20]);
    let (status, _) = get(&remote, "/gotapi/availability?key=k").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let config = Config {
        allowed_address_list: vec!["192.168.1.0/24".to_string()],
        ..Config::default()
    };
    let allowed = app_from(state(&config), [192, 168, 1, 20]);
    let (status, _) = get(&allowed, "/gotapi/availability?key=k").await;
    assert_eq!(status, StatusCode::OK);
}

async fn spawn_server(config: &Config) -> (SocketAddr, AppState) {
    let state = state(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = state.clone();
    tokio::spawn(async move {
        serve(listener, served, std::future::pending()).await.unwrap();
    });
    (addr, state)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr) -> Result<WsStream, tungstenite::Error> {
    tokio_tungstenite::connect_async(format!("ws://{addr}/gotapi/websocket"))
        .await
        .map(|(stream, _)| stream)
}

async fn next_json(ws: &mut WsStream) -> Option<Value> {
    let next = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.ok()??;
    match next.ok()? {
        Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_ws_verify_and_clock_events() {
    let (addr, state) = spawn_server(&Config::default()).await;
    let token = authorize_core(&state.core).await;
    let mut ws = connect(addr).await.unwrap();

    send_json(&mut ws, json!({ "accessToken": token })).await;
    let verified = next_json(&mut ws).await.unwrap();
    assert_eq!(verified["result"], 0);
    assert_eq!(verified["profile"], "authorization");
    assert_eq!(verified["attribute"], "verify");

    send_json(
        &mut ws,
        json!({
            "method": "put",
            "profile": "clock",
            "attribute": "ticktack",
            "serviceId": CLOCK,
            "accessToken": token,
        }),
    )
    .await;
    let reply = next_json(&mut ws).await.unwrap();
    assert_eq!(reply["result"], 0, "{reply}");
    assert_eq!(reply["profile"], "clock");

    let event = next_json(&mut ws).await.unwrap();
    assert_eq!(event["result"], 0);
    assert_eq!(event["attribute"], "ticktack");
    assert_eq!(event["serviceId"], CLOCK);
    assert!(event["data"].is_string());

    send_json(
        &mut ws,
        json!({
            "method": "delete",
            "profile": "clock",
            "attribute": "ticktack",
            "serviceId": CLOCK,
            "accessToken": token,
        }),
    )
    .await;
    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_ws_bad_frames() {
    let (addr, state) = spawn_server(&Config::default()).await;
    let token = authorize_core(&state.core).await;
    let mut ws = connect(addr).await.unwrap();
    send_json(&mut ws, json!({ "accessToken": token })).await;
    next_json(&mut ws).await.unwrap();

    ws.send(Message::text("not json")).await.unwrap();
    let reply = next_json(&mut ws).await.unwrap();
    assert_eq!(reply["errorText"], "INVALID_PARAMETER");

    send_json(&mut ws, json!({ "method": "patch", "profile": "clock" })).await;
    let reply = next_json(&mut ws).await.unwrap();
    assert_eq!(reply["errorText"], "INVALID_METHOD");
}

#[tokio::test]
async fn test_ws_rejects_unknown_token() {
    let (addr, _state) = spawn_server(&Config::default()).await;
    let mut ws = connect(addr).await.unwrap();

    send_json(&mut ws, json!({ "accessToken": "forged" })).await;
    let reply = next_json(&mut ws).await.unwrap();
    assert_eq!(reply["errorText"], "INVALID_TOKEN");
    assert_eq!(reply["attribute"], "verify");
    assert!(next_json(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_ws_connection_limit() {
    let (addr, state) = spawn_server(&Config::default()).await;
    let token = authorize_core(&state.core).await;

    let mut first = connect(addr).await.unwrap();
    send_json(&mut first, json!({ "accessToken": token })).await;
    next_json(&mut first).await.unwrap();
    assert_eq!(state.ws_connections(), 1);

    match connect(addr).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE.as_u16());
        }
        other => panic!("second connection should be refused: {other:?}"),
    }
}

#[tokio::test]
async fn test_ws_token_timeout() {
    let config = Config {
        ws_access_token_timeout: 1,
        ..Config::default()
    };
    let (addr, state) = spawn_server(&config).await;
    let mut ws = connect(addr).await.unwrap();

    let reply = next_json(&mut ws).await.unwrap();
    assert_eq!(reply["errorText"], "TIMEOUT");
    assert!(next_json(&mut ws).await.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.ws_connections(), 0);
}
