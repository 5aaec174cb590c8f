use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use discord_wire::config::{ClientConfig, GatewayOptions};
use discord_wire::gateway::proto::{EventName, PresenceUpdate, Status};
use discord_wire::gateway::GatewayClient;
use discord_wire::rest::{ApiRequest, RequestExecutor, RestError, Route, RouteSignature};
use futures_util::StreamExt;
use reqwest::Method;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

const TEST_TOKEN: &str = "test-token";
const TEST_INTENTS: u64 = 33_281;
const TEST_CHANNEL: &str = "381870553235193857";

#[derive(Debug)]
struct WsObserved {
    url_query: Option<String>,
    identify: Value,
    presence: Value,
    close_code: Option<u16>,
}

#[derive(Clone)]
struct WsState {
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Result<WsObserved, String>>>>>,
}

#[derive(Clone, Default)]
struct HttpState {
    create_calls: Arc<AtomicUsize>,
    observed_reason: Arc<Mutex<Option<String>>>,
    observed_user_agent: Arc<Mutex<Option<String>>>,
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(SecretString::new(TEST_TOKEN.to_string()), TEST_INTENTS)
        .with_gateway_options(GatewayOptions {
            initial_heartbeat_jitter: Duration::ZERO,
            ..GatewayOptions::default()
        })
        .with_gateway_url(format!("ws://{addr}/gateway"))
        .with_api_base_url(format!("http://{addr}/api"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gateway_client_ws_smoke_identify_dispatch_presence_disconnect() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let ws_state = WsState {
        observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
    };
    let app = Router::new()
        .route("/gateway", get(ws_handler))
        .with_state(ws_state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = GatewayClient::new(config_for(addr));
    let mut connection = timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("timed out connecting to mock gateway")
        .expect("connect gateway client to mock ws server");

    let ready = timeout(Duration::from_secs(2), connection.recv())
        .await
        .expect("timed out waiting for ready")
        .expect("ready event");
    assert_eq!(ready.name(), &EventName::Ready);

    let message = timeout(Duration::from_secs(2), connection.recv())
        .await
        .expect("timed out waiting for message")
        .expect("message event");
    assert_eq!(message.name(), &EventName::MessageCreate);
    assert_eq!(message.sequence(), Some(2));
    let content: Value = message.decode().expect("message payload");
    assert_eq!(content["content"], "hello from the mock gateway");

    connection
        .sender()
        .update_presence(&PresenceUpdate::status(Status::Dnd))
        .expect("queue presence update");
    let echoed = timeout(Duration::from_secs(2), connection.recv())
        .await
        .expect("timed out waiting for presence echo")
        .expect("presence echo");
    assert_eq!(echoed.name(), &EventName::PresenceUpdate);

    connection.disconnect().await.expect("clean disconnect");

    let observed = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for ws server observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    let query = observed.url_query.unwrap_or_default();
    assert!(query.contains("v=10"), "query was {query}");
    assert!(query.contains("encoding=json"), "query was {query}");
    assert_eq!(observed.identify["token"], TEST_TOKEN);
    assert_eq!(observed.identify["intents"], TEST_INTENTS);
    assert_eq!(observed.presence["status"], "dnd");
    assert_eq!(observed.close_code, Some(1000));

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn executor_smoke_records_buckets_and_retries_throttled_calls() {
    let http_state = HttpState::default();
    let app = Router::new()
        .route(
            "/api/v10/channels/{channel_id}/messages",
            get(list_messages_handler).post(create_message_handler),
        )
        .route(
            "/api/v10/channels/{channel_id}",
            get(forbidden_channel_handler).delete(delete_channel_handler),
        )
        .with_state(http_state.clone());
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let executor = RequestExecutor::new(&config_for(addr)).expect("build request executor");
    let messages = Route::get("/channels/{channel_id}/messages").param("channel_id", TEST_CHANNEL);

    let listed: Vec<Value> = executor
        .execute_decode(ApiRequest::new(messages.clone()).query("limit", 2))
        .await
        .expect("list messages");
    assert_eq!(listed.len(), 2);
    let bucket = executor
        .limiter()
        .lookup(&messages.signature())
        .expect("bucket recorded from headers");
    assert_eq!(bucket.key, "abcd1234");
    assert_eq!(bucket.limit, 5);
    assert_eq!(bucket.remaining, 4);
    let user_agent = http_state.observed_user_agent.lock().await.clone();
    assert!(
        user_agent.is_some_and(|agent| agent.starts_with("DiscordBot (")),
        "user agent must follow the bot format"
    );

    let created = executor
        .execute(
            ApiRequest::new(
                Route::post("/channels/{channel_id}/messages").param("channel_id", TEST_CHANNEL),
            )
            .json(json!({"content": "hi"})),
        )
        .await
        .expect("create message after one throttle");
    assert_eq!(created.status, StatusCode::OK);
    assert_eq!(http_state.create_calls.load(Ordering::SeqCst), 2);

    let deleted = executor
        .execute(
            ApiRequest::new(Route::delete("/channels/{channel_id}").param("channel_id", TEST_CHANNEL))
                .reason("cleanup by bot"),
        )
        .await
        .expect("delete channel");
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    assert_eq!(
        http_state.observed_reason.lock().await.as_deref(),
        Some("cleanup%20by%20bot")
    );

    let forbidden = executor
        .execute(ApiRequest::new(
            Route::get("/channels/{channel_id}").param("channel_id", TEST_CHANNEL),
        ))
        .await;
    match forbidden {
        Err(RestError::ClientRequestError { status, body }) => {
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(body, "Missing Access (code 50001)");
        }
        other => panic!("expected client request error, got {other:?}"),
    }
    assert!(executor
        .limiter()
        .lookup(&RouteSignature::new(Method::GET, "/channels/{channel_id}"))
        .is_none());

    let _ = shutdown_tx.send(());
    server_task
        .await
        .expect("mock http server task should join");
}

async fn ws_handler(
    State(state): State<WsState>,
    axum::extract::RawQuery(query): axum::extract::RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let observed_tx = state.observed_tx.clone();
    ws.on_upgrade(move |socket| async move {
        let result = run_gateway_protocol(socket, query).await;
        if let Some(tx) = observed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    })
}

async fn run_gateway_protocol(
    mut socket: WebSocket,
    url_query: Option<String>,
) -> Result<WsObserved, String> {
    send_frame(&mut socket, json!({"op": 10, "d": {"heartbeat_interval": 45_000}})).await?;

    let heartbeat = recv_frame(&mut socket).await?;
    if heartbeat != json!({"op": 1, "d": null}) {
        return Err(format!("expected initial heartbeat, got {heartbeat}"));
    }
    send_frame(&mut socket, json!({"op": 11})).await?;

    let identify = recv_frame(&mut socket).await?;
    if identify["op"] != 2 {
        return Err(format!("expected identify, got {identify}"));
    }

    send_frame(
        &mut socket,
        json!({
            "op": 0,
            "s": 1,
            "t": "READY",
            "d": {
                "v": 10,
                "session_id": "mock-session",
                "resume_gateway_url": "ws://127.0.0.1:9/unused",
                "user": {"id": "1", "username": "bot"}
            }
        }),
    )
    .await?;
    send_frame(
        &mut socket,
        json!({
            "op": 0,
            "s": 2,
            "t": "MESSAGE_CREATE",
            "d": {"id": "2", "channel_id": TEST_CHANNEL, "content": "hello from the mock gateway"}
        }),
    )
    .await?;

    let presence = recv_frame(&mut socket).await?;
    if presence["op"] != 3 {
        return Err(format!("expected presence update, got {presence}"));
    }
    send_frame(
        &mut socket,
        json!({"op": 0, "s": 3, "t": "PRESENCE_UPDATE", "d": presence["d"].clone()}),
    )
    .await?;

    let close_code = recv_close(&mut socket).await?;
    Ok(WsObserved {
        url_query,
        identify: identify["d"].clone(),
        presence: presence["d"].clone(),
        close_code,
    })
}

async fn recv_frame(socket: &mut WebSocket) -> Result<Value, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client frame".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected binary websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn recv_close(socket: &mut WebSocket) -> Result<Option<u16>, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Close(frame))) => {
                return Ok(frame.map(|frame: CloseFrame| frame.code));
            }
            Some(Ok(Message::Text(text))) => {
                let frame: Value = serde_json::from_str(text.as_str())
                    .map_err(|err| format!("failed to decode client frame: {err}"))?;
                if frame["op"] != 1 {
                    return Err(format!("unexpected frame while waiting for close: {frame}"));
                }
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Ok(None),
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Value) -> Result<(), String> {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

fn bot_authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bot {TEST_TOKEN}"))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "401: Unauthorized", "code": 0})),
    )
        .into_response()
}

async fn list_messages_handler(
    State(state): State<HttpState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !bot_authorized(&headers) {
        return unauthorized();
    }
    *state.observed_user_agent.lock().await = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    (
        StatusCode::OK,
        [
            ("x-ratelimit-bucket", "abcd1234"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset-after", "1.5"),
        ],
        Json(json!([
            {"id": "1", "channel_id": channel_id, "content": "first"},
            {"id": "2", "channel_id": channel_id, "content": "second"}
        ])),
    )
        .into_response()
}

async fn create_message_handler(
    State(state): State<HttpState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if !bot_authorized(&headers) {
        return unauthorized();
    }

    let call = state.create_calls.fetch_add(1, Ordering::SeqCst);
    if call == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("x-ratelimit-scope", "user")],
            Json(json!({
                "message": "You are being rate limited.",
                "retry_after": 0.05,
                "global": false
            })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({"id": "3", "channel_id": channel_id, "content": payload["content"]})),
    )
        .into_response()
}

async fn delete_channel_handler(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    if !bot_authorized(&headers) {
        return unauthorized();
    }
    *state.observed_reason.lock().await = headers
        .get("x-audit-log-reason")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    StatusCode::NO_CONTENT.into_response()
}

async fn forbidden_channel_handler(headers: HeaderMap) -> Response {
    if !bot_authorized(&headers) {
        return unauthorized();
    }
    (
        StatusCode::FORBIDDEN,
        Json(json!({"message": "Missing Access", "code": 50001})),
    )
        .into_response()
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
