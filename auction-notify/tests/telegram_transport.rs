//! Telegram transport against a local mock of the Bot API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use auction_notify::database::models::{ChannelType, NotificationChannelDbModel};
use auction_notify::database::repositories::{ChannelRepository, SqlxChannelRepository};
use auction_notify::database::{init_pool_with_size, run_migrations};
use auction_notify::notification::channels::{
    ChannelTransport, TelegramConfig, TelegramTransport, TransportError, TransportRegistry,
};
use auction_notify::notification::{
    ChannelError, NotificationMessage, Notifier, NotifierConfig, OpsPublisher, RetryPolicy,
};
use auction_notify::utils::http_client::build_client;

#[derive(Default)]
struct MockBotApi {
    requests: Mutex<Vec<(String, Value)>>,
    flaky_calls: AtomicU32,
}

async fn send_message(
    State(api): State<Arc<MockBotApi>>,
    Path(bot): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    api.requests.lock().await.push((bot, body.clone()));

    match body["chat_id"].as_str().unwrap_or_default() {
        "blocked" => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })),
        ),
        "flood" => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 3",
                "parameters": {"retry_after": 3}
            })),
        ),
        "flaky" if api.flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"ok": false, "error_code": 502, "description": "Bad Gateway"})),
        ),
        _ => (
            StatusCode::OK,
            Json(json!({"ok": true, "result": {"message_id": 1}})),
        ),
    }
}

async fn start_mock() -> (Arc<MockBotApi>, SocketAddr) {
    let api = Arc::new(MockBotApi::default());
    let app = Router::new()
        .route("/{bot}/sendMessage", post(send_message))
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (api, addr)
}

fn config(addr: SocketAddr) -> TelegramConfig {
    TelegramConfig {
        bot_token: "123:TEST".to_string(),
        api_base: format!("http://{addr}"),
        ..Default::default()
    }
}

fn message() -> NotificationMessage {
    NotificationMessage {
        title: "[Mapo] 새 경매 매물".to_string(),
        fields: vec![("주소".to_string(), "서울 <마포구>".to_string())],
        thumbnail: None,
    }
}

fn transport(addr: SocketAddr) -> TelegramTransport {
    TelegramTransport::new(config(addr), build_client(Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn send_message_posts_html() {
    let (api, addr) = start_mock().await;

    transport(addr).send("1001", &message()).await.unwrap();

    let requests = api.requests.lock().await;
    assert_eq!(requests.len(), 1);
    let (bot, body) = &requests[0];
    assert_eq!(bot, "bot123:TEST");
    assert_eq!(body["chat_id"], "1001");
    assert_eq!(body["parse_mode"], "HTML");
    let text = body["text"].as_str().unwrap();
    assert!(text.contains("&lt;마포구&gt;"));
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let (_api, addr) = start_mock().await;

    let err = transport(addr).send("flood", &message()).await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Retryable {
            message: err.to_string(),
            retry_after: Some(Duration::from_secs(3)),
        }
    );
}

#[tokio::test]
async fn blocked_bot_is_permanent() {
    let (_api, addr) = start_mock().await;

    let err = transport(addr).send("blocked", &message()).await.unwrap_err();
    assert!(matches!(err, TransportError::Permanent { .. }));
    assert!(err.to_string().contains("blocked"));
}

#[tokio::test]
async fn unreachable_api_is_retryable() {
    // Bind and drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = transport(addr).send("1001", &message()).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn notifier_retries_then_disables_on_block() {
    let (api, addr) = start_mock().await;

    let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let channels = Arc::new(SqlxChannelRepository::new(pool));

    let mut registry = TransportRegistry::new();
    registry.register(Arc::new(transport(addr)));
    let notifier = Notifier::new(
        registry,
        channels.clone(),
        NotifierConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 10,
                use_jitter: false,
            },
            ..Default::default()
        },
        OpsPublisher::default(),
    );

    let flaky = channels
        .upsert(&NotificationChannelDbModel::new("u1", ChannelType::Telegram, "flaky"))
        .await
        .unwrap();
    let receipt = notifier.send(&flaky, &message()).await.unwrap();
    assert_eq!(receipt.attempts, 2);

    let blocked = channels
        .upsert(&NotificationChannelDbModel::new("u2", ChannelType::Telegram, "blocked"))
        .await
        .unwrap();
    let err = notifier.send(&blocked, &message()).await.unwrap_err();
    assert!(matches!(err, ChannelError::Permanent { .. }));
    assert!(!channels.get(&blocked.id).await.unwrap().enabled);

    // 2 flaky attempts + 1 blocked attempt.
    assert_eq!(api.requests.lock().await.len(), 3);
}
