//! OpenAI-compatible client against a local mock server.

use pals::error::ProviderErrorKind;
use pals::llm::provider::ApiKey;
use pals::llm::{OpenAiCompatibleClient, ProviderClient, ProviderDescriptor};
use pals::{MessagePayload, PromptMessage};

use axum::Json;
use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};

async fn completion(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer sekrit");
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "invalid api key"}})),
        )
            .into_response();
    }
    let last = body["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .and_then(|message| message["content"].as_str())
        .unwrap_or_default()
        .to_string();
    Json(json!({
        "choices": [{"message": {"content": format!("<think>hmm</think>reply to {last}")}}]
    }))
    .into_response()
}

async fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": {"message": "slow down"}})),
    )
        .into_response()
}

async fn thinking_only() -> Json<Value> {
    Json(json!({"choices": [{"message": {"content": "<think>only thoughts</think>"}}]}))
}

async fn mock_server() -> String {
    let app = Router::new()
        .route("/ok/chat/completions", post(completion))
        .route("/busy/chat/completions", post(rate_limited))
        .route("/quiet/chat/completions", post(thinking_only));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{address}")
}

fn provider(base: &str, path: &str) -> ProviderDescriptor {
    let mut provider = ProviderDescriptor::new(path, format!("{base}/{path}"), "test-model");
    provider.credential = Some(ApiKey::new("sekrit"));
    provider
}

fn payload() -> MessagePayload {
    MessagePayload::new(vec![PromptMessage::system("be brief"), PromptMessage::user("hi")])
}

#[tokio::test]
async fn completes_and_strips_reasoning() {
    let base = mock_server().await;
    let client = OpenAiCompatibleClient::new().unwrap();
    let text = client.complete(&provider(&base, "ok"), &payload()).await.unwrap();
    assert_eq!(text, "reply to hi");
}

#[tokio::test]
async fn missing_key_is_permanent() {
    let base = mock_server().await;
    let client = OpenAiCompatibleClient::new().unwrap();
    let mut provider = provider(&base, "ok");
    provider.credential = None;
    let error = client.complete(&provider, &payload()).await.unwrap_err();
    assert_eq!(error.kind, ProviderErrorKind::Permanent);
    assert_eq!(error.status, Some(401));
    assert!(error.message.contains("invalid api key"));
}

#[tokio::test]
async fn too_many_requests_is_a_rate_limit() {
    let base = mock_server().await;
    let client = OpenAiCompatibleClient::new().unwrap();
    let error = client.complete(&provider(&base, "busy"), &payload()).await.unwrap_err();
    assert_eq!(error.kind, ProviderErrorKind::RateLimit);
    assert_eq!(error.status, Some(429));
}

#[tokio::test]
async fn reasoning_only_reply_is_transient() {
    let base = mock_server().await;
    let client = OpenAiCompatibleClient::new().unwrap();
    let error = client.complete(&provider(&base, "quiet"), &payload()).await.unwrap_err();
    assert_eq!(error.kind, ProviderErrorKind::Transient);
}
