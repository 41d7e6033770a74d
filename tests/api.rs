//! HTTP API against a live listener.

use pals::api::{ApiState, router};
use pals::config::{RuntimeConfig, RuntimeSettings};
use pals::coordinator::GlobalConcurrencyCoordinator;
use pals::error::ProviderError;
use pals::llm::{ProviderChain, ProviderClient, ProviderDescriptor, ProviderSet};
use pals::orchestrator::{CoreDeps, InstanceProfile, Orchestrator, ReplySink};
use pals::{ContextKey, MessagePayload, OutboundReply};

use async_trait::async_trait;
use serde_json::Value;

use std::sync::Arc;

struct StaticClient;

#[async_trait]
impl ProviderClient for StaticClient {
    async fn complete(
        &self,
        _provider: &ProviderDescriptor,
        _payload: &MessagePayload,
    ) -> Result<String, ProviderError> {
        Ok("pong".into())
    }
}

struct NullSink;

#[async_trait]
impl ReplySink for NullSink {
    async fn send(&self, _key: &ContextKey, _reply: OutboundReply) -> pals::Result<()> {
        Ok(())
    }
}

async fn serve() -> String {
    let runtime = Arc::new(RuntimeConfig::new(
        RuntimeSettings::default(),
        ProviderSet::new(vec![ProviderDescriptor::new("local", "http://local", "m")]),
    ));
    let deps = CoreDeps {
        chain: Arc::new(ProviderChain::new(runtime.clone(), Arc::new(StaticClient))),
        coordinator: Arc::new(GlobalConcurrencyCoordinator::new(runtime.clone())),
        runtime: runtime.clone(),
    };
    let orchestrator = Orchestrator::new(
        InstanceProfile::new("firefly", "Firefly"),
        deps.clone(),
        Arc::new(NullSink),
    );
    let state = ApiState::new(runtime, deps.chain, deps.coordinator)
        .with_orchestrator(Arc::new(orchestrator));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(Arc::new(state))).await.unwrap();
    });
    format!("http://{address}/api")
}

#[tokio::test]
async fn health_and_status_report_the_core() {
    let base = serve().await;
    let client = reqwest::Client::new();

    let health: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");

    let status: Value = client.get(format!("{base}/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["concurrency"]["limit"], 4);
    assert_eq!(status["concurrency"]["in_flight"], 0);
    assert_eq!(status["providers"][0]["name"], "local");
    assert_eq!(status["instances"][0]["id"], "firefly");
}

#[tokio::test]
async fn clear_targets_known_instances_only() {
    let base = serve().await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("{base}/instances/nobody/channels/1/clear"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let cleared: Value = client
        .post(format!("{base}/instances/firefly/channels/1/clear"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["discarded"], 0);
    assert_eq!(cleared["channel_id"], 1);
}

#[tokio::test]
async fn reload_without_a_file_is_rejected() {
    let base = serve().await;
    let response = reqwest::Client::new()
        .post(format!("{base}/config/reload"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["reloaded"], false);
}
