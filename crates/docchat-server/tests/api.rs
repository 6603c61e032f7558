use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use docchat_server::config::{ModelConfig, Settings};
use docchat_server::services::{CompletionRequest, CompletionService, ServiceError};
use docchat_server::store::ConversationStore;
use docchat_server::{build_router, AppState};

/// Answers with the prompt and the names of the attachments it saw
struct EchoCompletion {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionService for EchoCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let names: Vec<&str> = request.attachments.iter().map(|a| a.file.name.as_str()).collect();
        Ok(format!("echo: {} [{}]", request.prompt, names.join(",")))
    }
}

struct DownCompletion;

#[async_trait]
impl CompletionService for DownCompletion {
    async fn complete(&self, _request: CompletionRequest) -> Result<String, ServiceError> {
        Err(ServiceError::Upstream("connection refused".to_string()))
    }
}

fn settings() -> Settings {
    let mut settings = Settings::defaults().unwrap();
    settings.llm.retry_backoff_ms = 1;
    settings.llm.max_retries = 0;
    settings
}

fn app_with(completion: Arc<dyn CompletionService>) -> (Router, Arc<ConversationStore>) {
    app_from(settings(), completion)
}

fn app_from(settings: Settings, completion: Arc<dyn CompletionService>) -> (Router, Arc<ConversationStore>) {
    let store = Arc::new(ConversationStore::in_memory());
    let state = AppState::new(settings, store.clone(), completion);
    (build_router(state), store)
}

fn app() -> (Router, Arc<ConversationStore>) {
    app_with(Arc::new(EchoCompletion {
        calls: AtomicUsize::new(0),
    }))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn create(app: &Router, owner: &str) -> String {
    let (status, body) = send(app, Method::POST, "/api/conversations", Some(json!({ "owner": owner }))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_formats() {
    let (app, _) = app();

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app, Method::GET, "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conversations"], 0);
    assert_eq!(body["cache"]["entries"], 0);

    let (_, body) = send(&app, Method::GET, "/api/formats", None).await;
    let kinds: Vec<&str> = body["formats"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["pdf", "docx", "csv", "image", "text"]);
}

#[tokio::test]
async fn chat_turn_with_csv_attachment_then_search_and_export() {
    let (app, _) = app();
    let id = create(&app, "alice").await;

    let csv = STANDARD.encode("region,revenue\nnorth,100\nsouth,250\n");
    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/conversations/{}/messages", id),
        Some(json!({
            "message": "Which region earned more revenue?",
            "attachments": [{ "file_name": "sales.csv", "file_type": "text/csv", "file_base64": csv }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "replied");
    assert_eq!(body["cached"], false);
    assert_eq!(
        body["assistant_message"]["text"],
        "echo: Which region earned more revenue? [sales.csv]"
    );
    assert_eq!(body["user_message"]["attachments"][0]["source_kind"], "csv");

    let (_, conversation) = send(&app, Method::GET, &format!("/api/conversations/{}", id), None).await;
    assert_eq!(conversation["messages"].as_array().unwrap().len(), 2);
    assert_eq!(conversation["title"], "Which region earned more revenue?");

    // Attachment text is searchable
    let (_, hits) = send(&app, Method::GET, "/api/search?q=south&owner=alice", None).await;
    assert_eq!(hits["total"], 1);
    assert_eq!(hits["hits"][0]["conversation_id"], id.as_str());

    let (_, hits) = send(&app, Method::GET, "/api/search?q=south&owner=bob", None).await;
    assert_eq!(hits["total"], 0);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/conversations/{}/export?format=csv", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
    assert!(response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .ends_with(".csv\""));
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("role,text,timestamp,attachments\n"));
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test]
async fn failed_model_call_falls_back_and_keeps_user_message() {
    let (app, store) = app_with(Arc::new(DownCompletion));
    let id = create(&app, "alice").await;

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/conversations/{}/messages", id),
        Some(json!({ "message": "hello?" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "fallback");
    assert!(body["message"].as_str().unwrap().len() > 0);

    let conversation = store.get(id.parse().unwrap()).unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].text, "hello?");
}

#[tokio::test]
async fn unsupported_attachment_is_415() {
    let (app, store) = app();
    let id = create(&app, "alice").await;

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/conversations/{}/messages", id),
        Some(json!({
            "message": "run this",
            "attachments": [{ "file_name": "tool.exe", "file_type": "application/x-msdownload", "file_base64": STANDARD.encode([0x4d, 0x5a, 0x90]) }]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"], "UnsupportedMediaType");
    assert!(store.get(id.parse().unwrap()).unwrap().messages.is_empty());
}

#[tokio::test]
async fn missing_conversation_is_404() {
    let (app, _) = app();
    let missing = uuid::Uuid::new_v4();

    let (status, body) = send(&app, Method::GET, &format!("/api/conversations/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/conversations/{}/messages", missing),
        Some(json!({ "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn export_import_round_trip() {
    let (app, _) = app();
    let id = create(&app, "alice").await;
    send(
        &app,
        Method::POST,
        &format!("/api/conversations/{}/messages", id),
        Some(json!({ "message": "remember the budget" })),
    )
    .await;

    let (status, exported) = send(&app, Method::GET, &format!("/api/conversations/{}/export", id), None).await;
    assert_eq!(status, StatusCode::OK);

    // Same id cannot be imported twice
    let (status, _) = send(&app, Method::POST, "/api/conversations/import", Some(exported.clone())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::DELETE, &format!("/api/conversations/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, hits) = send(&app, Method::GET, "/api/search?q=budget", None).await;
    assert_eq!(hits["total"], 0);

    let (status, body) = send(&app, Method::POST, "/api/conversations/import", Some(exported.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], id.as_str());

    let (_, restored) = send(&app, Method::GET, &format!("/api/conversations/{}", id), None).await;
    assert_eq!(restored, exported);
    let (_, hits) = send(&app, Method::GET, "/api/search?q=budget", None).await;
    assert_eq!(hits["total"], 2);

    let (status, _) = send(&app, Method::POST, "/api/conversations/import", Some(json!({ "nope": true }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_export_format_is_400() {
    let (app, _) = app();
    let id = create(&app, "alice").await;
    let (status, _) = send(&app, Method::GET, &format!("/api/conversations/{}/export?format=xml", id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn retention_sweep_spares_pinned() {
    let (app, store) = app();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(create(&app, "alice").await);
    }

    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/api/conversations/{}/pin", ids[0]),
        Some(json!({ "pinned": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pinned"], true);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/retention/sweep",
        Some(json!({ "max_age_days": 0, "max_count": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);
    assert_eq!(body["remaining"], 1);
    assert!(store.get(ids[0].parse().unwrap()).is_ok());

    // Without a body the configured limits apply and nothing is old enough
    let (status, body) = send(&app, Method::POST, "/api/retention/sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 0);
}

#[tokio::test]
async fn list_and_stats() {
    let (app, _) = app();
    create(&app, "alice").await;
    create(&app, "alice").await;
    create(&app, "bob").await;

    let (_, body) = send(&app, Method::GET, "/api/conversations?owner=alice", None).await;
    assert_eq!(body["total"], 2);

    let (status, _) = send(&app, Method::POST, "/api/conversations", Some(json!({ "owner": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, stats) = send(&app, Method::GET, "/api/stats", None).await;
    assert_eq!(stats["store"]["total_conversations"], 3);
    assert_eq!(stats["cache"]["entries"], 0);
}

#[tokio::test]
async fn multipart_batch_reports_each_file() {
    let (app, _) = app();
    let boundary = "docchat-boundary";
    let mut body = String::new();
    for (name, mime, content) in [
        ("notes.txt", "text/plain", "quarterly notes"),
        ("data.csv", "text/csv", "a,b\n1,2\n"),
        ("tool.exe", "application/x-msdownload", "MZ"),
    ] {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: {mime}\r\n\r\n{content}\r\n"
        ));
    }
    body.push_str(&format!("--{boundary}--\r\n"));

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/uploads")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["processed"], 2);
    assert_eq!(value["failed"], 1);
    assert_eq!(value["files"][0]["content"]["source_kind"], "text");
    assert_eq!(value["files"][0]["content"]["extracted_text"], "quarterly notes");
    assert_eq!(value["files"][1]["content"]["source_kind"], "csv");
    assert_eq!(value["files"][2]["status"], "error");
    assert_eq!(value["files"][2]["error"], "UnsupportedFormat");
}

#[tokio::test]
async fn model_registry_is_listed() {
    let mut settings = settings();
    settings.llm.default_model = "fast".to_string();
    settings.llm.models = vec![
        ModelConfig {
            name: "fast".to_string(),
            display_name: "Fast".to_string(),
            max_tokens: 1024,
            supports_vision: false,
        },
        ModelConfig {
            name: "vision".to_string(),
            display_name: "Vision Pro".to_string(),
            max_tokens: 8192,
            supports_vision: true,
        },
    ];
    let (app, _) = app_from(settings, Arc::new(DownCompletion));

    let (status, body) = send(&app, Method::GET, "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["default_model"], "fast");
    assert_eq!(body["restricted"], true);
    assert_eq!(body["models"].as_array().unwrap().len(), 2);
    assert_eq!(body["models"][1]["display_name"], "Vision Pro");
    assert_eq!(body["models"][1]["supports_vision"], true);

    let (status, body) = send(&app, Method::GET, "/api/models/vision", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_tokens"], 8192);

    let (status, body) = send(&app, Method::GET, "/api/models/huge", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");
}

#[tokio::test]
async fn clearing_the_cache_forces_a_fresh_answer() {
    let (app, _) = app();
    let first = create(&app, "alice").await;
    let second = create(&app, "bob").await;
    let third = create(&app, "carol").await;
    let ask = json!({ "message": "What is the boiling point of water?" });

    let (_, body) = send(&app, Method::POST, &format!("/api/conversations/{}/messages", first), Some(ask.clone())).await;
    assert_eq!(body["cached"], false);
    let (_, body) = send(&app, Method::POST, &format!("/api/conversations/{}/messages", second), Some(ask.clone())).await;
    assert_eq!(body["cached"], true);

    let (status, body) = send(&app, Method::DELETE, "/api/cache", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 1);
    assert_eq!(body["cache"]["entries"], 0);

    let (_, body) = send(&app, Method::POST, &format!("/api/conversations/{}/messages", third), Some(ask)).await;
    assert_eq!(body["status"], "replied");
    assert_eq!(body["cached"], false);
}
