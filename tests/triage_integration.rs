//! End-to-end triage over real HTTP.
//!
//! One Axum server on a random port impersonates the Gmail API, its OAuth
//! token endpoint, an OpenAI-compatible inference API and the Telegram Bot
//! API. The real `GmailSource`, `OpenAiCompatProvider` and `TelegramNotifier`
//! talk to it; the store is a libSQL file in a temp directory.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use mail_triage::classifier::{Classifier, CompiledRules};
use mail_triage::error::{MailError, NotifyError};
use mail_triage::llm::{LlmProvider, OpenAiCompatProvider, ProviderSelector, SelectionMode};
use mail_triage::mail::{GmailConfig, GmailSource, MailSource};
use mail_triage::notify::{Notifier, TelegramConfig, TelegramNotifier};
use mail_triage::pipeline::TriageRunner;
use mail_triage::pipeline::types::Priority;
use mail_triage::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const BOT_TOKEN: &str = "123-abc";

/// Shared state behind every fake endpoint.
#[derive(Default)]
struct Fakes {
    unread: Mutex<BTreeSet<String>>,
    modified: Mutex<Vec<String>>,
    completions: Mutex<Vec<String>>,
    telegram: Mutex<Vec<Value>>,
    token_refreshes: Mutex<usize>,
}

fn raw_message(id: &str) -> String {
    let (subject, body) = match id {
        "m1" => ("Pago vencido de tarjeta", "Tu pago de $2,500.00 está vencido."),
        "m2" => ("Transferencia SPEI recibida", "Recibiste una transferencia de $300.00."),
        _ => ("Promoción", "Descuento en restaurantes."),
    };
    let eml = format!(
        "From: Banco Azul <alertas@bancoazul.mx>\r\nSubject: {subject}\r\n\
         Date: Tue, 14 May 2024 10:30:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
    );
    base64::engine::general_purpose::URL_SAFE.encode(eml.as_bytes())
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer fresh-token")
}

async fn token(State(fakes): State<Arc<Fakes>>, body: String) -> Response {
    assert!(body.contains("grant_type=refresh_token"));
    *fakes.token_refreshes.lock().unwrap() += 1;
    axum::Json(json!({"access_token": "fresh-token", "expires_in": 3600})).into_response()
}

async fn list_messages(State(fakes): State<Arc<Fakes>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let unread = fakes.unread.lock().unwrap();
    let messages: Vec<Value> = unread.iter().map(|id| json!({"id": id, "threadId": id})).collect();
    if messages.is_empty() {
        return axum::Json(json!({"resultSizeEstimate": 0})).into_response();
    }
    axum::Json(json!({"messages": messages})).into_response()
}

async fn get_message(headers: HeaderMap, UrlPath(id): UrlPath<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    axum::Json(json!({"id": id, "raw": raw_message(&id), "internalDate": "1715682600000"}))
        .into_response()
}

async fn modify_message(
    State(fakes): State<Arc<Fakes>>,
    headers: HeaderMap,
    UrlPath(id): UrlPath<String>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    assert_eq!(body["removeLabelIds"], json!(["UNREAD"]));
    fakes.unread.lock().unwrap().remove(&id);
    fakes.modified.lock().unwrap().push(id.clone());
    axum::Json(json!({"id": id})).into_response()
}

async fn chat_completions(
    State(fakes): State<Arc<Fakes>>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default().to_string();
    fakes.completions.lock().unwrap().push(prompt.clone());
    let reply = if prompt.contains("vencido") {
        r#"{"category": "pago", "priority": "urgente", "summary": "Pago vencido", "amount": "$2,500.00", "action_required": true}"#
    } else {
        r#"{"category": "transferencia", "priority": "normal", "summary": "SPEI recibido"}"#
    };
    axum::Json(json!({"choices": [{"message": {"role": "assistant", "content": reply}}]}))
        .into_response()
}

async fn broken_completions() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response()
}

async fn send_message(
    State(fakes): State<Arc<Fakes>>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    fakes.telegram.lock().unwrap().push(body);
    axum::Json(json!({"ok": true, "result": {"message_id": 1}})).into_response()
}

async fn get_me_unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({"ok": false, "error_code": 401, "description": "Unauthorized"})),
    )
        .into_response()
}

/// Start the fake server, return its base URL and shared state.
async fn start_server(unread: &[&str]) -> (String, Arc<Fakes>) {
    let fakes = Arc::new(Fakes::default());
    fakes
        .unread
        .lock()
        .unwrap()
        .extend(unread.iter().map(|s| s.to_string()));

    let app = Router::new()
        .route("/token", post(token))
        .route("/gmail/v1/users/me/messages", get(list_messages))
        .route("/gmail/v1/users/me/messages/{id}", get(get_message))
        .route("/gmail/v1/users/me/messages/{id}/modify", post(modify_message))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/down/chat/completions", post(broken_completions))
        .route(&format!("/bot{BOT_TOKEN}/sendMessage"), post(send_message))
        .route("/botrevoked/getMe", get(get_me_unauthorized))
        .with_state(Arc::clone(&fakes));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), fakes)
}

/// Write an expired token file pointing its refresh at the fake server.
fn write_expired_token(path: &Path, base: &str) {
    let token = json!({
        "token": "stale-token",
        "refresh_token": "1//refresh",
        "client_id": "client.apps.googleusercontent.com",
        "client_secret": "secret",
        "token_uri": format!("{base}/token"),
        "scopes": ["https://www.googleapis.com/auth/gmail.modify"],
        "expiry": "2020-01-01T00:00:00.000000Z"
    });
    std::fs::write(path, serde_json::to_string_pretty(&token).unwrap()).unwrap();
}

fn gmail(base: &str, token_path: &Path) -> GmailSource {
    GmailSource::new(GmailConfig {
        token_path: token_path.to_path_buf(),
        max_results: 50,
        query: "is:unread".into(),
        api_url: format!("{base}/gmail/v1"),
    })
}

fn provider(name: &str, base_url: String) -> Arc<dyn LlmProvider> {
    Arc::new(OpenAiCompatProvider::new(
        name,
        base_url,
        SecretString::from("test-key".to_string()),
        "test-model",
        None,
    ))
}

fn telegram(base: &str, token: &str) -> TelegramNotifier {
    TelegramNotifier::new(TelegramConfig {
        bot_token: SecretString::from(token.to_string()),
        chat_id: "42".into(),
        api_url: base.to_string(),
    })
}

#[tokio::test]
async fn full_triage_cycle_over_http() {
    timeout(TEST_TIMEOUT, async {
        let (base, fakes) = start_server(&["m1", "m2"]).await;
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.json");
        write_expired_token(&token_path, &base);

        let db = Arc::new(LibSqlBackend::new_local(&dir.path().join("emails.db")).await.unwrap());
        let selector = ProviderSelector::new(
            vec![
                provider("cerebras", format!("{base}/down")),
                provider("groq", format!("{base}/v1")),
            ],
            SelectionMode::FallbackOnFailure,
        );
        let mut runner = TriageRunner::new(
            Arc::new(gmail(&base, &token_path)),
            Classifier::new(selector, CompiledRules::defaults()),
            db.clone(),
            Arc::new(telegram(&base, BOT_TOKEN)),
        );

        // First run: both emails classified, one urgent alert, both read.
        let stats = runner.run_once().await.unwrap();
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.urgent, 1);
        assert_eq!(stats.failed, 0);

        assert_eq!(*fakes.token_refreshes.lock().unwrap(), 1);
        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&token_path).unwrap()).unwrap();
        assert_eq!(rewritten["access_token"], "fresh-token");
        assert!(rewritten["scopes"].is_array());

        assert_eq!(fakes.completions.lock().unwrap().len(), 2);
        let mut modified = fakes.modified.lock().unwrap().clone();
        modified.sort();
        assert_eq!(modified, vec!["m1", "m2"]);

        {
            let sent = fakes.telegram.lock().unwrap();
            assert_eq!(sent.len(), 1);
            let text = sent[0]["text"].as_str().unwrap();
            assert!(text.contains("CORREO URGENTE"));
            assert!(text.contains("$2,500.00"));
            assert_eq!(sent[0]["chat_id"], "42");
            assert_eq!(sent[0]["parse_mode"], "HTML");
        }

        let urgent = db.get_record("m1").await.unwrap().unwrap();
        assert_eq!(urgent.classification.priority, Priority::Urgente);
        assert!(urgent.classification.action_required);

        // Second run: mailbox is empty, nothing new happens.
        let again = runner.run_once().await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(fakes.telegram.lock().unwrap().len(), 1);

        // Digest: the normal email only, delivered silently, exactly once.
        let outcome = runner.send_digest().await.unwrap();
        assert_eq!(outcome.delivered, 1);
        {
            let sent = fakes.telegram.lock().unwrap();
            assert_eq!(sent.len(), 2);
            let text = sent[1]["text"].as_str().unwrap();
            assert!(text.contains("RESUMEN"));
            assert!(text.contains("SPEI recibido ($300.00)"));
            assert_eq!(sent[1]["disable_notification"], true);
        }
        assert_eq!(runner.send_digest().await.unwrap().delivered, 0);
        assert_eq!(fakes.telegram.lock().unwrap().len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rejected_gmail_token_is_an_auth_error() {
    timeout(TEST_TIMEOUT, async {
        let (base, _fakes) = start_server(&["m1"]).await;
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.json");
        std::fs::write(&token_path, r#"{"access_token": "wrong"}"#).unwrap();

        let err = gmail(&base, &token_path).fetch_unread().await.unwrap_err();
        assert!(matches!(err, MailError::AuthFailed { .. }), "got {err:?}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn revoked_bot_token_is_an_auth_error() {
    timeout(TEST_TIMEOUT, async {
        let (base, _fakes) = start_server(&[]).await;
        let err = telegram(&base, "revoked").test_connection().await.unwrap_err();
        assert!(matches!(err, NotifyError::AuthFailed { .. }), "got {err:?}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn all_providers_down_leaves_mail_unread() {
    timeout(TEST_TIMEOUT, async {
        let (base, fakes) = start_server(&["m2"]).await;
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.json");
        write_expired_token(&token_path, &base);

        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let selector = ProviderSelector::new(
            vec![
                provider("groq", format!("{base}/down")),
                provider("openrouter", format!("{base}/down")),
            ],
            SelectionMode::Rotate,
        );
        let mut runner = TriageRunner::new(
            Arc::new(gmail(&base, &token_path)),
            Classifier::new(selector, CompiledRules::defaults()),
            db.clone(),
            Arc::new(telegram(&base, BOT_TOKEN)),
        );

        let stats = runner.run_once().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert!(fakes.modified.lock().unwrap().is_empty());
        assert!(fakes.unread.lock().unwrap().contains("m2"));
        assert!(!db.is_processed("m2").await.unwrap());
    })
    .await
    .expect("test timed out");
}
