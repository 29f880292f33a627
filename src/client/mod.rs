//! Typed client for the account API.
//!
//! Mirrors the guarantees the browser hook gives the frontend: every call
//! distinguishes "server unreachable" from "server answered with an error",
//! and a response that is not JSON (a proxy error page, a sleeping host)
//! surfaces as [`ApiError::UnexpectedContent`] with a diagnostic snippet
//! instead of a parse exception.
//!
//! The authenticated identity and bearer token live in a [`SessionStore`];
//! sessions are stateless, so [`AuthClient::logout`] only clears the store
//! and never talks to the server.

use crate::APP_USER_AGENT;
use reqwest::{Client, Response, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tracing::error;

const SNIPPET_LIMIT: usize = 800;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cannot reach the server: {message}")]
    Unreachable { message: String },
    #[error("expected JSON but received {content_type} (HTTP {status})")]
    UnexpectedContent {
        status: u16,
        content_type: String,
        snippet: String,
    },
    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },
    #[error("failed to decode server response: {0}")]
    Decode(String),
    #[error("not authenticated; sign in at {login_url}")]
    Unauthenticated { login_url: String },
    #[error("failed to persist session: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub wallet_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub wallet_address: String,
    pub wallet_private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutcome {
    pub message: String,
    pub user: RegisteredUser,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user: SessionUser,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    result: SessionUser,
    token: String,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResetBody {
    #[allow(dead_code)]
    success: bool,
    message: String,
}

/// Durable holder for the current session.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Option<Session>;

    /// # Errors
    /// Returns an error if the session cannot be persisted.
    fn save(&self, session: &Session) -> Result<(), ApiError>;

    /// # Errors
    /// Returns an error if the stored session cannot be removed.
    fn clear(&self) -> Result<(), ApiError>;
}

/// In-memory store, good for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<Session> {
        self.session.lock().ok()?.clone()
    }

    fn save(&self, session: &Session) -> Result<(), ApiError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|err| ApiError::Storage(err.to_string()))?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), ApiError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|err| ApiError::Storage(err.to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// JSON-file store, the durable equivalent of the browser's local storage.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<Session> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn save(&self, session: &Session) -> Result<(), ApiError> {
        let raw = serde_json::to_string_pretty(session)
            .map_err(|err| ApiError::Storage(err.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|err| ApiError::Storage(err.to_string()))
    }

    fn clear(&self) -> Result<(), ApiError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ApiError::Storage(err.to_string())),
        }
    }
}

pub struct AuthClient {
    http: Client,
    base_url: String,
    login_path: String,
    store: Arc<dyn SessionStore>,
}

impl AuthClient {
    /// Build a client against a server base URL.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, store: Arc<dyn SessionStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ApiError::Unreachable {
                message: err.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            login_path: "/login".to_string(),
            store,
        })
    }

    /// Override the login path reported by [`AuthClient::ensure_authenticated`].
    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// # Errors
    /// Returns an [`ApiError`] describing transport or server failure.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<RegisterOutcome, ApiError> {
        self.post_json(
            "/api/auth/register",
            &serde_json::json!({
                "username": username,
                "email": email,
                "password": password,
            }),
        )
        .await
    }

    /// Log in and persist the returned session.
    ///
    /// # Errors
    /// Returns an [`ApiError`] describing transport, server, or storage
    /// failure.
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionUser, ApiError> {
        let payload: LoginPayload = self
            .post_json(
                "/api/auth/login",
                &serde_json::json!({ "email": email, "password": password }),
            )
            .await?;

        let session = Session {
            user: payload.result.clone(),
            token: payload.token,
        };
        self.store.save(&session)?;

        Ok(payload.result)
    }

    /// # Errors
    /// Returns an [`ApiError`] describing transport or server failure.
    pub async fn forgot_password(&self, email: &str) -> Result<String, ApiError> {
        let body: MessageBody = self
            .post_json(
                "/api/auth/forgot-password",
                &serde_json::json!({ "email": email }),
            )
            .await?;
        Ok(body.message)
    }

    /// # Errors
    /// Returns an [`ApiError`] describing transport or server failure.
    pub async fn reset_password(&self, token: &str, password: &str) -> Result<String, ApiError> {
        let body: ResetBody = self
            .post_json(
                "/api/auth/reset-password",
                &serde_json::json!({ "token": token, "password": password }),
            )
            .await?;
        Ok(body.message)
    }

    /// Clear the local session. The bearer token stays valid server-side
    /// until it expires; there is no revocation.
    ///
    /// # Errors
    /// Returns an error if the store cannot be cleared.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.store.clear()
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.store.load()
    }

    #[must_use]
    pub fn current_user(&self) -> Option<SessionUser> {
        self.session().map(|session| session.user)
    }

    #[must_use]
    pub fn bearer_token(&self) -> Option<String> {
        self.session().map(|session| session.token)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    /// Return the session, or the login URL to redirect to when there is
    /// none.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthenticated`] when no session is stored.
    pub fn ensure_authenticated(&self) -> Result<Session, ApiError> {
        self.session().ok_or_else(|| ApiError::Unauthenticated {
            login_url: format!(
                "{}{}",
                self.base_url.trim_end_matches('/'),
                self.login_path
            ),
        })
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                error!("[API] network error reaching {url}: {err}");
                ApiError::Unreachable {
                    message: err.to_string(),
                }
            })?;

        read_json(response).await
    }
}

// Parses the body as JSON only if the server actually sent JSON. Anything
// else (proxy error page, sleeping host) is reported with the raw text so
// the operator can see exactly what came back.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let url = response.url().clone();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let bytes = response.bytes().await.map_err(|err| ApiError::Unreachable {
        message: err.to_string(),
    })?;

    if !content_type.contains("application/json") {
        let raw = String::from_utf8_lossy(&bytes);
        let snippet: String = raw.chars().take(SNIPPET_LIMIT).collect();
        error!(
            "[API] expected JSON but received {content_type:?} from {url} (HTTP {status}): {snippet}"
        );
        return Err(ApiError::UnexpectedContent {
            status: status.as_u16(),
            content_type,
            snippet,
        });
    }

    if !status.is_success() {
        let message = serde_json::from_slice::<MessageBody>(&bytes)
            .map(|body| body.message)
            .unwrap_or_else(|_| format!("Request failed (HTTP {status})"));
        return Err(ApiError::Api {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, response::Html, routing::post};
    use tokio::net::TcpListener;
    use ulid::Ulid;

    async fn spawn_test_server() -> String {
        let app = Router::new()
            .route(
                "/api/auth/login",
                post(|| async {
                    Json(serde_json::json!({
                        "result": {
                            "id": 1,
                            "username": "alice",
                            "email": "alice@example.com",
                            "walletAddress": "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23"
                        },
                        "token": "header.payload.signature"
                    }))
                }),
            )
            .route(
                "/api/auth/forgot-password",
                post(|| async {
                    Json(serde_json::json!({
                        "message": "If a user with this email exists, a password reset link has been sent."
                    }))
                }),
            )
            .route(
                "/api/auth/register",
                post(|| async {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({ "message": "Email already in use" })),
                    )
                }),
            )
            .route(
                "/api/auth/reset-password",
                post(|| async { Html("<html><body>Service starting</body></html>") }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("serve");
        });

        format!("http://{addr}")
    }

    fn memory_client(base_url: &str) -> AuthClient {
        AuthClient::new(base_url, Arc::new(MemorySessionStore::default())).expect("client")
    }

    #[tokio::test]
    async fn login_persists_session() -> Result<(), ApiError> {
        let base_url = spawn_test_server().await;
        let client = memory_client(&base_url);

        assert!(!client.is_authenticated());

        let user = client.login("alice@example.com", "secret123").await?;
        assert_eq!(user.username, "alice");

        assert!(client.is_authenticated());
        assert_eq!(
            client.bearer_token().as_deref(),
            Some("header.payload.signature")
        );
        assert_eq!(client.current_user().map(|user| user.id), Some(1));

        client.logout()?;
        assert!(!client.is_authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn error_body_surfaces_message_and_status() {
        let base_url = spawn_test_server().await;
        let client = memory_client(&base_url);

        let result = client
            .register("alice", "alice@example.com", "secret123")
            .await;
        match result {
            Err(ApiError::Api { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Email already in use");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_response_is_distinguishable() {
        let base_url = spawn_test_server().await;
        let client = memory_client(&base_url);

        let result = client.reset_password("token", "newpassword").await;
        match result {
            Err(ApiError::UnexpectedContent {
                status,
                content_type,
                snippet,
            }) => {
                assert_eq!(status, 200);
                assert!(content_type.contains("text/html"));
                assert!(snippet.contains("Service starting"));
            }
            other => panic!("expected UnexpectedContent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_distinguishable() {
        // Nothing listens on port 1
        let client = memory_client("http://127.0.0.1:1");

        let result = client.forgot_password("alice@example.com").await;
        assert!(matches!(result, Err(ApiError::Unreachable { .. })));
    }

    #[test]
    fn ensure_authenticated_reports_login_url() {
        let client = memory_client("http://localhost:5000").with_login_path("/login");

        match client.ensure_authenticated() {
            Err(ApiError::Unauthenticated { login_url }) => {
                assert_eq!(login_url, "http://localhost:5000/login");
            }
            other => panic!("expected Unauthenticated error, got {other:?}"),
        }
    }

    #[test]
    fn file_store_roundtrip() -> Result<(), ApiError> {
        let path = std::env::temp_dir().join(format!("libertas-session-{}.json", Ulid::new()));
        let store = FileSessionStore::new(path.clone());

        assert!(store.load().is_none());

        let session = Session {
            user: SessionUser {
                id: 7,
                username: "bob".to_string(),
                email: "bob@example.com".to_string(),
                wallet_address: "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23".to_string(),
            },
            token: "token".to_string(),
        };
        store.save(&session)?;
        assert_eq!(store.load(), Some(session));

        store.clear()?;
        assert!(store.load().is_none());
        // Clearing twice is fine
        store.clear()?;

        let _ = std::fs::remove_file(path);
        Ok(())
    }
}
