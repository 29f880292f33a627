use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request, StatusCode, Uri,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    response::Response,
    routing::{get, post},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, error, info, info_span, warn};
use ulid::Ulid;
use url::Url;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod email;
pub mod handlers;

use handlers::auth;

pub use crate::{APP_USER_AGENT, GIT_COMMIT_HASH};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::auth::register,
        handlers::auth::confirm_email,
        handlers::auth::login,
        handlers::auth::forgot_password,
        handlers::auth::reset_password
    ),
    components(schemas(
        handlers::health::Health,
        handlers::ErrorResponse,
        handlers::auth::types::RegisterRequest,
        handlers::auth::types::RegisterResponse,
        handlers::auth::types::RegisteredUser,
        handlers::auth::types::LoginRequest,
        handlers::auth::types::LoginResponse,
        handlers::auth::types::SessionUser,
        handlers::auth::types::ForgotPasswordRequest,
        handlers::auth::types::ForgotPasswordResponse,
        handlers::auth::types::ResetPasswordRequest,
        handlers::auth::types::ResetPasswordResponse
    )),
    tags(
        (name = "auth", description = "Account registration, confirmation and credential lifecycle"),
        (name = "health", description = "Service health")
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Apply `sql/schema.sql` statement by statement. Idempotent: every
/// statement is `IF NOT EXISTS`-guarded.
///
/// # Errors
///
/// Returns an error if a statement fails to execute.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
    }

    Ok(())
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            push_statement(&mut statements, &current);
            current.clear();
        }
    }

    push_statement(&mut statements, &current);

    statements
}

fn push_statement(statements: &mut Vec<String>, candidate: &str) {
    let statement = candidate.trim();
    let has_sql = statement
        .lines()
        .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with("--"));
    if has_sql {
        statements.push(statement.to_string());
    }
}

/// Build the application router with its full layer stack.
#[must_use]
pub fn app(pool: PgPool, auth_config: Arc<auth::AuthConfig>) -> Router {
    let cors = cors_layer(auth_config.client_url());

    Router::new()
        .route("/", get(root))
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/confirm-email", get(handlers::auth::confirm_email))
        .route("/api/auth/login", post(handlers::auth::login))
        .route(
            "/api/auth/forgot-password",
            post(handlers::auth::forgot_password),
        )
        .route(
            "/api/auth/reset-password",
            post(handlers::auth::reset_password),
        )
        .route("/health", get(handlers::health).options(handlers::health))
        .merge(SwaggerUi::new("/apidoc").url("/apidoc/openapi.json", openapi()))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(auth_config))
                .layer(Extension(pool)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    auth_config: auth::AuthConfig,
    email_config: email::EmailWorkerConfig,
    sender: Arc<dyn email::EmailSender>,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    init_schema(&pool)
        .await
        .context("Failed to initialize database schema")?;

    // Background worker polls email_outbox (DB-backed queue) for pending
    // rows, delivers them, and retries failures with exponential backoff.
    email::spawn_outbox_worker(pool.clone(), sender, email_config);

    let app = app(pool, Arc::new(auth_config));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

async fn root() -> &'static str {
    "Authentication Server is running"
}

// The catch-all of last resort: a panicking handler still answers JSON.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Unhandled panic in request handler: {detail}");
    handlers::error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "An unexpected error occurred",
    )
}

// Unmatched routes answer JSON, never the default HTML error page: the
// client assumes every response body parses as JSON.
async fn not_found(method: Method, uri: Uri) -> Response {
    warn!("[404] {method} {uri} route not found");
    handlers::error_response(
        StatusCode::NOT_FOUND,
        format!("Route not found: {method} {uri}"),
    )
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn cors_layer(client_url: &str) -> CorsLayer {
    let mut origins: Vec<HeaderValue> = Vec::new();

    match frontend_origin(client_url) {
        Ok(origin) => origins.push(origin),
        Err(err) => warn!("Ignoring invalid CLIENT_URL for CORS: {err}"),
    }

    // Local dev frontends
    for dev_origin in [
        "http://localhost:5173",
        "http://localhost:5174",
        "http://localhost:5175",
        "http://localhost:3000",
    ] {
        if let Ok(value) = HeaderValue::from_str(dev_origin) {
            if !origins.contains(&value) {
                origins.push(value);
            }
        }
    }

    CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

fn frontend_origin(client_url: &str) -> Result<HeaderValue> {
    let parsed =
        Url::parse(client_url).with_context(|| format!("Invalid client URL: {client_url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Client URL must include a valid host: {client_url}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use tower::ServiceExt;

    fn test_router() -> Router {
        // Lazy pool: never connects unless a handler touches the database.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost:1/unused")
            .expect("lazy pool");
        let config = Arc::new(auth::AuthConfig::new(
            "http://localhost:5173".to_string(),
            "http://localhost:5000".to_string(),
            SecretString::from("test-secret"),
        ));
        app(pool, config)
    }

    #[test]
    fn schema_splits_into_statements() {
        let statements = split_sql_statements(SCHEMA_SQL);
        assert!(statements.len() >= 4, "expected tables and indexes");
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS users"));
        assert!(statements.iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn comment_only_blocks_are_dropped() {
        let statements = split_sql_statements("-- just a comment\n\n-- another\n");
        assert!(statements.is_empty());
    }

    #[test]
    fn frontend_origin_strips_path() -> Result<()> {
        let origin = frontend_origin("https://libertasalpha.io/some/path")?;
        assert_eq!(origin, HeaderValue::from_static("https://libertasalpha.io"));

        let origin = frontend_origin("http://localhost:5173")?;
        assert_eq!(origin, HeaderValue::from_static("http://localhost:5173"));
        Ok(())
    }

    #[test]
    fn frontend_origin_rejects_garbage() {
        assert!(frontend_origin("not a url").is_err());
    }

    #[tokio::test]
    async fn root_banner() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"Authentication Server is running");
    }

    #[tokio::test]
    async fn unmatched_route_is_json_404() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/auth/unknown")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.contains("application/json"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let parsed: handlers::ErrorResponse = serde_json::from_slice(&body).expect("json body");
        assert!(parsed.message.contains("Route not found"));
        assert!(parsed.message.contains("/api/auth/unknown"));
    }

    #[tokio::test]
    async fn missing_register_payload_is_json_400() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/auth/register")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let parsed: handlers::ErrorResponse = serde_json::from_slice(&body).expect("json body");
        assert_eq!(parsed.message, "Missing payload");
    }

    #[tokio::test]
    #[allow(dependency_on_unit_never_type_fallback)]
    async fn panics_become_json_500() {
        let app = Router::new()
            .route("/boom", get(|| async { panic!("boom") }))
            .layer(CatchPanicLayer::custom(handle_panic));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/boom")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let parsed: handlers::ErrorResponse = serde_json::from_slice(&body).expect("json body");
        assert_eq!(parsed.message, "An unexpected error occurred");
    }

    #[test]
    fn openapi_lists_auth_paths() {
        let document = openapi();
        let paths = document.paths.paths;
        assert!(paths.contains_key("/api/auth/register"));
        assert!(paths.contains_key("/api/auth/confirm-email"));
        assert!(paths.contains_key("/api/auth/login"));
        assert!(paths.contains_key("/api/auth/forgot-password"));
        assert!(paths.contains_key("/api/auth/reset-password"));
        assert!(paths.contains_key("/health"));
    }
}
