//! Auth flow handlers: register, confirm-email, login, forgot-password,
//! reset-password.
//!
//! Error surface is deliberate and asymmetric: registration distinguishes
//! duplicate email from duplicate username, while login and forgot-password
//! answer generically to avoid account enumeration. Token errors never say
//! whether a token was unknown, consumed, or expired.

pub mod session;
pub mod storage;
pub mod types;

use crate::{
    api::{email, handlers::error_response},
    wallet,
};
use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use argon2::{
    Argon2, PasswordHasher, PasswordVerifier,
    password_hash::{PasswordHash, SaltString, rand_core::OsRng as SaltRng},
};
use rand::{RngCore, rngs::OsRng};
use secrecy::SecretString;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error};
use types::{
    ConfirmEmailQuery, ForgotPasswordRequest, ForgotPasswordResponse, LoginRequest, LoginResponse,
    RegisterRequest, RegisterResponse, RegisteredUser, ResetPasswordRequest,
    ResetPasswordResponse, SessionUser,
};

const DEFAULT_SESSION_TTL_SECONDS: i64 = 3600;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 3600;

const GENERIC_RESET_MESSAGE: &str =
    "If a user with this email exists, a password reset link has been sent.";
const INVALID_CREDENTIALS: &str = "Invalid credentials";

#[derive(Clone)]
pub struct AuthConfig {
    client_url: String,
    server_url: String,
    jwt_secret: SecretString,
    session_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
}

impl AuthConfig {
    #[must_use]
    pub fn new(client_url: String, server_url: String, jwt_secret: SecretString) -> Self {
        Self {
            client_url,
            server_url,
            jwt_secret,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn client_url(&self) -> &str {
        &self.client_url
    }

    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    #[must_use]
    pub fn jwt_secret(&self) -> &SecretString {
        &self.jwt_secret
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn reset_token_ttl_seconds(&self) -> i64 {
        self.reset_token_ttl_seconds
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("client_url", &self.client_url)
            .field("server_url", &self.server_url)
            .field("jwt_secret", &"***")
            .field("session_ttl_seconds", &self.session_ttl_seconds)
            .field("reset_token_ttl_seconds", &self.reset_token_ttl_seconds)
            .finish()
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Registration successful", body = RegisterResponse),
        (status = 400, description = "Duplicate email or username", body = crate::api::handlers::ErrorResponse),
        (status = 500, description = "Registration failed", body = crate::api::handlers::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn register(
    pool: Extension<PgPool>,
    config: Extension<Arc<AuthConfig>>,
    payload: Option<Json<RegisterRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Missing payload");
    };

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Error hashing password: {err:?}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    let confirmation_token = match generate_opaque_token() {
        Ok(token) => token,
        Err(err) => {
            error!("Error generating confirmation token: {err:?}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    let wallet = wallet::generate();
    let confirm_url = email::build_confirmation_url(config.server_url(), &confirmation_token);

    let account = storage::NewAccount {
        username: &request.username,
        email: &request.email,
        password_hash: &password_hash,
        confirmation_token: &confirmation_token,
        wallet_address: &wallet.address,
    };

    match storage::create_account(&pool, &account, &confirm_url).await {
        Ok(storage::CreateOutcome::Created(created)) => {
            debug!("Registered account {} ({})", created.id, created.email);
            (
                StatusCode::CREATED,
                Json(RegisterResponse {
                    message: "User registered successfully. Please check your email to confirm \
                              your account."
                        .to_string(),
                    user: RegisteredUser {
                        id: created.id,
                        username: created.username,
                        email: created.email,
                        wallet_address: created.wallet_address,
                        // Returned once; the server keeps no copy.
                        wallet_private_key: wallet.private_key,
                    },
                }),
            )
                .into_response()
        }
        Ok(storage::CreateOutcome::DuplicateEmail) => {
            error_response(StatusCode::BAD_REQUEST, "Email already in use")
        }
        Ok(storage::CreateOutcome::DuplicateUsername) => {
            error_response(StatusCode::BAD_REQUEST, "Username already in use")
        }
        Err(err) => {
            error!("Error inserting user: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/auth/confirm-email",
    params(ConfirmEmailQuery),
    responses(
        (status = 302, description = "Email confirmed, redirect to the login page"),
        (status = 400, description = "Invalid or expired token", body = crate::api::handlers::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn confirm_email(
    pool: Extension<PgPool>,
    config: Extension<Arc<AuthConfig>>,
    Query(params): Query<ConfirmEmailQuery>,
) -> Response {
    let Some(token) = params.token.filter(|token| !token.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Token is required");
    };

    match storage::confirm_email(&pool, &token).await {
        Ok(true) => {
            let location = format!(
                "{}/login?confirmed=true",
                config.client_url().trim_end_matches('/')
            );
            match HeaderValue::from_str(&location) {
                Ok(value) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(header::LOCATION, value);
                    (StatusCode::FOUND, headers).into_response()
                }
                Err(err) => {
                    error!("Invalid redirect location {location}: {err}");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
                }
            }
        }
        Ok(false) => error_response(StatusCode::BAD_REQUEST, "Invalid or expired token"),
        Err(err) => {
            error!("Error confirming email: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 400, description = "Invalid credentials", body = crate::api::handlers::ErrorResponse),
        (status = 401, description = "Email not confirmed", body = crate::api::handlers::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    pool: Extension<PgPool>,
    config: Extension<Arc<AuthConfig>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Missing payload");
    };

    let record = match storage::find_by_email(&pool, &request.email).await {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, INVALID_CREDENTIALS),
        Err(err) => {
            error!("Error looking up account: {err:?}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    // Unconfirmed accounts are rejected before the password is checked.
    if !record.is_confirmed {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "Please confirm your email before logging in",
        );
    }

    if !verify_password(&record.password_hash, &request.password) {
        return error_response(StatusCode::BAD_REQUEST, INVALID_CREDENTIALS);
    }

    match session::issue(
        config.jwt_secret(),
        record.id,
        &record.email,
        config.session_ttl_seconds(),
    ) {
        Ok(token) => (
            StatusCode::OK,
            Json(LoginResponse {
                result: SessionUser {
                    id: record.id,
                    username: record.username,
                    email: record.email,
                    wallet_address: record.wallet_address,
                },
                token,
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Error signing session token: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Generic acknowledgement, sent whether or not the account exists", body = ForgotPasswordResponse),
        (status = 400, description = "Missing email", body = crate::api::handlers::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn forgot_password(
    pool: Extension<PgPool>,
    config: Extension<Arc<AuthConfig>>,
    payload: Option<Json<ForgotPasswordRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Email is required");
    };

    let token = match generate_opaque_token() {
        Ok(token) => token,
        Err(err) => {
            error!("Error generating reset token: {err:?}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    let reset_url = email::build_reset_url(config.client_url(), &token);

    match storage::start_password_reset(
        &pool,
        &request.email,
        &token,
        config.reset_token_ttl_seconds(),
        &reset_url,
    )
    .await
    {
        // Same response either way: no enumeration signal.
        Ok(_) => (
            StatusCode::OK,
            Json(ForgotPasswordResponse {
                message: GENERIC_RESET_MESSAGE.to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Error starting password reset: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password replaced", body = ResetPasswordResponse),
        (status = 400, description = "Invalid or expired token", body = crate::api::handlers::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn reset_password(
    pool: Extension<PgPool>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request");
    };

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Error hashing password: {err:?}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    match storage::reset_password(&pool, &request.token, &password_hash).await {
        Ok(true) => (
            StatusCode::OK,
            Json(ResetPasswordResponse {
                success: true,
                message: "Password has been reset successfully".to_string(),
            }),
        )
            .into_response(),
        Ok(false) => error_response(
            StatusCode::BAD_REQUEST,
            "Invalid or expired password reset token",
        ),
        Err(err) => {
            error!("Error resetting password: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
        }
    }
}

fn generate_opaque_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate opaque token")?;
    Ok(hex::encode(bytes))
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow::anyhow!("password hashing failed: {err}"))
}

fn verify_password(stored: &str, password: &str) -> bool {
    PasswordHash::new(stored).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_tokens_are_hex_and_distinct() -> Result<()> {
        let one = generate_opaque_token()?;
        let two = generate_opaque_token()?;

        assert_eq!(one.len(), 64);
        assert!(one.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(one, two);
        Ok(())
    }

    #[test]
    fn password_hash_roundtrip() -> Result<()> {
        let hash = hash_password("secret123")?;

        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&hash, "secret123"));
        assert!(!verify_password(&hash, "secret124"));
        Ok(())
    }

    #[test]
    fn verify_rejects_malformed_hash() {
        assert!(!verify_password("not-a-phc-string", "secret123"));
    }

    #[test]
    fn hashes_are_salted() -> Result<()> {
        let one = hash_password("secret123")?;
        let two = hash_password("secret123")?;
        assert_ne!(one, two);
        Ok(())
    }

    #[test]
    fn auth_config_redacts_secret() {
        let config = AuthConfig::new(
            "http://localhost:5173".to_string(),
            "http://localhost:5000".to_string(),
            SecretString::from("super-secret"),
        );

        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn auth_config_builders() {
        let config = AuthConfig::new(
            "http://localhost:5173".to_string(),
            "http://localhost:5000".to_string(),
            SecretString::from("secret"),
        )
        .with_session_ttl_seconds(60)
        .with_reset_token_ttl_seconds(120);

        assert_eq!(config.session_ttl_seconds(), 60);
        assert_eq!(config.reset_token_ttl_seconds(), 120);
    }
}
