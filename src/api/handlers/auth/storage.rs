//! Credential store queries.
//!
//! Every mutation that triggers an email (registration, forgot-password)
//! runs in one transaction with its outbox enqueue. Registration is a
//! single INSERT: uniqueness races are settled by the database constraints,
//! and constraint violations are mapped back to the duplicate-field errors
//! the API reports.

use crate::api::email;
use anyhow::{Context, Result};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{Instrument, info_span};

pub struct NewAccount<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub confirmation_token: &'a str,
    pub wallet_address: &'a str,
}

#[derive(Debug)]
pub struct AccountSummary {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub wallet_address: String,
}

#[derive(Debug)]
pub enum CreateOutcome {
    Created(AccountSummary),
    DuplicateEmail,
    DuplicateUsername,
}

pub struct LoginRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_confirmed: bool,
    pub wallet_address: String,
}

/// Insert the account and enqueue its confirmation email in one transaction.
///
/// # Errors
///
/// Returns an error on any database failure other than a username/email
/// unique violation, which maps to the corresponding [`CreateOutcome`].
pub async fn create_account(
    pool: &PgPool,
    account: &NewAccount<'_>,
    confirm_url: &str,
) -> Result<CreateOutcome> {
    let mut tx = pool.begin().await.context("begin register transaction")?;

    let query = r"
        INSERT INTO users
            (username, email, password, confirmation_token, wallet_address)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, username, email, wallet_address
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account.username)
        .bind(account.email)
        .bind(account.password_hash)
        .bind(account.confirmation_token)
        .bind(account.wallet_address)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await;

    let row = match row {
        Ok(row) => row,
        Err(err) => {
            if let Some(outcome) = duplicate_outcome(&err) {
                let _ = tx.rollback().await;
                return Ok(outcome);
            }
            return Err(err).context("failed to insert user");
        }
    };

    let created = AccountSummary {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        wallet_address: row.get("wallet_address"),
    };

    let payload = json!({
        "username": created.username,
        "confirm_url": confirm_url,
    });
    email::enqueue(&mut tx, &created.email, email::TEMPLATE_CONFIRM_EMAIL, &payload).await?;

    tx.commit().await.context("commit register transaction")?;

    Ok(CreateOutcome::Created(created))
}

/// Consume a confirmation token. Returns `false` when no unconfirmed
/// account holds the token (unknown, or already consumed).
///
/// # Errors
///
/// Returns an error on database failure.
pub async fn confirm_email(pool: &PgPool, token: &str) -> Result<bool> {
    let query = r"
        UPDATE users
        SET is_confirmed = TRUE,
            confirmation_token = NULL
        WHERE confirmation_token = $1
        RETURNING id
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume confirmation token")?;

    Ok(row.is_some())
}

/// Look up the full login record for an email address.
///
/// # Errors
///
/// Returns an error on database failure.
pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<LoginRecord>> {
    let query = r"
        SELECT id, username, email, password, is_confirmed, wallet_address
        FROM users
        WHERE email = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup account by email")?;

    Ok(row.map(|row| LoginRecord {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password"),
        is_confirmed: row.get("is_confirmed"),
        wallet_address: row.get("wallet_address"),
    }))
}

/// Store a reset token with its expiry and enqueue the reset email, all in
/// one transaction. Returns `false` when no account matches the email; the
/// caller answers identically either way.
///
/// # Errors
///
/// Returns an error on database failure.
pub async fn start_password_reset(
    pool: &PgPool,
    email_address: &str,
    token: &str,
    ttl_seconds: i64,
    reset_url: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("begin reset transaction")?;

    let query = r"
        UPDATE users
        SET reset_password_token = $1,
            reset_password_expires = NOW() + ($2 * INTERVAL '1 second')
        WHERE email = $3
        RETURNING id
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token)
        .bind(ttl_seconds)
        .bind(email_address)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to store reset token")?;

    if row.is_none() {
        tx.commit().await.context("commit reset noop")?;
        return Ok(false);
    }

    let payload = json!({ "reset_url": reset_url });
    email::enqueue(&mut tx, email_address, email::TEMPLATE_RESET_PASSWORD, &payload).await?;

    tx.commit().await.context("commit reset transaction")?;

    Ok(true)
}

/// Replace the password hash and clear both reset fields, provided the
/// token exists and its expiry is still in the future. Expired tokens are
/// indistinguishable from absent ones.
///
/// # Errors
///
/// Returns an error on database failure.
pub async fn reset_password(pool: &PgPool, token: &str, password_hash: &str) -> Result<bool> {
    let query = r"
        UPDATE users
        SET password = $1,
            reset_password_token = NULL,
            reset_password_expires = NULL
        WHERE reset_password_token = $2
          AND reset_password_expires > NOW()
        RETURNING id
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(password_hash)
        .bind(token)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume reset token")?;

    Ok(row.is_some())
}

fn duplicate_outcome(err: &sqlx::Error) -> Option<CreateOutcome> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if db_err.code().as_deref() != Some("23505") {
        return None;
    }
    match db_err.constraint() {
        Some("users_email_key") => Some(CreateOutcome::DuplicateEmail),
        Some("users_username_key") => Some(CreateOutcome::DuplicateUsername),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use ulid::Ulid;

    // These tests need a live Postgres; set LIBERTAS_TEST_DSN to run them.
    async fn test_pool() -> Option<PgPool> {
        let Ok(dsn) = std::env::var("LIBERTAS_TEST_DSN") else {
            eprintln!("Skipping integration test: LIBERTAS_TEST_DSN not set");
            return None;
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&dsn)
            .await
            .ok()?;
        crate::api::init_schema(&pool).await.ok()?;
        Some(pool)
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", Ulid::new().to_string().to_lowercase())
    }

    fn new_account<'a>(
        username: &'a str,
        email: &'a str,
        token: &'a str,
        wallet_address: &'a str,
    ) -> NewAccount<'a> {
        NewAccount {
            username,
            email,
            password_hash: "$argon2id$stub",
            confirmation_token: token,
            wallet_address,
        }
    }

    #[tokio::test]
    async fn duplicate_email_and_username_mapped() -> Result<()> {
        let Some(pool) = test_pool().await else {
            return Ok(());
        };

        let username = unique("alice");
        let email = format!("{}@example.com", unique("alice"));
        let first_wallet = crate::wallet::generate();
        let outcome = create_account(
            &pool,
            &new_account(&username, &email, &unique("token"), &first_wallet.address),
            "http://localhost:5000/api/auth/confirm-email?token=t",
        )
        .await?;
        assert!(matches!(outcome, CreateOutcome::Created(_)));

        // Same email, different username
        let second_wallet = crate::wallet::generate();
        let outcome = create_account(
            &pool,
            &new_account(
                &unique("alice2"),
                &email,
                &unique("token"),
                &second_wallet.address,
            ),
            "http://localhost:5000/api/auth/confirm-email?token=t",
        )
        .await?;
        assert!(matches!(outcome, CreateOutcome::DuplicateEmail));

        // Same username, different email
        let third_wallet = crate::wallet::generate();
        let other_email = format!("{}@example.com", unique("alice3"));
        let outcome = create_account(
            &pool,
            &new_account(&username, &other_email, &unique("token"), &third_wallet.address),
            "http://localhost:5000/api/auth/confirm-email?token=t",
        )
        .await?;
        assert!(matches!(outcome, CreateOutcome::DuplicateUsername));

        Ok(())
    }

    #[tokio::test]
    async fn confirmation_token_single_use() -> Result<()> {
        let Some(pool) = test_pool().await else {
            return Ok(());
        };

        let token = unique("confirm");
        let wallet = crate::wallet::generate();
        let email_address = format!("{}@example.com", unique("bob"));
        create_account(
            &pool,
            &new_account(&unique("bob"), &email_address, &token, &wallet.address),
            "http://localhost:5000/api/auth/confirm-email?token=t",
        )
        .await?;

        assert!(confirm_email(&pool, &token).await?);
        assert!(!confirm_email(&pool, &token).await?);
        assert!(!confirm_email(&pool, "no-such-token").await?);

        let record = find_by_email(&pool, &email_address)
            .await?
            .expect("account exists");
        assert!(record.is_confirmed);

        Ok(())
    }

    #[tokio::test]
    async fn reset_token_consumed_and_expiry_enforced() -> Result<()> {
        let Some(pool) = test_pool().await else {
            return Ok(());
        };

        let wallet = crate::wallet::generate();
        let email_address = format!("{}@example.com", unique("carol"));
        create_account(
            &pool,
            &new_account(&unique("carol"), &email_address, &unique("token"), &wallet.address),
            "http://localhost:5000/api/auth/confirm-email?token=t",
        )
        .await?;

        // Unknown email: same code path, no row touched
        assert!(
            !start_password_reset(
                &pool,
                "missing@example.com",
                &unique("reset"),
                3600,
                "http://localhost:5173/reset-password?token=t",
            )
            .await?
        );

        let token = unique("reset");
        assert!(
            start_password_reset(
                &pool,
                &email_address,
                &token,
                3600,
                "http://localhost:5173/reset-password?token=t",
            )
            .await?
        );

        assert!(reset_password(&pool, &token, "$argon2id$new").await?);
        // Consumed: a second use fails
        assert!(!reset_password(&pool, &token, "$argon2id$other").await?);

        // Expired tokens are treated as absent
        let expired = unique("reset");
        start_password_reset(
            &pool,
            &email_address,
            &expired,
            3600,
            "http://localhost:5173/reset-password?token=t",
        )
        .await?;
        sqlx::query(
            "UPDATE users SET reset_password_expires = NOW() - INTERVAL '1 second' WHERE email = $1",
        )
        .bind(&email_address)
        .execute(&pool)
        .await
        .context("failed to backdate expiry")?;
        assert!(!reset_password(&pool, &expired, "$argon2id$late").await?);

        Ok(())
    }

    #[tokio::test]
    async fn register_enqueues_confirmation_email() -> Result<()> {
        let Some(pool) = test_pool().await else {
            return Ok(());
        };

        let wallet = crate::wallet::generate();
        let email_address = format!("{}@example.com", unique("dora"));
        create_account(
            &pool,
            &new_account(&unique("dora"), &email_address, &unique("token"), &wallet.address),
            "http://localhost:5000/api/auth/confirm-email?token=t",
        )
        .await?;

        let row = sqlx::query(
            "SELECT template, status FROM email_outbox WHERE to_email = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(&email_address)
        .fetch_one(&pool)
        .await
        .context("outbox row missing")?;

        let template: String = row.get("template");
        let status: String = row.get("status");
        assert_eq!(template, email::TEMPLATE_CONFIRM_EMAIL);
        assert_eq!(status, "pending");

        Ok(())
    }
}
