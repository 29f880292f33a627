//! Email templates, delivery, and the outbox worker.
//!
//! Auth flows never talk to the mail transport directly. They enqueue rows
//! in `email_outbox` inside the same transaction as the user mutation, so a
//! registration and its confirmation email commit or fail together. A
//! background task polls that table, locks a batch via
//! `FOR UPDATE SKIP LOCKED`, renders the template, and hands the message to
//! an [`EmailSender`]. Failed rows retry with exponential backoff and jitter
//! until a max attempt threshold is reached, then are marked `failed`.
//!
//! Transport failures keep their class: SMTP authentication rejections map
//! to [`EmailError::Auth`] and everything else to [`EmailError::Send`], so
//! an operator reading `last_error` can tell a bad app password from a flaky
//! relay.
//!
//! The default sender for local dev is [`LogEmailSender`], which logs the
//! rendered message and returns `Ok(())`.

use anyhow::{Context, Result};
use lettre::{
    Message, SmtpTransport, Transport,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

pub const TEMPLATE_CONFIRM_EMAIL: &str = "confirm_email";
pub const TEMPLATE_RESET_PASSWORD: &str = "reset_password";

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email authentication failed: {0}")]
    Auth(String),
    #[error("failed to send email: {0}")]
    Send(String),
    #[error("invalid email message: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Email delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Local dev sender that logs the rendered message instead of sending it.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let rendered = render(message)?;
        info!(
            to_email = %message.to_email,
            template = %message.template,
            subject = %rendered.subject,
            "email send stub"
        );
        Ok(())
    }
}

/// SMTP sender backed by lettre, authenticated with the configured
/// user/app-password pair.
pub struct SmtpEmailSender {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpEmailSender {
    /// Build a relay transport against the configured SMTP host.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot be constructed or the sender
    /// address does not parse as a mailbox.
    pub fn new(host: &str, port: u16, user: &str, pass: &SecretString) -> Result<Self> {
        let transport = SmtpTransport::relay(host)
            .with_context(|| format!("Failed to configure SMTP relay for {host}"))?
            .port(port)
            .credentials(Credentials::new(
                user.to_string(),
                pass.expose_secret().to_string(),
            ))
            .build();

        let from = user
            .parse::<Mailbox>()
            .with_context(|| format!("Invalid sender mailbox: {user}"))?;

        Ok(Self { transport, from })
    }
}

impl EmailSender for SmtpEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let rendered = render(message)?;

        let to = message
            .to_email
            .parse::<Mailbox>()
            .map_err(|err| EmailError::Invalid(format!("bad recipient address: {err}")))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(rendered.subject)
            .header(ContentType::TEXT_HTML)
            .body(rendered.html)
            .map_err(|err| EmailError::Invalid(err.to_string()))?;

        self.transport
            .send(&email)
            .map(|_| ())
            .map_err(classify_smtp_error)
    }
}

// 535-class replies mean the relay rejected our credentials; everything else
// stays a generic send failure.
fn classify_smtp_error(err: lettre::transport::smtp::Error) -> EmailError {
    let text = err.to_string();
    if err.is_permanent() && (text.contains("535") || text.to_lowercase().contains("auth")) {
        EmailError::Auth(text)
    } else {
        EmailError::Send(text)
    }
}

pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Render a queued message into a subject and HTML body.
///
/// # Errors
///
/// Returns [`EmailError::Invalid`] for unknown templates or payloads missing
/// the link field the template embeds.
pub fn render(message: &EmailMessage) -> Result<RenderedEmail, EmailError> {
    let payload: serde_json::Value = serde_json::from_str(&message.payload_json)
        .map_err(|err| EmailError::Invalid(format!("bad payload json: {err}")))?;

    match message.template.as_str() {
        TEMPLATE_CONFIRM_EMAIL => {
            let link = payload_str(&payload, "confirm_url")?;
            Ok(RenderedEmail {
                subject: "Confirm your email".to_string(),
                html: format!(
                    "<h1>Email Confirmation</h1>\
                     <p>Please click the link below to confirm your email:</p>\
                     <a href=\"{link}\">{link}</a>"
                ),
            })
        }
        TEMPLATE_RESET_PASSWORD => {
            let link = payload_str(&payload, "reset_url")?;
            Ok(RenderedEmail {
                subject: "Reset Password Request".to_string(),
                html: format!(
                    "<h1>Password Reset</h1>\
                     <p>You requested a password reset. Please click the link below to \
                     verify your email and set a new password:</p>\
                     <a href=\"{link}\">Reset Password</a>\
                     <p>If you did not request this, please ignore this email.</p>\
                     <p>This link will expire in 1 hour.</p>"
                ),
            })
        }
        other => Err(EmailError::Invalid(format!("unknown template: {other}"))),
    }
}

fn payload_str<'a>(payload: &'a serde_json::Value, key: &str) -> Result<&'a str, EmailError> {
    payload
        .get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| EmailError::Invalid(format!("payload missing {key}")))
}

#[must_use]
pub fn build_confirmation_url(server_url: &str, token: &str) -> String {
    let base = server_url.trim_end_matches('/');
    format!("{base}/api/auth/confirm-email?token={token}")
}

#[must_use]
pub fn build_reset_url(client_url: &str, token: &str) -> String {
    let base = client_url.trim_end_matches('/');
    format!("{base}/reset-password?token={token}")
}

/// Enqueue a message inside the caller's transaction.
///
/// # Errors
///
/// Returns an error if the outbox insert fails.
pub async fn enqueue(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    to_email: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let payload_text = serde_json::to_string(payload).context("failed to serialize email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;

    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let batch_size = if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        };
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            poll_interval,
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that polls and processes the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            let batch_result = process_outbox_batch(&pool, sender.as_ref(), &config).await;
            if let Err(err) = batch_result {
                error!("email outbox batch failed: {err}");
            }

            sleep(poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // Grab a locked batch so multiple workers can run without double-sending.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(0))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load email outbox batch")?;

    if rows.is_empty() {
        // Commit even on empty to release locks and keep poll loop consistent.
        tx.commit()
            .await
            .context("failed to commit empty outbox batch")?;
        return Ok(0);
    }

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts).unwrap_or(0);
        let message = EmailMessage {
            to_email: row.get("to_email"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };

        let send_result = sender.send(&message);
        update_outbox_status(&mut tx, id, attempts, send_result, config).await?;
    }

    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;

    Ok(row_count)
}

async fn update_outbox_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    send_result: Result<(), EmailError>,
    config: &EmailWorkerConfig,
) -> Result<()> {
    let next_attempt = attempts.saturating_add(1);
    let next_attempts_i32 = i32::try_from(next_attempt).unwrap_or(i32::MAX);
    match send_result {
        Ok(()) => {
            let query = r"
                UPDATE email_outbox
                SET status = 'sent',
                    attempts = $2,
                    last_error = NULL,
                    sent_at = NOW(),
                    next_attempt_at = NOW()
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(next_attempts_i32)
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to update outbox status to sent")?;
        }
        Err(err) => {
            let max_attempts = config.max_attempts();
            if next_attempt >= max_attempts {
                let query = r"
                    UPDATE email_outbox
                    SET status = 'failed',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW()
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox status to failed")?;
            } else {
                let delay =
                    backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let query = r"
                    UPDATE email_outbox
                    SET status = 'pending',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .bind(delay_ms)
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox retry schedule")?;
            }
        }
    }

    Ok(())
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let capped = raw_backoff(attempt, base, max);
    jitter_delay(capped)
}

fn raw_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    if delay > max { max } else { delay }
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(template: &str, payload: serde_json::Value) -> EmailMessage {
        EmailMessage {
            to_email: "alice@example.com".to_string(),
            template: template.to_string(),
            payload_json: payload.to_string(),
        }
    }

    #[test]
    fn confirmation_url_embeds_token() {
        let url = build_confirmation_url("http://localhost:5000/", "abc123");
        assert_eq!(url, "http://localhost:5000/api/auth/confirm-email?token=abc123");
    }

    #[test]
    fn reset_url_embeds_token() {
        let url = build_reset_url("http://localhost:5173", "abc123");
        assert_eq!(url, "http://localhost:5173/reset-password?token=abc123");
    }

    #[test]
    fn render_confirmation_template() -> Result<(), EmailError> {
        let rendered = render(&message(
            TEMPLATE_CONFIRM_EMAIL,
            serde_json::json!({"username": "alice", "confirm_url": "http://s/confirm?token=t"}),
        ))?;

        assert_eq!(rendered.subject, "Confirm your email");
        assert!(rendered.html.contains("http://s/confirm?token=t"));
        Ok(())
    }

    #[test]
    fn render_reset_template() -> Result<(), EmailError> {
        let rendered = render(&message(
            TEMPLATE_RESET_PASSWORD,
            serde_json::json!({"reset_url": "http://c/reset-password?token=t"}),
        ))?;

        assert_eq!(rendered.subject, "Reset Password Request");
        assert!(rendered.html.contains("http://c/reset-password?token=t"));
        assert!(rendered.html.contains("expire in 1 hour"));
        Ok(())
    }

    #[test]
    fn render_rejects_unknown_template() {
        let result = render(&message("newsletter", serde_json::json!({})));
        assert!(matches!(result, Err(EmailError::Invalid(_))));
    }

    #[test]
    fn render_rejects_missing_link() {
        let result = render(&message(TEMPLATE_CONFIRM_EMAIL, serde_json::json!({})));
        assert!(matches!(result, Err(EmailError::Invalid(_))));
    }

    #[test]
    fn log_sender_accepts_rendered_message() {
        let sender = LogEmailSender;
        let result = sender.send(&message(
            TEMPLATE_RESET_PASSWORD,
            serde_json::json!({"reset_url": "http://c/reset-password?token=t"}),
        ));
        assert!(result.is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        assert_eq!(raw_backoff(1, base, max), Duration::from_secs(5));
        assert_eq!(raw_backoff(2, base, max), Duration::from_secs(10));
        assert_eq!(raw_backoff(4, base, max), Duration::from_secs(40));
        assert_eq!(raw_backoff(10, base, max), max);
        assert_eq!(raw_backoff(u32::MAX, base, max), max);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_millis(1000);
        for _ in 0..32 {
            let jittered = jitter_delay(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn normalize_fixes_degenerate_config() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();

        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.backoff_max(), config.backoff_base());
    }
}
