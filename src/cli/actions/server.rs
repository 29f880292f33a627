use crate::api;
use anyhow::Result;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub jwt_secret: SecretString,
    pub client_url: String,
    pub server_url: String,
    pub session_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
    pub email_user: Option<String>,
    pub email_pass: Option<SecretString>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
    pub email_outbox_backoff_base_seconds: u64,
    pub email_outbox_backoff_max_seconds: u64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the SMTP transport cannot be built or the server
/// fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth_config =
        api::handlers::auth::AuthConfig::new(args.client_url, args.server_url, args.jwt_secret)
            .with_session_ttl_seconds(args.session_ttl_seconds)
            .with_reset_token_ttl_seconds(args.reset_token_ttl_seconds);

    let email_config = api::email::EmailWorkerConfig::new()
        .with_poll_interval_seconds(args.email_outbox_poll_seconds)
        .with_batch_size(args.email_outbox_batch_size)
        .with_max_attempts(args.email_outbox_max_attempts)
        .with_backoff_base_seconds(args.email_outbox_backoff_base_seconds)
        .with_backoff_max_seconds(args.email_outbox_backoff_max_seconds);

    let sender: Arc<dyn api::email::EmailSender> = match (&args.email_user, &args.email_pass) {
        (Some(user), Some(pass)) => Arc::new(api::email::SmtpEmailSender::new(
            &args.smtp_host,
            args.smtp_port,
            user,
            pass,
        )?),
        _ => {
            info!("EMAIL_USER/EMAIL_PASS not set, logging emails instead of sending");
            Arc::new(api::email::LogEmailSender)
        }
    };

    api::new(args.port, args.dsn, auth_config, email_config, sender).await
}
