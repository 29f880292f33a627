use anyhow::{Context, Result};
use clap::{Arg, Command};
use secrecy::SecretString;

pub const ARG_EMAIL_USER: &str = "email-user";
pub const ARG_EMAIL_PASS: &str = "email-pass";
pub const ARG_SMTP_HOST: &str = "smtp-host";
pub const ARG_SMTP_PORT: &str = "smtp-port";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = command
        .arg(
            Arg::new(ARG_EMAIL_USER)
                .long(ARG_EMAIL_USER)
                .help("SMTP account used as the sender; emails are logged instead when unset")
                .env("EMAIL_USER"),
        )
        .arg(
            Arg::new(ARG_EMAIL_PASS)
                .long(ARG_EMAIL_PASS)
                .help("SMTP app password")
                .env("EMAIL_PASS"),
        )
        .arg(
            Arg::new(ARG_SMTP_HOST)
                .long(ARG_SMTP_HOST)
                .help("SMTP relay host")
                .env("SMTP_HOST")
                .default_value("smtp.gmail.com"),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP relay port")
                .env("SMTP_PORT")
                .default_value("587")
                .value_parser(clap::value_parser!(u16)),
        );
    with_outbox_args(command)
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("email-outbox-poll-seconds")
                .long("email-outbox-poll-seconds")
                .help("Email outbox poll interval in seconds")
                .env("EMAIL_OUTBOX_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-batch-size")
                .long("email-outbox-batch-size")
                .help("Email outbox batch size per poll")
                .env("EMAIL_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("email-outbox-max-attempts")
                .long("email-outbox-max-attempts")
                .help("Max attempts before marking an email as failed")
                .env("EMAIL_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("email-outbox-backoff-base-seconds")
                .long("email-outbox-backoff-base-seconds")
                .help("Base delay for email outbox retry backoff")
                .env("EMAIL_OUTBOX_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-backoff-max-seconds")
                .long("email-outbox-backoff-max-seconds")
                .help("Max delay for email outbox retry backoff")
                .env("EMAIL_OUTBOX_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

pub struct OutboxOptions {
    pub poll_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

pub struct Options {
    pub email_user: Option<String>,
    pub email_pass: Option<SecretString>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub outbox: OutboxOptions,
}

impl Options {
    /// Extract email options from parsed matches.
    ///
    /// # Errors
    /// Returns an error if a defaulted argument is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let email_user = matches.get_one::<String>(ARG_EMAIL_USER).cloned();
        let email_pass = matches
            .get_one::<String>(ARG_EMAIL_PASS)
            .cloned()
            .map(SecretString::from);

        let smtp_host = matches
            .get_one::<String>(ARG_SMTP_HOST)
            .cloned()
            .context("missing required argument: --smtp-host")?;

        let smtp_port = matches
            .get_one::<u16>(ARG_SMTP_PORT)
            .copied()
            .context("missing required argument: --smtp-port")?;

        let outbox = OutboxOptions {
            poll_seconds: matches
                .get_one::<u64>("email-outbox-poll-seconds")
                .copied()
                .context("missing required argument: --email-outbox-poll-seconds")?,
            batch_size: matches
                .get_one::<usize>("email-outbox-batch-size")
                .copied()
                .context("missing required argument: --email-outbox-batch-size")?,
            max_attempts: matches
                .get_one::<u32>("email-outbox-max-attempts")
                .copied()
                .context("missing required argument: --email-outbox-max-attempts")?,
            backoff_base_seconds: matches
                .get_one::<u64>("email-outbox-backoff-base-seconds")
                .copied()
                .context("missing required argument: --email-outbox-backoff-base-seconds")?,
            backoff_max_seconds: matches
                .get_one::<u64>("email-outbox-backoff-max-seconds")
                .copied()
                .context("missing required argument: --email-outbox-backoff-max-seconds")?,
        };

        Ok(Self {
            email_user,
            email_pass,
            smtp_host,
            smtp_port,
            outbox,
        })
    }
}
