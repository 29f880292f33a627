use anyhow::{Context, Result};
use clap::{Arg, Command};
use secrecy::SecretString;

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_CLIENT_URL: &str = "client-url";
pub const ARG_SERVER_URL: &str = "server-url";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_RESET_TOKEN_TTL_SECONDS: &str = "reset-token-ttl-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("Secret used to sign session tokens")
                .env("JWT_SECRET")
                .required(true),
        )
        .arg(
            Arg::new(ARG_CLIENT_URL)
                .long(ARG_CLIENT_URL)
                .help("Frontend base URL, used for reset links and the confirm redirect")
                .env("CLIENT_URL")
                .default_value("http://localhost:5173"),
        )
        .arg(
            Arg::new(ARG_SERVER_URL)
                .long(ARG_SERVER_URL)
                .help("Public base URL of this server, embedded in confirmation links")
                .env("SERVER_URL")
                .default_value("http://localhost:5000"),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session token TTL in seconds")
                .env("SESSION_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_RESET_TOKEN_TTL_SECONDS)
                .long(ARG_RESET_TOKEN_TTL_SECONDS)
                .help("Password reset token TTL in seconds")
                .env("RESET_TOKEN_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
}

pub struct Options {
    pub jwt_secret: SecretString,
    pub client_url: String,
    pub server_url: String,
    pub session_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
}

impl Options {
    /// Extract auth options from parsed matches.
    ///
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let jwt_secret = matches
            .get_one::<String>(ARG_JWT_SECRET)
            .cloned()
            .context("missing required argument: --jwt-secret")?;

        let client_url = matches
            .get_one::<String>(ARG_CLIENT_URL)
            .cloned()
            .context("missing required argument: --client-url")?;

        let server_url = matches
            .get_one::<String>(ARG_SERVER_URL)
            .cloned()
            .context("missing required argument: --server-url")?;

        let session_ttl_seconds = matches
            .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
            .copied()
            .context("missing required argument: --session-ttl-seconds")?;

        let reset_token_ttl_seconds = matches
            .get_one::<i64>(ARG_RESET_TOKEN_TTL_SECONDS)
            .copied()
            .context("missing required argument: --reset-token-ttl-seconds")?;

        Ok(Self {
            jwt_secret: SecretString::from(jwt_secret),
            client_url,
            server_url,
            session_ttl_seconds,
            reset_token_ttl_seconds,
        })
    }
}
