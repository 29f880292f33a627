//! # Libertas (Account & Authentication API)
//!
//! `libertas` is the account service behind the Libertas Alpha site. It owns
//! the credential lifecycle: registration with email confirmation, login
//! issuing a short-lived bearer token, and the forgot/reset password flow.
//! Each account also receives a freshly generated Ethereum-style wallet at
//! registration.
//!
//! ## Credential Lifecycle
//!
//! - **Register** inserts the account (`is_confirmed = false`), relying on
//!   the database's unique constraints for username/email conflicts, and
//!   enqueues the confirmation email in a transactional outbox so the row
//!   and the email commit or fail together.
//! - **Confirm** consumes the confirmation token and flips the account to
//!   confirmed; confirmation is terminal, there is no path back.
//! - **Login** rejects unconfirmed accounts before checking the password and
//!   otherwise answers with a single generic "Invalid credentials" message.
//! - **Forgot/Reset** stores a one-hour reset token and always answers with
//!   the same message whether or not the account exists.
//!
//! ## Token Expiry Asymmetry
//!
//! Confirmation tokens never expire; reset tokens expire one hour after
//! issuance. The asymmetry is deliberate and preserved: a confirmation link
//! stays valid until used, while a reset link proves *recent* control of the
//! mailbox.
//!
//! ## Wallet Custody
//!
//! The wallet private key is returned exactly once in the registration
//! response and never persisted. The server stores only the derived address.

pub mod api;
pub mod cli;
pub mod client;
pub mod wallet;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
