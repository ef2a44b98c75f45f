//! Relay seam for remote replication
//!
//! A relay delivers one statement to one remote instance. The only bundled
//! implementation goes through GitHub: [`github::GithubAppIssuer`] mints the
//! installation token, [`github::RepositoryDispatchRelay`] posts a
//! `repository_dispatch` event whose workflow applies the statement.

pub mod github;

use async_trait::async_trait;

use crate::error::DataResult;
use crate::types::{InstanceId, Param};

pub use github::{DispatchTarget, GithubAppIssuer, RepositoryDispatchRelay, DEFAULT_API_BASE};

/// Delivers a statement to a remote instance
#[async_trait]
pub trait Relay: Send + Sync {
    /// Errors are [`DataError::Replication`](crate::DataError::Replication) for `target`
    async fn relay_statement(
        &self,
        token: &str,
        statement: &str,
        params: &[Param],
        target: &InstanceId,
    ) -> DataResult<()>;
}

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Cuts an error response so remote API details stay out of logs
pub(crate) fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
