use std::collections::HashMap;

use async_trait::async_trait;

use super::{PortalApp, PortalAppId};

/// Errors raised by a portal app data source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("failed to generate auth token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// A source of truth for portal apps.
///
/// Satisfied by [`PostgresPortalAppSource`](super::postgres::PostgresPortalAppSource)
/// and [`PostgrestPortalAppSource`](super::postgrest::PostgrestPortalAppSource).
#[async_trait]
pub trait PortalAppSource: Send + Sync {
    /// Load the entire set of non-deleted portal apps as one atomic read.
    ///
    /// Partial snapshots are undefined behavior; a source that cannot
    /// produce the full set must fail instead.
    async fn snapshot_portal_apps(&self) -> Result<HashMap<PortalAppId, PortalApp>, SourceError>;
}
