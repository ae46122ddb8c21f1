//! Direct Postgres data source for the portal app store.
//!
//! Reads the Grove portal database: one query joining portal applications
//! with their accounts, excluding soft-deleted rows on both sides.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use super::{AccountId, PlanType, PortalApp, PortalAppId, PortalAppSource, SourceError};

const SELECT_PORTAL_APPS: &str = r"
SELECT
    pa.portal_application_id AS id,
    pa.portal_account_id AS account_id,
    pa.secret_key,
    pa.secret_key_required,
    acc.portal_plan_type AS plan,
    pa.portal_application_user_limit AS monthly_user_limit
FROM portal_applications pa
JOIN portal_accounts acc ON acc.portal_account_id = pa.portal_account_id
WHERE pa.deleted_at IS NULL
  AND acc.deleted_at IS NULL
";

/// A row from the portal applications query. Nullable columns are kept as
/// options and normalized in [`PortalAppRow::into_portal_app`].
#[derive(Debug, FromRow)]
struct PortalAppRow {
    id: String,
    account_id: Option<String>,
    secret_key: Option<String>,
    secret_key_required: Option<bool>,
    plan: Option<String>,
    monthly_user_limit: Option<i32>,
}

impl PortalAppRow {
    fn into_portal_app(self) -> PortalApp {
        PortalApp::from_source_row(
            PortalAppId::from(self.id),
            AccountId::from(self.account_id.unwrap_or_default()),
            PlanType::from_db(self.plan.as_deref().unwrap_or_default()),
            self.secret_key,
            self.secret_key_required.unwrap_or(false),
            i64::from(self.monthly_user_limit.unwrap_or(0)),
        )
    }
}

/// Portal app source backed by the portal Postgres database.
pub struct PostgresPortalAppSource {
    pool: PgPool,
}

impl PostgresPortalAppSource {
    /// Connect to the database and verify the connection immediately.
    pub async fn connect(connection_string: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PortalAppSource for PostgresPortalAppSource {
    async fn snapshot_portal_apps(&self) -> Result<HashMap<PortalAppId, PortalApp>, SourceError> {
        let rows: Vec<PortalAppRow> = sqlx::query_as(SELECT_PORTAL_APPS)
            .fetch_all(&self.pool)
            .await?;

        tracing::debug!(num_rows = rows.len(), "fetched portal applications");

        Ok(collect_portal_apps(rows.into_iter().map(PortalAppRow::into_portal_app)))
    }
}

/// Build the snapshot map, dropping rows without an account.
///
/// An app row with no owning account cannot be rate limited or attributed
/// and would violate the snapshot invariants; it is skipped loudly.
pub(crate) fn collect_portal_apps(
    apps: impl Iterator<Item = PortalApp>,
) -> HashMap<PortalAppId, PortalApp> {
    let mut map = HashMap::new();
    for app in apps {
        if app.account_id.as_str().is_empty() {
            tracing::warn!(
                portal_app_id = %app.id,
                "portal app has no account ID, skipping"
            );
            continue;
        }
        map.insert(app.id.clone(), app);
    }
    map
}
