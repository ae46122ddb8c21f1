//! In-memory portal app store.
//!
//! Holds the latest snapshot of portal applications, rebuilt periodically
//! from the data source. Readers see an immutable snapshot published by a
//! single `Arc` swap; the read lock is held only long enough to clone the
//! `Arc`, so lookups never block on a refresh in progress.

mod source;

pub mod postgres;
pub mod postgrest;

pub use source::{PortalAppSource, SourceError};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::metrics::AuthMetrics;

/// Unique identifier of a portal application. Opaque and case-sensitive.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortalAppId(String);

/// Unique identifier of the account owning one or more portal apps.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(String);

macro_rules! opaque_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(PortalAppId);
opaque_id!(AccountId);

/// Billing plan of the account a portal app belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanType {
    Free,
    Unlimited,
    /// A plan this service does not know yet; never rate limited.
    Other(String),
}

impl PlanType {
    pub fn from_db(value: &str) -> Self {
        match value {
            "PLAN_FREE" => Self::Free,
            "PLAN_UNLIMITED" => Self::Unlimited,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Free => "PLAN_FREE",
            Self::Unlimited => "PLAN_UNLIMITED",
            Self::Other(value) => value,
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization required to use a portal app.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Auth {
    /// Public app: no credentials required.
    NoAuth,
    /// A single static API key. The key is always non-empty.
    ApiKey { key: String },
}

/// Rate limiting settings for a portal app.
///
/// Absent entirely (`Option::None` on [`PortalApp`]) when the app is not
/// rate limited. `monthly_user_limit == 0` means "no per-account override";
/// the global free-tier cap applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub monthly_user_limit: i64,
}

/// A single portal application and its authorization data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortalApp {
    pub id: PortalAppId,
    pub account_id: AccountId,
    pub plan_type: PlanType,
    pub auth: Auth,
    pub rate_limit: Option<RateLimit>,
}

impl PortalApp {
    /// Build a portal app from raw source fields, normalizing the auth and
    /// rate-limit variants:
    ///
    /// - a required secret key that is empty degrades to [`Auth::NoAuth`],
    ///   so [`Auth::ApiKey`] always carries a non-empty key;
    /// - `PLAN_FREE` is always rate limited with no override (the global
    ///   free-tier cap applies);
    /// - any other plan is rate limited only with an explicit positive
    ///   monthly limit.
    pub fn from_source_row(
        id: PortalAppId,
        account_id: AccountId,
        plan_type: PlanType,
        secret_key: Option<String>,
        secret_key_required: bool,
        monthly_user_limit: i64,
    ) -> Self {
        let auth = match secret_key {
            Some(key) if secret_key_required && !key.is_empty() => Auth::ApiKey { key },
            _ => Auth::NoAuth,
        };

        let rate_limit = if plan_type == PlanType::Free {
            Some(RateLimit {
                monthly_user_limit: 0,
            })
        } else if monthly_user_limit > 0 {
            Some(RateLimit { monthly_user_limit })
        } else {
            None
        };

        Self {
            id,
            account_id,
            plan_type,
            auth,
            rate_limit,
        }
    }
}

/// Account-level rate limit rollup derived from a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRateLimit {
    pub plan_type: PlanType,
    pub rate_limit: Option<RateLimit>,
}

/// An immutable point-in-time view of all portal apps.
///
/// Published whole; never mutated after publication.
#[derive(Debug, Default)]
pub struct PortalAppSnapshot {
    apps: HashMap<PortalAppId, PortalApp>,
    account_rate_limits: HashMap<AccountId, AccountRateLimit>,
}

impl PortalAppSnapshot {
    /// Build a snapshot and its account rollup from the full app set.
    ///
    /// The rollup takes the first rate-limited entry observed per account.
    /// Portal app IDs are sorted first so the winner is deterministic for a
    /// given input, regardless of map iteration order.
    pub fn new(apps: HashMap<PortalAppId, PortalApp>) -> Self {
        let mut ids: Vec<&PortalAppId> = apps.keys().collect();
        ids.sort();

        let mut account_rate_limits = HashMap::new();
        for id in ids {
            let app = &apps[id];
            if app.rate_limit.is_none() {
                continue;
            }
            account_rate_limits
                .entry(app.account_id.clone())
                .or_insert_with(|| AccountRateLimit {
                    plan_type: app.plan_type.clone(),
                    rate_limit: app.rate_limit.clone(),
                });
        }

        Self {
            apps,
            account_rate_limits,
        }
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    pub fn account_count(&self) -> usize {
        self.account_rate_limits.len()
    }
}

/// In-memory store of portal apps, refreshed in the background.
pub struct PortalAppStore {
    source: Arc<dyn PortalAppSource>,
    snapshot: RwLock<Arc<PortalAppSnapshot>>,
    fetch_timeout: Duration,
    metrics: Arc<AuthMetrics>,
}

impl PortalAppStore {
    /// Create the store and perform the initial synchronous snapshot fetch.
    ///
    /// A failed initial fetch is fatal: the service must not start without
    /// an authoritative view of the portal apps.
    pub async fn new(
        source: Arc<dyn PortalAppSource>,
        fetch_timeout: Duration,
        metrics: Arc<AuthMetrics>,
    ) -> Result<Self, SourceError> {
        let store = Self {
            source,
            snapshot: RwLock::new(Arc::new(PortalAppSnapshot::default())),
            fetch_timeout,
            metrics,
        };

        tracing::info!("fetching initial portal app snapshot");
        let apps = store.source.snapshot_portal_apps().await?;
        store.publish(PortalAppSnapshot::new(apps));

        Ok(store)
    }

    /// Look up a portal app by ID.
    ///
    /// Clones the app out of the snapshot: callers hold no references into
    /// a snapshot that the next refresh may release.
    pub fn lookup(&self, id: &PortalAppId) -> Option<PortalApp> {
        self.current().apps.get(id).cloned()
    }

    /// Account-level rate limit rollup lookup.
    pub fn account_rate_limit(&self, account_id: &AccountId) -> Option<AccountRateLimit> {
        self.current().account_rate_limits.get(account_id).cloned()
    }

    /// The currently published snapshot.
    fn current(&self) -> Arc<PortalAppSnapshot> {
        self.snapshot.read().clone()
    }

    /// Publish a freshly built snapshot and update the size gauges.
    fn publish(&self, snapshot: PortalAppSnapshot) {
        let app_count = snapshot.app_count();
        let account_count = snapshot.account_count();

        *self.snapshot.write() = Arc::new(snapshot);

        self.metrics.set_store_size("portal_apps", app_count);
        self.metrics.set_store_size("accounts", account_count);
    }

    /// Run one refresh cycle.
    ///
    /// Failures (source errors and deadline expiry alike) keep the previous
    /// snapshot and are counted; they never propagate to callers.
    pub async fn refresh_once(&self) {
        let started = Instant::now();

        let result = tokio::time::timeout(self.fetch_timeout, self.source.snapshot_portal_apps())
            .await
            .map_err(|_| None)
            .and_then(|fetched| fetched.map_err(Some));

        match result {
            Ok(apps) => {
                let snapshot = PortalAppSnapshot::new(apps);
                let app_count = snapshot.app_count();
                let account_count = snapshot.account_count();
                self.publish(snapshot);

                tracing::info!(
                    portal_apps = app_count,
                    accounts = account_count,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "refreshed portal app store"
                );
            }
            Err(error) => {
                self.metrics.record_refresh_error("portal_app", "source");
                match error {
                    Some(error) => tracing::error!(
                        error = %error,
                        "failed to refresh portal apps, keeping previous snapshot"
                    ),
                    None => tracing::error!(
                        timeout_secs = self.fetch_timeout.as_secs(),
                        "portal app snapshot fetch timed out, keeping previous snapshot"
                    ),
                }
            }
        }
    }

    /// Background refresh worker. Exits when the token is cancelled.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "starting portal app store refresh"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the bootstrap fetch already
        // populated the store.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("portal app store refresh shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh_once().await;
                }
            }
        }
    }
}
