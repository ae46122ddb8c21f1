//! In-memory store of rate-limited accounts.
//!
//! Rebuilt periodically from the usage warehouse: accounts at or above the
//! free-tier threshold are checked against their plan's monthly limit and
//! the resulting set is published whole. Rate limiting is a month-bounded
//! signal, so serving a stale set while the warehouse is down is acceptable;
//! the proxy's token-bucket filter remains the real-time enforcer.

mod warehouse;

pub use warehouse::{HttpUsageWarehouse, UsageWarehouse, WarehouseError};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::metrics::{AccountUsageLabels, AuthMetrics};
use crate::store::{AccountId, PlanType, PortalAppStore, RateLimit};

/// Monthly relay cap for `PLAN_FREE` accounts. Accounts at this usage are
/// the candidates the warehouse returns; only usage strictly above a limit
/// rate-limits an account.
pub const FREE_MONTHLY_RELAYS: i64 = 1_000_000;

/// The monthly relay limit that applies to an account, if any.
///
/// - `PLAN_FREE`: the global free-tier cap (any stored override is ignored).
/// - `PLAN_UNLIMITED` with a positive override: that override.
/// - `PLAN_UNLIMITED` without an override, or no rate limit at all: none.
/// - Unknown plans: none (the caller logs a warning).
pub fn monthly_limit(plan_type: &PlanType, rate_limit: Option<&RateLimit>) -> Option<i64> {
    rate_limit?;

    match plan_type {
        PlanType::Free => Some(FREE_MONTHLY_RELAYS),
        PlanType::Unlimited => match rate_limit {
            Some(limit) if limit.monthly_user_limit > 0 => Some(limit.monthly_user_limit),
            _ => None,
        },
        PlanType::Other(_) => None,
    }
}

/// Whether the given usage exceeds the limit. Strictly greater than:
/// exactly-at-limit is still allowed.
pub fn should_limit(limit: Option<i64>, usage: i64) -> bool {
    match limit {
        Some(limit) => usage > limit,
        None => false,
    }
}

/// In-memory set of currently rate-limited accounts.
pub struct RateLimitStore {
    warehouse: Arc<dyn UsageWarehouse>,
    portal_apps: Arc<PortalAppStore>,
    limited: RwLock<Arc<HashSet<AccountId>>>,
    fetch_timeout: Duration,
    metrics: Arc<AuthMetrics>,
}

impl RateLimitStore {
    /// Create the store and run one synchronous refresh.
    ///
    /// Unlike the portal app store, a failed initial refresh is tolerated:
    /// the store starts empty (nothing rate limited) and recovers on the
    /// next successful refresh.
    pub async fn new(
        warehouse: Arc<dyn UsageWarehouse>,
        portal_apps: Arc<PortalAppStore>,
        fetch_timeout: Duration,
        metrics: Arc<AuthMetrics>,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            warehouse,
            portal_apps,
            limited: RwLock::new(Arc::new(HashSet::new())),
            fetch_timeout,
            metrics,
        });

        store.refresh_once().await;
        store
    }

    /// Whether the account is currently over its monthly limit.
    pub fn is_rate_limited(&self, account_id: &AccountId) -> bool {
        self.limited.read().contains(account_id)
    }

    /// Run one refresh cycle.
    ///
    /// A warehouse failure keeps the previously published set, increments
    /// the refresh error counter and never blocks request handling.
    pub async fn refresh_once(&self) {
        let started = Instant::now();

        let result = tokio::time::timeout(
            self.fetch_timeout,
            self.warehouse.month_to_date_usage(FREE_MONTHLY_RELAYS),
        )
        .await
        .map_err(|_| None)
        .and_then(|fetched| fetched.map_err(Some));

        let usage_over_threshold = match result {
            Ok(usage) => usage,
            Err(error) => {
                self.metrics.record_refresh_error("rate_limit", "warehouse");
                match error {
                    Some(error) => tracing::error!(
                        error = %error,
                        "failed to fetch monthly usage, keeping previous rate limited set"
                    ),
                    None => tracing::error!(
                        timeout_secs = self.fetch_timeout.as_secs(),
                        "monthly usage fetch timed out, keeping previous rate limited set"
                    ),
                }
                return;
            }
        };

        // Stale per-account series would otherwise accumulate forever.
        self.metrics.account_usage.clear();

        let mut limited = HashSet::new();
        for (account_id, usage) in &usage_over_threshold {
            // Accounts without a rate-limit rollup entry are not limited.
            let Some(account) = self.portal_apps.account_rate_limit(account_id) else {
                continue;
            };

            let limit = monthly_limit(&account.plan_type, account.rate_limit.as_ref());
            if limit.is_none() {
                if let PlanType::Other(plan) = &account.plan_type {
                    tracing::warn!(
                        account_id = %account_id,
                        plan_type = %plan,
                        "unknown plan type, not rate limiting"
                    );
                }
            }

            self.metrics
                .account_usage
                .get_or_create(&AccountUsageLabels {
                    account_id: account_id.to_string(),
                    plan_type: account.plan_type.as_str().to_string(),
                    rate_limit: limit.unwrap_or(0).to_string(),
                })
                .set(*usage);

            if should_limit(limit, *usage) {
                tracing::debug!(
                    account_id = %account_id,
                    plan_type = %account.plan_type,
                    usage,
                    "account rate limited"
                );
                limited.insert(account_id.clone());
            }
        }

        let limited_count = limited.len();
        *self.limited.write() = Arc::new(limited);

        self.metrics
            .set_store_size("accounts_over_monthly_limit", usage_over_threshold.len());
        self.metrics
            .set_store_size("rate_limited_accounts", limited_count);

        tracing::info!(
            accounts_over_monthly_limit = usage_over_threshold.len(),
            rate_limited_accounts = limited_count,
            duration_ms = started.elapsed().as_millis() as u64,
            "refreshed rate limit store"
        );
    }

    /// Background refresh worker. Exits when the token is cancelled.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "starting rate limit store refresh"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick is immediate; the constructor already refreshed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("rate limit store refresh shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::store::{PortalApp, PortalAppId, PortalAppSource, SourceError};

    struct FakeWarehouse {
        usage: Mutex<HashMap<AccountId, i64>>,
        fail: AtomicBool,
    }

    impl FakeWarehouse {
        fn new(usage: Vec<(&str, i64)>) -> Self {
            Self {
                usage: Mutex::new(
                    usage
                        .into_iter()
                        .map(|(id, count)| (AccountId::from(id), count))
                        .collect(),
                ),
                fail: AtomicBool::new(false),
            }
        }

        fn set_usage(&self, usage: Vec<(&str, i64)>) {
            *self.usage.lock() = usage
                .into_iter()
                .map(|(id, count)| (AccountId::from(id), count))
                .collect();
        }

        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UsageWarehouse for FakeWarehouse {
        async fn month_to_date_usage(
            &self,
            _threshold_relays: i64,
        ) -> Result<HashMap<AccountId, i64>, WarehouseError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WarehouseError::UnexpectedStatus(503));
            }
            Ok(self.usage.lock().clone())
        }
    }

    struct StaticSource(HashMap<PortalAppId, PortalApp>);

    #[async_trait]
    impl PortalAppSource for StaticSource {
        async fn snapshot_portal_apps(
            &self,
        ) -> Result<HashMap<PortalAppId, PortalApp>, SourceError> {
            Ok(self.0.clone())
        }
    }

    fn app(id: &str, account: &str, plan: PlanType, limit: i64) -> PortalApp {
        PortalApp::from_source_row(
            PortalAppId::from(id),
            AccountId::from(account),
            plan,
            None,
            false,
            limit,
        )
    }

    async fn portal_store(apps: Vec<PortalApp>, metrics: Arc<AuthMetrics>) -> Arc<PortalAppStore> {
        let source = Arc::new(StaticSource(
            apps.into_iter().map(|a| (a.id.clone(), a)).collect(),
        ));
        Arc::new(
            PortalAppStore::new(source, Duration::from_secs(5), metrics)
                .await
                .unwrap(),
        )
    }

    #[test]
    fn test_monthly_limit_per_plan() {
        let no_override = RateLimit {
            monthly_user_limit: 0,
        };
        let forty_million = RateLimit {
            monthly_user_limit: 40_000_000,
        };

        assert_eq!(
            monthly_limit(&PlanType::Free, Some(&no_override)),
            Some(FREE_MONTHLY_RELAYS)
        );
        assert_eq!(
            monthly_limit(&PlanType::Unlimited, Some(&forty_million)),
            Some(40_000_000)
        );
        assert_eq!(monthly_limit(&PlanType::Unlimited, Some(&no_override)), None);
        assert_eq!(monthly_limit(&PlanType::Unlimited, None), None);
        assert_eq!(
            monthly_limit(&PlanType::Other("PLAN_ENTERPRISE".to_string()), Some(&no_override)),
            None
        );
    }

    #[test]
    fn test_should_limit_uses_strict_comparison() {
        // Exactly at the limit is still allowed.
        assert!(!should_limit(Some(FREE_MONTHLY_RELAYS), FREE_MONTHLY_RELAYS));
        assert!(should_limit(Some(FREE_MONTHLY_RELAYS), FREE_MONTHLY_RELAYS + 1));
        assert!(!should_limit(Some(FREE_MONTHLY_RELAYS), FREE_MONTHLY_RELAYS - 1));
        assert!(!should_limit(None, i64::MAX));
    }

    #[test]
    fn test_should_limit_is_monotone_in_usage() {
        let limit = Some(5_000_000);
        let mut previously_limited = false;
        for usage in [0, 4_999_999, 5_000_000, 5_000_001, 10_000_000, i64::MAX] {
            let limited = should_limit(limit, usage);
            assert!(
                limited || !previously_limited,
                "should_limit must not flip back to false as usage grows"
            );
            previously_limited = limited;
        }
    }

    #[tokio::test]
    async fn test_refresh_limits_free_account_over_cap() {
        let metrics = Arc::new(AuthMetrics::new());
        let portal = portal_store(
            vec![
                app("app_free", "acct_free", PlanType::Free, 0),
                app("app_paid", "acct_paid", PlanType::Unlimited, 40_000_000),
                app("app_open", "acct_open", PlanType::Unlimited, 0),
            ],
            metrics.clone(),
        )
        .await;

        let warehouse = Arc::new(FakeWarehouse::new(vec![
            ("acct_free", 2_000_000),  // free, over the cap
            ("acct_paid", 10_000_000), // unlimited, under its override
            ("acct_open", 99_000_000), // unlimited, no override
            ("acct_unknown", 5_000_000), // not in the rollup
        ]));

        let store =
            RateLimitStore::new(warehouse, portal, Duration::from_secs(5), metrics).await;

        assert!(store.is_rate_limited(&AccountId::from("acct_free")));
        assert!(!store.is_rate_limited(&AccountId::from("acct_paid")));
        assert!(!store.is_rate_limited(&AccountId::from("acct_open")));
        assert!(!store.is_rate_limited(&AccountId::from("acct_unknown")));
    }

    #[tokio::test]
    async fn test_refresh_limits_unlimited_account_over_override() {
        let metrics = Arc::new(AuthMetrics::new());
        let portal = portal_store(
            vec![app("app_paid", "acct_paid", PlanType::Unlimited, 5_000_000)],
            metrics.clone(),
        )
        .await;

        let warehouse = Arc::new(FakeWarehouse::new(vec![("acct_paid", 5_000_001)]));
        let store =
            RateLimitStore::new(warehouse, portal, Duration::from_secs(5), metrics).await;

        assert!(store.is_rate_limited(&AccountId::from("acct_paid")));
    }

    #[tokio::test]
    async fn test_exactly_at_limit_is_not_limited() {
        let metrics = Arc::new(AuthMetrics::new());
        let portal = portal_store(
            vec![app("app_free", "acct_free", PlanType::Free, 0)],
            metrics.clone(),
        )
        .await;

        let warehouse = Arc::new(FakeWarehouse::new(vec![("acct_free", FREE_MONTHLY_RELAYS)]));
        let store =
            RateLimitStore::new(warehouse, portal, Duration::from_secs(5), metrics).await;

        assert!(!store.is_rate_limited(&AccountId::from("acct_free")));
    }

    #[tokio::test]
    async fn test_failed_initial_refresh_is_tolerated() {
        let metrics = Arc::new(AuthMetrics::new());
        let portal = portal_store(
            vec![app("app_free", "acct_free", PlanType::Free, 0)],
            metrics.clone(),
        )
        .await;

        let warehouse = Arc::new(FakeWarehouse::new(vec![("acct_free", 2_000_000)]));
        warehouse.set_fail(true);

        let store = RateLimitStore::new(
            warehouse.clone(),
            portal,
            Duration::from_secs(5),
            metrics.clone(),
        )
        .await;

        // Usable, just empty; the failure is counted.
        assert!(!store.is_rate_limited(&AccountId::from("acct_free")));
        assert!(metrics
            .encode()
            .unwrap()
            .contains("refresh_errors_total{store=\"rate_limit\",kind=\"warehouse\"} 1"));

        // Recovers on the next successful refresh.
        warehouse.set_fail(false);
        store.refresh_once().await;
        assert!(store.is_rate_limited(&AccountId::from("acct_free")));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_set() {
        let metrics = Arc::new(AuthMetrics::new());
        let portal = portal_store(
            vec![app("app_free", "acct_free", PlanType::Free, 0)],
            metrics.clone(),
        )
        .await;

        let warehouse = Arc::new(FakeWarehouse::new(vec![("acct_free", 2_000_000)]));
        let store = RateLimitStore::new(
            warehouse.clone(),
            portal,
            Duration::from_secs(5),
            metrics.clone(),
        )
        .await;
        assert!(store.is_rate_limited(&AccountId::from("acct_free")));

        warehouse.set_fail(true);
        store.refresh_once().await;

        assert!(store.is_rate_limited(&AccountId::from("acct_free")));
        assert!(metrics
            .encode()
            .unwrap()
            .contains("refresh_errors_total{store=\"rate_limit\",kind=\"warehouse\"} 1"));
    }

    #[tokio::test]
    async fn test_account_usage_series_cleared_between_refreshes() {
        let metrics = Arc::new(AuthMetrics::new());
        let portal = portal_store(
            vec![
                app("app_a", "acct_a", PlanType::Free, 0),
                app("app_b", "acct_b", PlanType::Free, 0),
            ],
            metrics.clone(),
        )
        .await;

        let warehouse = Arc::new(FakeWarehouse::new(vec![("acct_a", 2_000_000)]));
        let store = RateLimitStore::new(
            warehouse.clone(),
            portal,
            Duration::from_secs(5),
            metrics.clone(),
        )
        .await;
        assert!(metrics.encode().unwrap().contains("acct_a"));

        // acct_a drops below the threshold; its gauge series must go away.
        warehouse.set_usage(vec![("acct_b", 3_000_000)]);
        store.refresh_once().await;

        let output = metrics.encode().unwrap();
        assert!(
            !output.contains("account_usage{account_id=\"acct_a\""),
            "stale account_usage series must be cleared"
        );
        assert!(output.contains("account_usage{account_id=\"acct_b\""));
    }

    #[tokio::test]
    async fn test_store_size_gauges_updated() {
        let metrics = Arc::new(AuthMetrics::new());
        let portal = portal_store(
            vec![
                app("app_free", "acct_free", PlanType::Free, 0),
                app("app_open", "acct_open", PlanType::Unlimited, 0),
            ],
            metrics.clone(),
        )
        .await;

        let warehouse = Arc::new(FakeWarehouse::new(vec![
            ("acct_free", 2_000_000),
            ("acct_open", 99_000_000),
        ]));
        let _store =
            RateLimitStore::new(warehouse, portal, Duration::from_secs(5), metrics.clone()).await;

        let output = metrics.encode().unwrap();
        assert!(output.contains("store_size{store_type=\"accounts_over_monthly_limit\"} 2"));
        assert!(output.contains("store_size{store_type=\"rate_limited_accounts\"} 1"));
    }
}
