//! Prometheus metrics for the authorization hot path and the stores.
//!
//! All families live in one shared registry so the binary can expose them
//! from a single `/metrics` endpoint. Metric operations on the request path
//! are lock-free beyond the label binding.

use std::sync::Mutex;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Labels for `auth_requests_total`.
///
/// Labels not yet known at the point of failure (e.g. `account_id` before
/// the portal app is resolved) are empty strings, never absent.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthRequestLabels {
    pub portal_app_id: String,
    pub account_id: String,
    pub status: String,
    pub error_type: String,
}

/// Labels for `auth_request_duration_seconds`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthDurationLabels {
    pub portal_app_id: String,
    pub status: String,
}

/// Labels for `rate_limit_checks_total`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RateLimitCheckLabels {
    pub account_id: String,
    pub plan_type: String,
    pub decision: String,
}

/// Labels for the `store_size` gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StoreSizeLabels {
    pub store_type: String,
}

/// Labels for the `account_usage` gauge (accounts above the monthly
/// threshold only; the family is cleared on every refresh).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AccountUsageLabels {
    pub account_id: String,
    pub plan_type: String,
    pub rate_limit: String,
}

/// Labels for `refresh_errors_total`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshErrorLabels {
    pub store: String,
    pub kind: String,
}

/// Central metrics registry owning all metric families for the service.
pub struct AuthMetrics {
    registry: Mutex<Registry>,

    /// Authorization requests processed, by portal app, account, status and
    /// error detail.
    pub auth_requests: Family<AuthRequestLabels, Counter>,

    /// Check processing time. Buckets span 100ns to 10ms: the hot path is
    /// in-memory lookups only.
    pub auth_request_duration_seconds: Family<AuthDurationLabels, Histogram>,

    /// Rate limit decisions made on the request path.
    pub rate_limit_checks: Family<RateLimitCheckLabels, Counter>,

    /// Current size of the in-memory stores.
    pub store_size: Family<StoreSizeLabels, Gauge>,

    /// Month-to-date relay usage for accounts above the free-tier threshold.
    pub account_usage: Family<AccountUsageLabels, Gauge>,

    /// Errors refreshing a store from its external source.
    pub refresh_errors: Family<RefreshErrorLabels, Counter>,
}

impl AuthMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let auth_requests = Family::<AuthRequestLabels, Counter>::default();
        registry.register(
            "auth_requests",
            "Total authorization requests processed, labeled by portal app, account, status and error details",
            auth_requests.clone(),
        );

        let auth_request_duration_seconds =
            Family::<AuthDurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [
                        0.000_000_1,
                        0.000_000_5,
                        0.000_001,
                        0.000_005,
                        0.000_01,
                        0.000_05,
                        0.000_1,
                        0.000_5,
                        0.001,
                        0.005,
                        0.01,
                    ]
                    .into_iter(),
                )
            });
        registry.register(
            "auth_request_duration_seconds",
            "Histogram of authorization request processing time in seconds",
            auth_request_duration_seconds.clone(),
        );

        let rate_limit_checks = Family::<RateLimitCheckLabels, Counter>::default();
        registry.register(
            "rate_limit_checks",
            "Total rate limit checks performed, labeled by account, plan type and decision",
            rate_limit_checks.clone(),
        );

        let store_size = Family::<StoreSizeLabels, Gauge>::default();
        registry.register(
            "store_size",
            "Current size of the in-memory stores by type",
            store_size.clone(),
        );

        let account_usage = Family::<AccountUsageLabels, Gauge>::default();
        registry.register(
            "account_usage",
            "Month-to-date relay usage for accounts above the monthly threshold",
            account_usage.clone(),
        );

        let refresh_errors = Family::<RefreshErrorLabels, Counter>::default();
        registry.register(
            "refresh_errors",
            "Total errors refreshing a store from its external data source",
            refresh_errors.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            auth_requests,
            auth_request_duration_seconds,
            rate_limit_checks,
            store_size,
            account_usage,
            refresh_errors,
        }
    }

    /// Record one authorization decision (counter + duration histogram).
    pub fn record_auth_request(
        &self,
        portal_app_id: &str,
        account_id: &str,
        status: &str,
        error_type: &str,
        duration_seconds: f64,
    ) {
        self.auth_requests
            .get_or_create(&AuthRequestLabels {
                portal_app_id: portal_app_id.to_string(),
                account_id: account_id.to_string(),
                status: status.to_string(),
                error_type: error_type.to_string(),
            })
            .inc();

        self.auth_request_duration_seconds
            .get_or_create(&AuthDurationLabels {
                portal_app_id: portal_app_id.to_string(),
                status: status.to_string(),
            })
            .observe(duration_seconds);
    }

    /// Record one rate limit decision on the request path.
    pub fn record_rate_limit_check(&self, account_id: &str, plan_type: &str, decision: &str) {
        self.rate_limit_checks
            .get_or_create(&RateLimitCheckLabels {
                account_id: account_id.to_string(),
                plan_type: plan_type.to_string(),
                decision: decision.to_string(),
            })
            .inc();
    }

    /// Set the current size of a store.
    pub fn set_store_size(&self, store_type: &str, size: usize) {
        self.store_size
            .get_or_create(&StoreSizeLabels {
                store_type: store_type.to_string(),
            })
            .set(size as i64);
    }

    /// Count one failed refresh against an external source.
    pub fn record_refresh_error(&self, store: &str, kind: &str) {
        self.refresh_errors
            .get_or_create(&RefreshErrorLabels {
                store: store.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Encode all registered metrics in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        let registry = self.registry.lock().expect("metrics registry poisoned");
        prometheus_client::encoding::text::encode(&mut buf, &registry)?;
        Ok(buf)
    }
}

impl Default for AuthMetrics {
    fn default() -> Self {
        Self::new()
    }
}
