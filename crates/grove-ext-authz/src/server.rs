//! The ext_authz gRPC service.
//!
//! Orchestrates, in order: portal app ID extraction, portal app lookup,
//! API key authorization, rate limit check. The first failure wins and maps
//! to a denied response; success returns the headers PATH expects upstream.
//!
//! Everything the check needs lives in memory, so the handler never awaits
//! an external dependency between reading the request and building the
//! response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};

use crate::api_key::authorize_api_key;
use crate::error::AuthzError;
use crate::extract::extract_portal_app_id;
use crate::metrics::AuthMetrics;
use crate::proto;
use crate::proto::authorization_server::Authorization;
use crate::ratelimit::RateLimitStore;
use crate::response::{denied_response, ok_response};
use crate::store::{Auth, PortalApp, PortalAppStore};

const STATUS_AUTHORIZED: &str = "authorized";
const STATUS_DENIED: &str = "denied";

/// Labels resolved progressively during a check. Both IDs stay empty when
/// the request fails before the portal app is found.
#[derive(Default)]
struct RequestIdentity {
    portal_app_id: String,
    account_id: String,
}

/// The ext_authz gRPC service implementation.
pub struct AuthzService {
    portal_apps: Arc<PortalAppStore>,
    rate_limits: Arc<RateLimitStore>,
    metrics: Arc<AuthMetrics>,
}

impl AuthzService {
    pub fn new(
        portal_apps: Arc<PortalAppStore>,
        rate_limits: Arc<RateLimitStore>,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            portal_apps,
            rate_limits,
            metrics,
        }
    }

    /// The authorization pipeline. Deterministic order; first failure wins.
    fn authorize(
        &self,
        request: &proto::CheckRequest,
        identity: &mut RequestIdentity,
    ) -> Result<PortalApp, AuthzError> {
        let http = request
            .attributes
            .as_ref()
            .and_then(|attributes| attributes.request.as_ref())
            .and_then(|request| request.http.as_ref())
            .ok_or(AuthzError::MissingHttpRequest)?;

        if http.path.is_empty() {
            return Err(AuthzError::PathNotProvided);
        }

        let headers: &HashMap<String, String> = &http.headers;

        let portal_app_id = extract_portal_app_id(headers, &http.path)?;
        identity.portal_app_id = portal_app_id.to_string();

        let portal_app = self
            .portal_apps
            .lookup(&portal_app_id)
            .ok_or(AuthzError::PortalAppNotFound)?;
        identity.account_id = portal_app.account_id.to_string();

        if let Auth::ApiKey { key } = &portal_app.auth {
            authorize_api_key(headers, key)?;
        }

        self.check_rate_limit(&portal_app)?;

        Ok(portal_app)
    }

    /// Deny the request if its account is currently over its monthly limit.
    fn check_rate_limit(&self, portal_app: &PortalApp) -> Result<(), AuthzError> {
        let account_id = portal_app.account_id.as_str();
        let plan_type = portal_app.plan_type.as_str();

        if portal_app.rate_limit.is_none() {
            self.metrics
                .record_rate_limit_check(account_id, plan_type, "no_limit_configured");
            return Ok(());
        }

        if self.rate_limits.is_rate_limited(&portal_app.account_id) {
            self.metrics
                .record_rate_limit_check(account_id, plan_type, "rate_limited");
            return Err(AuthzError::RateLimited);
        }

        self.metrics
            .record_rate_limit_check(account_id, plan_type, "allowed");
        Ok(())
    }
}

#[tonic::async_trait]
impl Authorization for AuthzService {
    async fn check(
        &self,
        request: Request<proto::CheckRequest>,
    ) -> Result<Response<proto::CheckResponse>, Status> {
        let started = Instant::now();
        let check_request = request.into_inner();

        let mut identity = RequestIdentity::default();
        let result = self.authorize(&check_request, &mut identity);
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(portal_app) => {
                self.metrics.record_auth_request(
                    &identity.portal_app_id,
                    &identity.account_id,
                    STATUS_AUTHORIZED,
                    "",
                    duration,
                );

                tracing::debug!(
                    portal_app_id = %portal_app.id,
                    account_id = %portal_app.account_id,
                    "check authorized"
                );

                Ok(Response::new(ok_response(
                    &portal_app.id,
                    &portal_app.account_id,
                )))
            }
            Err(error) => {
                self.metrics.record_auth_request(
                    &identity.portal_app_id,
                    &identity.account_id,
                    STATUS_DENIED,
                    error.error_code(),
                    duration,
                );

                tracing::info!(
                    portal_app_id = %identity.portal_app_id,
                    error_type = error.error_code(),
                    "check denied"
                );

                Ok(Response::new(denied_response(&error)))
            }
        }
    }
}
