//! PostgREST data source for the portal app store.
//!
//! Talks to the portal database through its PostgREST facade instead of a
//! direct connection. Applications and accounts are fetched separately and
//! merged in memory; the plan type and the account-level user limit live on
//! the account row. Every request carries a freshly minted short-lived
//! HS256 JWT.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::postgres::collect_portal_apps;
use super::{AccountId, PlanType, PortalApp, PortalAppId, PortalAppSource, SourceError};

const APPLICATIONS_SELECT: &str =
    "portal_application_id,portal_account_id,secret_key_hash,secret_key_required";
const ACCOUNTS_SELECT: &str = "portal_account_id,portal_plan_type,portal_account_user_limit";

const TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Claims PostgREST requires for authenticated access.
#[derive(Debug, Serialize)]
struct PostgrestClaims<'a> {
    role: &'a str,
    email: &'a str,
    exp: u64,
}

/// A row from the `portal_applications` endpoint.
#[derive(Debug, Deserialize)]
struct ApplicationRow {
    portal_application_id: String,
    portal_account_id: Option<String>,
    secret_key_hash: Option<String>,
    secret_key_required: Option<bool>,
}

/// A row from the `portal_accounts` endpoint.
#[derive(Debug, Deserialize)]
struct AccountRow {
    portal_account_id: String,
    portal_plan_type: Option<String>,
    portal_account_user_limit: Option<i64>,
}

/// Portal app source backed by the PostgREST API.
pub struct PostgrestPortalAppSource {
    client: reqwest::Client,
    base_url: String,
    jwt_secret: String,
    jwt_role: String,
    jwt_email: String,
}

impl PostgrestPortalAppSource {
    pub fn new(
        base_url: String,
        jwt_secret: String,
        jwt_role: String,
        jwt_email: String,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            jwt_secret,
            jwt_role,
            jwt_email,
        })
    }

    /// Mint a short-lived HS256 token for PostgREST.
    fn generate_token(&self) -> Result<String, SourceError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let claims = PostgrestClaims {
            role: &self.jwt_role,
            email: &self.jwt_email,
            exp: (now + TOKEN_TTL).as_secs(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// GET one PostgREST table, selecting only live rows.
    async fn fetch_rows<T: for<'de> Deserialize<'de>>(
        &self,
        table: &str,
        select: &str,
    ) -> Result<Vec<T>, SourceError> {
        let token = self.generate_token()?;

        let response = self
            .client
            .get(format!("{}/{table}", self.base_url))
            .query(&[("select", select), ("deleted_at", "is.null")])
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::UnexpectedStatus(status.as_u16()));
        }

        Ok(response.json().await?)
    }

    fn merge(
        &self,
        applications: Vec<ApplicationRow>,
        accounts: Vec<AccountRow>,
    ) -> HashMap<PortalAppId, PortalApp> {
        let accounts: HashMap<String, AccountRow> = accounts
            .into_iter()
            .map(|account| (account.portal_account_id.clone(), account))
            .collect();

        let apps = applications.into_iter().filter_map(|app| {
            let account_id = app.portal_account_id.unwrap_or_default();
            let Some(account) = accounts.get(&account_id) else {
                tracing::warn!(
                    portal_application_id = %app.portal_application_id,
                    portal_account_id = %account_id,
                    "no account found for portal application, skipping"
                );
                return None;
            };

            Some(PortalApp::from_source_row(
                PortalAppId::from(app.portal_application_id),
                AccountId::from(account_id),
                PlanType::from_db(account.portal_plan_type.as_deref().unwrap_or_default()),
                app.secret_key_hash,
                app.secret_key_required.unwrap_or(false),
                account.portal_account_user_limit.unwrap_or(0),
            ))
        });

        collect_portal_apps(apps)
    }
}

#[async_trait]
impl PortalAppSource for PostgrestPortalAppSource {
    async fn snapshot_portal_apps(&self) -> Result<HashMap<PortalAppId, PortalApp>, SourceError> {
        let applications: Vec<ApplicationRow> = self
            .fetch_rows("portal_applications", APPLICATIONS_SELECT)
            .await?;

        if applications.is_empty() {
            tracing::info!("no portal applications found");
            return Ok(HashMap::new());
        }

        let accounts: Vec<AccountRow> =
            self.fetch_rows("portal_accounts", ACCOUNTS_SELECT).await?;

        tracing::debug!(
            num_applications = applications.len(),
            num_accounts = accounts.len(),
            "fetched portal applications and accounts from PostgREST"
        );

        Ok(self.merge(applications, accounts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Auth, RateLimit};
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(base_url: String) -> PostgrestPortalAppSource {
        PostgrestPortalAppSource::new(
            base_url,
            "supersecretjwtsecretforlocaldevelopment123456789".to_string(),
            "authenticated".to_string(),
            "service@grove.city".to_string(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_merges_applications_and_accounts() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/portal_applications"))
            .and(query_param("deleted_at", "is.null"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "portal_application_id": "app_free",
                    "portal_account_id": "acct_free",
                    "secret_key_hash": null,
                    "secret_key_required": false
                },
                {
                    "portal_application_id": "app_paid",
                    "portal_account_id": "acct_paid",
                    "secret_key_hash": "key_paid",
                    "secret_key_required": true
                }
            ])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/portal_accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "portal_account_id": "acct_free",
                    "portal_plan_type": "PLAN_FREE",
                    "portal_account_user_limit": null
                },
                {
                    "portal_account_id": "acct_paid",
                    "portal_plan_type": "PLAN_UNLIMITED",
                    "portal_account_user_limit": 40_000_000
                }
            ])))
            .mount(&server)
            .await;

        let apps = source(server.uri()).snapshot_portal_apps().await.unwrap();
        assert_eq!(apps.len(), 2);

        let free = &apps[&PortalAppId::from("app_free")];
        assert_eq!(free.plan_type, PlanType::Free);
        assert_eq!(free.auth, Auth::NoAuth);
        assert_eq!(
            free.rate_limit,
            Some(RateLimit {
                monthly_user_limit: 0
            })
        );

        let paid = &apps[&PortalAppId::from("app_paid")];
        assert_eq!(paid.plan_type, PlanType::Unlimited);
        assert_eq!(
            paid.auth,
            Auth::ApiKey {
                key: "key_paid".to_string()
            }
        );
        assert_eq!(
            paid.rate_limit,
            Some(RateLimit {
                monthly_user_limit: 40_000_000
            })
        );
    }

    #[tokio::test]
    async fn test_application_without_account_is_skipped() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/portal_applications"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "portal_application_id": "app_orphan",
                    "portal_account_id": "acct_missing",
                    "secret_key_hash": null,
                    "secret_key_required": false
                }
            ])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/portal_accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let apps = source(server.uri()).snapshot_portal_apps().await.unwrap();
        assert!(apps.is_empty());
    }

    #[tokio::test]
    async fn test_empty_applications_short_circuits() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/portal_applications"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        // No accounts request should be made for an empty application set.
        Mock::given(method("GET"))
            .and(path("/portal_accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let apps = source(server.uri()).snapshot_portal_apps().await.unwrap();
        assert!(apps.is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/portal_applications"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = source(server.uri()).snapshot_portal_apps().await.unwrap_err();
        assert!(matches!(err, SourceError::UnexpectedStatus(503)));
    }

    #[test]
    fn test_generated_token_shape() {
        let source = source("http://localhost".to_string());
        let token = source.generate_token().unwrap();

        // Three dot-separated base64url sections.
        assert_eq!(token.split('.').count(), 3);
    }
}
