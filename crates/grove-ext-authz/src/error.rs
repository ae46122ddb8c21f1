use crate::proto;

/// User-facing body of a rate-limit denial.
pub const RATE_LIMITED_MESSAGE: &str = "This account is rate limited. \
To upgrade your plan or modify your account settings, \
log in to your account at https://portal.grove.city/";

/// Reasons a check request is denied.
///
/// `Display` is the exact message returned to the caller in the denied
/// response body. The unauthorized message is deliberately identical for
/// missing, empty and mismatched API keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("HTTP request not found")]
    MissingHttpRequest,

    #[error("path not provided")]
    PathNotProvided,

    #[error("portal app ID not provided in header or path")]
    PortalAppIdNotFound,

    #[error("portal app not found")]
    PortalAppNotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("{msg}", msg = RATE_LIMITED_MESSAGE)]
    RateLimited,
}

impl AuthzError {
    /// The HTTP status code carried in the denied response.
    pub fn http_status(&self) -> proto::StatusCode {
        match self {
            Self::MissingHttpRequest | Self::PathNotProvided | Self::PortalAppIdNotFound => {
                proto::StatusCode::BadRequest
            }
            Self::PortalAppNotFound => proto::StatusCode::NotFound,
            Self::Unauthorized => proto::StatusCode::Unauthorized,
            Self::RateLimited => proto::StatusCode::TooManyRequests,
        }
    }

    /// Machine-readable code used as the `error_type` metric label.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingHttpRequest => "invalid_request_http",
            Self::PathNotProvided => "invalid_request_path",
            Self::PortalAppIdNotFound => "invalid_request_portal_app_id",
            Self::PortalAppNotFound => "portal_app_not_found",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
        }
    }
}
