//! Portal app ID extraction from a check request.
//!
//! Extraction order:
//! - Try the `Portal-Application-ID` header first
//! - Fall back to the first path segment after the `/v1/` prefix
//! - Fail if neither yields a non-empty ID

use std::collections::HashMap;

use crate::error::AuthzError;
use crate::store::PortalAppId;

/// Header carrying the portal app ID on inbound requests.
///
/// Also set on the forwarded request so downstream PATH services observe it.
pub const HEADER_PORTAL_APP_ID: &str = "Portal-Application-ID";

/// Path prefix under which the portal app ID appears as the first segment,
/// e.g. `/v1/1a2b3c4d`.
const PATH_PREFIX: &str = "/v1/";

/// Look up a header value by case-insensitive name.
///
/// Envoy lower-cases header keys before forwarding them, but the contract
/// is a case-insensitive multimap, so the lookup must not rely on it.
pub(crate) fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Extract the portal app ID from the request headers or path.
///
/// Pure function of `(headers, path)`; never consults the stores.
pub fn extract_portal_app_id(
    headers: &HashMap<String, String>,
    path: &str,
) -> Result<PortalAppId, AuthzError> {
    if let Some(id) = extract_from_header(headers) {
        return Ok(id);
    }
    if let Some(id) = extract_from_path(path) {
        return Ok(id);
    }
    Err(AuthzError::PortalAppIdNotFound)
}

/// The `Portal-Application-ID` header value, if present and non-empty.
fn extract_from_header(headers: &HashMap<String, String>) -> Option<PortalAppId> {
    match header_value(headers, HEADER_PORTAL_APP_ID) {
        Some(value) if !value.is_empty() => Some(PortalAppId::from(value)),
        _ => None,
    }
}

/// The first non-empty segment after the `/v1/` prefix, if any.
fn extract_from_path(path: &str) -> Option<PortalAppId> {
    let rest = path.strip_prefix(PATH_PREFIX)?;
    rest.split('/')
        .find(|segment| !segment.is_empty())
        .map(PortalAppId::from)
}
