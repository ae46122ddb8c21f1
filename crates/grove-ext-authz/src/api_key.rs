//! API key authorization.
//!
//! Compares the `Authorization` header against the portal app's stored key.
//! The comparison is constant time and every failure mode (missing header,
//! empty value, wrong key) produces the same opaque error.

use std::collections::HashMap;

use subtle::ConstantTimeEq;

use crate::error::AuthzError;
use crate::extract::header_value;

const AUTH_HEADER: &str = "Authorization";

// Stripped when present; any other scheme prefix is treated as key material.
const BEARER_PREFIX: &str = "Bearer ";

/// Authorize a request against the portal app's API key.
pub fn authorize_api_key(
    headers: &HashMap<String, String>,
    expected_key: &str,
) -> Result<(), AuthzError> {
    let header = header_value(headers, AUTH_HEADER).unwrap_or("");
    if header.is_empty() {
        return Err(AuthzError::Unauthorized);
    }

    let presented = header.strip_prefix(BEARER_PREFIX).unwrap_or(header);

    if constant_time_eq(presented.as_bytes(), expected_key.as_bytes()) {
        Ok(())
    } else {
        Err(AuthzError::Unauthorized)
    }
}

/// Constant-time equality; the length difference is the only early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exact_key_authorized() {
        let headers = headers(&[("Authorization", "api_key_good")]);
        assert!(authorize_api_key(&headers, "api_key_good").is_ok());
    }

    #[test]
    fn test_bearer_prefix_stripped() {
        let headers = headers(&[("Authorization", "Bearer api_key_good")]);
        assert!(authorize_api_key(&headers, "api_key_good").is_ok());
    }

    #[test]
    fn test_bearer_prefix_is_case_sensitive() {
        // "bearer " is not the literal prefix, so it stays part of the key.
        let headers = headers(&[("Authorization", "bearer api_key_good")]);
        assert_eq!(
            authorize_api_key(&headers, "api_key_good").unwrap_err(),
            AuthzError::Unauthorized
        );
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = headers(&[("authorization", "api_key_good")]);
        assert!(authorize_api_key(&headers, "api_key_good").is_ok());
    }

    #[test]
    fn test_wrong_key_unauthorized() {
        let headers = headers(&[("Authorization", "Bearer wrong")]);
        assert_eq!(
            authorize_api_key(&headers, "api_key_good").unwrap_err(),
            AuthzError::Unauthorized
        );
    }

    #[test]
    fn test_missing_and_empty_header_unauthorized() {
        assert_eq!(
            authorize_api_key(&HashMap::new(), "api_key_good").unwrap_err(),
            AuthzError::Unauthorized
        );
        let headers = headers(&[("Authorization", "")]);
        assert_eq!(
            authorize_api_key(&headers, "api_key_good").unwrap_err(),
            AuthzError::Unauthorized
        );
    }

    #[test]
    fn test_failures_are_indistinguishable() {
        // Absent, empty and wrong keys must produce bit-identical errors so
        // the response gives no oracle about which check failed.
        let absent = authorize_api_key(&HashMap::new(), "secret").unwrap_err();
        let empty =
            authorize_api_key(&headers(&[("Authorization", "")]), "secret").unwrap_err();
        let wrong = authorize_api_key(&headers(&[("Authorization", "Bearer nope")]), "secret")
            .unwrap_err();

        assert_eq!(absent, empty);
        assert_eq!(empty, wrong);
        assert_eq!(absent.to_string(), wrong.to_string());
        assert_eq!(absent.http_status(), wrong.http_status());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"abc"));
    }
}
