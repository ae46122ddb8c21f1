//! CheckResponse builders.
//!
//! Every check ends in one of two shapes: OK with the headers PATH expects
//! upstream, or Denied with an HTTP status and a JSON body. The handler
//! never surfaces a gRPC error.

use crate::error::AuthzError;
use crate::extract::HEADER_PORTAL_APP_ID;
use crate::proto;
use crate::store::{AccountId, PortalAppId};

/// Header carrying the owning account ID on the forwarded request.
pub const HEADER_ACCOUNT_ID: &str = "Portal-Account-ID";

const GRPC_OK: i32 = 0;
const GRPC_PERMISSION_DENIED: i32 = 7;

fn header(key: &str, value: &str) -> proto::HeaderValueOption {
    proto::HeaderValueOption {
        header: Some(proto::HeaderValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// An OK response carrying exactly the portal app and account ID headers.
pub fn ok_response(portal_app_id: &PortalAppId, account_id: &AccountId) -> proto::CheckResponse {
    proto::CheckResponse {
        status: Some(proto::Status {
            code: GRPC_OK,
            message: "ok".to_string(),
        }),
        http_response: Some(proto::check_response::HttpResponse::OkResponse(
            proto::OkHttpResponse {
                headers: vec![
                    header(HEADER_PORTAL_APP_ID, portal_app_id.as_str()),
                    header(HEADER_ACCOUNT_ID, account_id.as_str()),
                ],
            },
        )),
    }
}

/// A denied response with the error's HTTP status and JSON body.
pub fn denied_response(error: &AuthzError) -> proto::CheckResponse {
    let http_status = error.http_status();
    let message = error.to_string();

    // The body shape is part of the proxy integration contract; built with
    // an explicit template so the byte layout never drifts.
    let body = format!(
        r#"{{"code": {}, "message": "{}"}}"#,
        http_status as i32, message
    );

    proto::CheckResponse {
        status: Some(proto::Status {
            code: GRPC_PERMISSION_DENIED,
            message,
        }),
        http_response: Some(proto::check_response::HttpResponse::DeniedResponse(
            proto::DeniedHttpResponse {
                status: Some(proto::HttpStatus {
                    code: http_status.into(),
                }),
                headers: vec![],
                body,
            },
        )),
    }
}
