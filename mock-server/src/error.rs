use anyhow::Error;
use http::{Response, header};
use serde::Serialize;

use crate::service::{Outgoing, full_body};

/// Wire shape of every error response: `{"error":{message,type,param,code}}`.
/// `param` and `code` are serialized as `null` when absent so that clients
/// can rely on a stable envelope.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub param: Option<&'static str>,
    pub code: Option<&'static str>,
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Clone, Debug)]
pub struct ApiError {
    pub status: u16,
    pub detail: ErrorDetail,
}

impl ApiError {
    /// 400 with the offending parameter named.
    pub fn missing_param(param: &'static str) -> Self {
        Self {
            status: 400,
            detail: ErrorDetail {
                message: format!("Missing required parameter: '{param}'"),
                kind: "invalid_request_error",
                param: Some(param),
                code: None,
            },
        }
    }

    /// 400 for a body that does not decode.
    pub fn bad_body(err: serde_json::Error) -> Self {
        Self {
            status: 400,
            detail: ErrorDetail {
                message: format!("Invalid request body: {err}"),
                kind: "invalid_request_error",
                param: Some("body"),
                code: None,
            },
        }
    }

    /// 404 with a machine-readable code.
    pub fn not_found(message: String, code: &'static str) -> Self {
        Self {
            status: 404,
            detail: ErrorDetail {
                message,
                kind: "invalid_request_error",
                param: None,
                code: Some(code),
            },
        }
    }

    /// 405 for a known path with an unsupported method.
    pub fn method_not_allowed() -> Self {
        Self {
            status: 405,
            detail: ErrorDetail {
                message: "Method not allowed".to_string(),
                kind: "invalid_request_error",
                param: None,
                code: None,
            },
        }
    }

    /// 500 for server-side failures.
    pub fn server(message: String) -> Self {
        Self {
            status: 500,
            detail: ErrorDetail {
                message,
                kind: "server_error",
                param: None,
                code: None,
            },
        }
    }

    pub fn into_response(self) -> Result<Response<Outgoing>, Error> {
        let body = serde_json::to_vec(&ErrorEnvelope { error: self.detail })?;
        Ok(Response::builder()
            .status(self.status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(full_body(body))?)
    }
}

impl From<http::Error> for ApiError {
    fn from(err: http::Error) -> Self {
        Self::server(format!("Cannot build response: {err}"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::server(format!("Cannot encode response: {err}"))
    }
}

#[test]
fn envelope_shape() {
    let err = ApiError::missing_param("model");
    let json = serde_json::to_string(&ErrorEnvelope { error: err.detail }).unwrap();
    assert_eq!(
        json,
        r#"{"error":{"message":"Missing required parameter: 'model'","type":"invalid_request_error","param":"model","code":null}}"#
    );
}
