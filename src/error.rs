//! Client-facing gateway responses: JSON errors and the waiting page

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes sent in the `X-Gateway-Error` header and JSON body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Missing or unparsable Host header
    MissingHostHeader,
    /// No backend is routed for the host
    UnknownHost,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::UnknownHost => StatusCode::NOT_FOUND,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GatewayErrorCode::UnknownHost => "UNKNOWN_HOST",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

pub fn full_body(bytes: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// JSON error response with an `X-Gateway-Error` header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// The page shown while a backend is starting.
///
/// Never cached, so the browser's refresh reaches the backend once it is up.
pub fn waiting_page_response(page: Bytes) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Cache-Control", "no-store")
        .body(full_body(page))
        .expect("valid response with static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayErrorCode::UnknownHost.status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GatewayErrorCode::UnknownHost, "No backend for example.com");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"No backend for example.com\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(GatewayErrorCode::MissingHostHeader, "Missing Host header");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "MISSING_HOST_HEADER"
        );
    }

    #[test]
    fn test_waiting_page_response() {
        let response = waiting_page_response(Bytes::from_static(b"<html>starting</html>"));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Cache-Control").unwrap(), "no-store");
        assert!(response.headers()["Content-Type"]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }
}
