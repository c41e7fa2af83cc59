//! Response helpers shared by the relief API and the status endpoint.

use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;

use crate::core::ReliefError;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
    pub const TEXT_CSV: &str = "text/csv; charset=utf-8";
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Build a response with the given status, body and optional content type.
    pub fn http(status: StatusCode, body: Vec<u8>, content_type: Option<&str>) -> Response<Vec<u8>> {
        let mut builder = Response::builder().status(status);

        if let Some(ct) = content_type {
            match HeaderValue::from_str(ct) {
                Ok(header_value) => {
                    builder = builder.header(header::CONTENT_TYPE, header_value);
                }
                Err(e) => {
                    log::error!("Invalid content type '{}': {}", ct, e);
                }
            }
        }

        builder.body(body).unwrap_or_else(|e| {
            log::error!("Failed to build response: {}", e);
            Self::error_http(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        })
    }

    /// Build a plain-text error response.
    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type::TEXT_PLAIN)
            .body(message.as_bytes().to_vec())
            .unwrap_or_else(|e| {
                log::error!("Failed to build error response: {}", e);
                Response::new(b"Internal Server Error".to_vec())
            })
    }

    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(json_body) => Self::http(status, json_body, Some(content_type::APPLICATION_JSON)),
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::error_http(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                )
            }
        }
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        Self::json(StatusCode::OK, data)
    }

    pub fn no_content() -> Response<Vec<u8>> {
        Self::http(StatusCode::NO_CONTENT, Vec::new(), None)
    }

    /// CSV download served as an attachment.
    pub fn csv_attachment(body: Vec<u8>, filename: &str) -> Response<Vec<u8>> {
        let mut response = Self::http(StatusCode::OK, body, Some(content_type::TEXT_CSV));
        match HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
            Ok(value) => {
                response
                    .headers_mut()
                    .insert(header::CONTENT_DISPOSITION, value);
            }
            Err(e) => log::error!("Invalid export filename '{}': {}", filename, e),
        }
        response
    }

    /// JSON error body for a failed operation.
    pub fn from_error(err: &ReliefError) -> Response<Vec<u8>> {
        let (kind, message) = match err {
            ReliefError::Validation(msg) => ("validation", msg.clone()),
            ReliefError::NotFound(_) => ("not_found", "Request ID not found".to_string()),
            ReliefError::Transport(_) => (
                "unavailable",
                "Service temporarily unavailable, please try again".to_string(),
            ),
            ReliefError::Permission(msg) => ("permission", msg.clone()),
            ReliefError::Unauthorized(_) => ("unauthorized", "Operator sign-in required".to_string()),
            ReliefError::Conflict(msg) => ("conflict", msg.clone()),
            ReliefError::RateLimited(msg) => ("rate_limited", msg.clone()),
            ReliefError::Configuration(_) | ReliefError::Internal(_) => {
                ("internal", "Internal Server Error".to_string())
            }
        };
        Self::json(
            err.status_code(),
            &ErrorBody {
                error: kind,
                message,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let response = ResponseBuilder::error_http(StatusCode::BAD_REQUEST, "Invalid input");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body(), b"Invalid input");
    }

    #[test]
    fn test_json_response() {
        use serde_json::json;
        let data = json!({"message": "success", "code": 200});
        let response = ResponseBuilder::json(StatusCode::CREATED, &data);
        assert_eq!(response.status(), StatusCode::CREATED);
        let expected = r#"{"code":200,"message":"success"}"#;
        assert_eq!(response.body(), expected.as_bytes());
    }

    #[test]
    fn test_csv_attachment() {
        let response = ResponseBuilder::csv_attachment(b"a,b\n".to_vec(), "relief_ops_ALL.csv");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"relief_ops_ALL.csv\""
        );
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            content_type::TEXT_CSV
        );
    }

    #[test]
    fn test_from_error() {
        let cases = [
            (ReliefError::Validation("district is required".into()), 400),
            (ReliefError::Unauthorized("bad token".into()), 401),
            (ReliefError::Permission("denied".into()), 403),
            (ReliefError::NotFound("abc".into()), 404),
            (ReliefError::Conflict("changed".into()), 409),
            (ReliefError::RateLimited("slow down".into()), 429),
            (ReliefError::Transport("reset".into()), 503),
            (ReliefError::Internal("boom".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(ResponseBuilder::from_error(&err).status().as_u16(), status);
        }

        let response = ResponseBuilder::from_error(&ReliefError::NotFound("abc".into()));
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["message"], "Request ID not found");

        // transport details stay in the logs
        let response = ResponseBuilder::from_error(&ReliefError::Transport("10.0.0.5 refused".into()));
        assert!(!String::from_utf8_lossy(response.body()).contains("10.0.0.5"));
    }
}
