//! Problem responses
//!
//! Every non-2xx response carries an `application/problem+json` body with
//! `status`, `title` and `detail`. Server-side failures get a generic detail;
//! the full error only goes to the log.

use crate::router::RouterError;
use crate::upload::{ErrorClass, UploadError};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Non-standard status for a request the client abandoned
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

const GENERIC_DETAIL: &str = "An unexpected error occurred while processing the upload.";

#[derive(Debug, Serialize)]
struct Problem<'a> {
    status: u16,
    title: &'a str,
    detail: &'a str,
}

/// Build a JSON response with the given status and content type
pub fn json(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Build a problem response
pub fn problem(status: StatusCode, title: &str, detail: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&Problem {
        status: status.as_u16(),
        title,
        detail,
    })
    .unwrap_or_default();
    json(status, "application/problem+json", body)
}

/// Status code for an upload outcome class
pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Client => StatusCode::BAD_REQUEST,
        ErrorClass::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        ErrorClass::Server => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map an upload failure onto its problem response
pub fn from_upload_error(error: &UploadError) -> Response<Full<Bytes>> {
    let class = error.class();
    let status = status_for(class);
    match class {
        ErrorClass::Client => problem(status, "Invalid upload request", &error.to_string()),
        ErrorClass::Cancelled => problem(
            status,
            "Client Closed Request",
            "The upload was cancelled before it completed.",
        ),
        ErrorClass::Server => problem(status, "Upload failed", GENERIC_DETAIL),
    }
}

/// Map a routing failure onto its problem response
pub fn from_router_error(error: &RouterError) -> Response<Full<Bytes>> {
    match error {
        RouterError::NotFound(_) => problem(StatusCode::NOT_FOUND, "Not Found", &error.to_string()),
        RouterError::MethodNotAllowed { .. } => problem(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed",
            &error.to_string(),
        ),
    }
}

/// Generic 500 for failures outside the upload pipeline
pub fn internal_error() -> Response<Full<Bytes>> {
    problem(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        GENERIC_DETAIL,
    )
}
