//! Request router
//!
//! Maps an HTTP method and path onto the gateway's routes. Upload routes
//! live under the versioned `/api/v1/FileUpload` prefix, matched without
//! regard to case.

use crate::upload::UploadRoute;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use thiserror::Error;

/// Prefix shared by all upload routes
pub const UPLOAD_PREFIX: &str = "/api/v1/FileUpload";

/// Router errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouterError {
    #[error("No route for path: {0}")]
    NotFound(String),

    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },
}

/// A resolved route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// POST /api/v1/FileUpload/...
    Upload {
        route: UploadRoute,
        /// `fileName` query parameter, percent-decoded
        file_name: Option<String>,
    },
    /// GET /health
    Liveness,
    /// GET /health/ready
    Readiness,
}

/// Request Parser
pub struct RequestParser;

impl RequestParser {
    /// Parse an HTTP request line into a route
    pub fn parse(method: &str, path: &str, query: Option<&str>) -> Result<Route, RouterError> {
        let trimmed = path.trim_end_matches('/');

        let (route, allowed) = if let Some(upload) = Self::upload_route(trimmed) {
            let file_name = Self::parse_query(query).remove("filename");
            (
                Route::Upload {
                    route: upload,
                    file_name,
                },
                "POST",
            )
        } else if trimmed.eq_ignore_ascii_case("/health") {
            (Route::Liveness, "GET")
        } else if trimmed.eq_ignore_ascii_case("/health/ready") {
            (Route::Readiness, "GET")
        } else {
            return Err(RouterError::NotFound(path.to_string()));
        };

        if method != allowed {
            return Err(RouterError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            });
        }
        Ok(route)
    }

    fn upload_route(path: &str) -> Option<UploadRoute> {
        let prefix = path.get(..UPLOAD_PREFIX.len())?;
        if !prefix.eq_ignore_ascii_case(UPLOAD_PREFIX) {
            return None;
        }
        let rest = path[UPLOAD_PREFIX.len()..].to_ascii_lowercase();

        match rest.as_str() {
            "/buffered-upload" => Some(UploadRoute::Buffered),
            "/buffered-upload/compressed" => Some(UploadRoute::BufferedRamCompressed),
            "/buffered-upload/compressed-stream" => Some(UploadRoute::BufferedStreamCompressed),
            "/direct-upload" => Some(UploadRoute::Direct),
            "/multipart-upload" => Some(UploadRoute::MultipartPassthrough),
            _ => None,
        }
    }

    /// Query parameters keyed by lowercase name, values percent-decoded
    fn parse_query(query: Option<&str>) -> HashMap<String, String> {
        let mut params = HashMap::new();
        if let Some(q) = query {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                let mut kv = pair.splitn(2, '=');
                if let Some(key) = kv.next() {
                    let value = kv.next().unwrap_or("").replace('+', " ");
                    let value = percent_decode_str(&value).decode_utf8_lossy().into_owned();
                    params.insert(key.to_ascii_lowercase(), value);
                }
            }
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload_routes() {
        let cases = [
            ("/api/v1/FileUpload/buffered-upload", UploadRoute::Buffered),
            (
                "/api/v1/FileUpload/buffered-upload/compressed",
                UploadRoute::BufferedRamCompressed,
            ),
            (
                "/api/v1/FileUpload/buffered-upload/compressed-stream",
                UploadRoute::BufferedStreamCompressed,
            ),
            ("/api/v1/FileUpload/direct-upload", UploadRoute::Direct),
            (
                "/api/v1/FileUpload/multipart-upload",
                UploadRoute::MultipartPassthrough,
            ),
        ];

        for (path, expected) in cases {
            let route = RequestParser::parse("POST", path, None).unwrap();
            assert_eq!(
                route,
                Route::Upload {
                    route: expected,
                    file_name: None
                },
                "path {}",
                path
            );
        }
    }

    #[test]
    fn test_paths_match_case_insensitively() {
        let route = RequestParser::parse("POST", "/API/V1/fileupload/Buffered-Upload/", None);
        assert!(matches!(
            route,
            Ok(Route::Upload {
                route: UploadRoute::Buffered,
                ..
            })
        ));
    }

    #[test]
    fn test_direct_upload_file_name_is_decoded() {
        let route = RequestParser::parse(
            "POST",
            "/api/v1/FileUpload/direct-upload",
            Some("fileName=my%20report+v2.pdf"),
        )
        .unwrap();
        assert_eq!(
            route,
            Route::Upload {
                route: UploadRoute::Direct,
                file_name: Some("my report v2.pdf".into())
            }
        );
    }

    #[test]
    fn test_health_routes() {
        assert_eq!(
            RequestParser::parse("GET", "/health", None).unwrap(),
            Route::Liveness
        );
        assert_eq!(
            RequestParser::parse("GET", "/health/ready", None).unwrap(),
            Route::Readiness
        );
    }

    #[test]
    fn test_unknown_path_not_found() {
        assert!(matches!(
            RequestParser::parse("POST", "/api/v1/FileUpload/other", None),
            Err(RouterError::NotFound(_))
        ));
        assert!(matches!(
            RequestParser::parse("GET", "/", None),
            Err(RouterError::NotFound(_))
        ));
    }

    #[test]
    fn test_wrong_method_not_allowed() {
        assert!(matches!(
            RequestParser::parse("GET", "/api/v1/FileUpload/buffered-upload", None),
            Err(RouterError::MethodNotAllowed { .. })
        ));
        assert!(matches!(
            RequestParser::parse("POST", "/health", None),
            Err(RouterError::MethodNotAllowed { .. })
        ));
    }
}
