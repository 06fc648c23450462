use std::io::Cursor;

use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use thiserror::Error;

use crate::server::AppState;

/// Cache directive for error statuses that are safe to cache.
pub const ERROR_CACHE_CONTROL: &str = "public, max-age=3600";

/// Errors surfaced to the feed requester.
///
/// Site-specific failure modes (paywalls, suspended accounts, login walls,
/// bot challenges) are folded into these few kinds before they reach the
/// HTTP layer.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("not found")]
    NotFound,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// A non-2xx upstream answer that none of the classification rules matched.
    #[error("upstream returned {0}")]
    UpstreamStatus(reqwest::StatusCode),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FeedError {
    pub fn status(&self) -> Status {
        match self {
            FeedError::NotFound => Status::NotFound,
            FeedError::RateLimited(_) => Status::ServiceUnavailable,
            FeedError::Forbidden(_) => Status::Forbidden,
            FeedError::BadRequest(_) => Status::BadRequest,
            FeedError::UpstreamStatus(_) => Status::BadGateway,
            FeedError::Internal(_) => Status::InternalServerError,
        }
    }

    /// Short human message for the status page.
    fn public_message(&self) -> String {
        match self {
            FeedError::NotFound => String::new(),
            FeedError::RateLimited(msg) | FeedError::Forbidden(msg) | FeedError::BadRequest(msg) => {
                format!("{}.", msg)
            }
            FeedError::UpstreamStatus(code) => format!("upstream answered {}.", code),
            FeedError::Internal(e) => format!("{}.", e),
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        FeedError::Internal(anyhow::Error::new(e).context("upstream request failed"))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Internal(anyhow::Error::new(e).context("unexpected upstream JSON"))
    }
}

/// Render the minimal HTML status page.
pub fn error_page(status: Status, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<meta charset="utf-8" />
<title>{code} {reason}</title>
<style type="text/css">
  body {{ font-family: serif; }}
</style>
<h1>{code} {reason}</h1>
<p>{message}</p>
<hr/>
"#,
        code = status.code,
        reason = status.reason().unwrap_or(""),
        message = escape_text(message),
    )
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn is_cacheable_error(status: Status) -> bool {
    matches!(status.code, 302 | 400 | 403 | 404 | 405)
}

fn html_page(status: Status, message: &str) -> Response<'static> {
    let body = error_page(status, message);
    let mut builder = Response::build();
    builder
        .status(status)
        .raw_header("Content-Type", "text/html; charset=utf-8")
        .sized_body(body.len(), Cursor::new(body));
    if is_cacheable_error(status) {
        builder.raw_header("Cache-Control", ERROR_CACHE_CONTROL);
    }
    builder.finalize()
}

/// Bare status page for failures Rocket raises itself (no route, bad query).
#[derive(Debug, Clone, Copy)]
pub struct StatusPage(pub Status);

impl<'r> Responder<'r, 'static> for StatusPage {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        Ok(html_page(self.0, ""))
    }
}

impl<'r> Responder<'r, 'static> for FeedError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let debug = req
            .rocket()
            .state::<AppState>()
            .map(|s| s.config.server.debug)
            .unwrap_or(false);

        match &self {
            FeedError::Internal(e) => tracing::error!(uri = %req.uri(), "feed failed: {:?}", e),
            other => tracing::info!(uri = %req.uri(), code = status.code, "feed error: {}", other),
        }

        if !debug {
            return Ok(html_page(status, &self.public_message()));
        }

        let body = match &self {
            FeedError::Internal(e) => format!("{:?}\n", e),
            other => format!("{}: {:?}\n", other, other),
        };
        let mut builder = Response::build();
        builder
            .status(status)
            .raw_header("Content-Type", "text/plain; charset=utf-8")
            .sized_body(body.len(), Cursor::new(body));
        if is_cacheable_error(status) {
            builder.raw_header("Cache-Control", ERROR_CACHE_CONTROL);
        }
        builder.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(FeedError::NotFound.status(), Status::NotFound);
        assert_eq!(FeedError::RateLimited("x".into()).status(), Status::ServiceUnavailable);
        assert_eq!(FeedError::Forbidden("x".into()).status(), Status::Forbidden);
        assert_eq!(FeedError::BadRequest("x".into()).status(), Status::BadRequest);
        assert_eq!(
            FeedError::UpstreamStatus(reqwest::StatusCode::INTERNAL_SERVER_ERROR).status(),
            Status::BadGateway
        );
    }

    #[test]
    fn error_page_carries_code_and_escaped_message() {
        let page = error_page(Status::Forbidden, "login <required>");
        assert!(page.contains("<h1>403 Forbidden</h1>"));
        assert!(page.contains("login &lt;required&gt;"));
    }

    #[test]
    fn only_client_errors_are_cacheable() {
        assert!(is_cacheable_error(Status::NotFound));
        assert!(is_cacheable_error(Status::BadRequest));
        assert!(!is_cacheable_error(Status::ServiceUnavailable));
        assert!(!is_cacheable_error(Status::InternalServerError));
    }
}
