//! Blocking client for the upstream repository

use crate::mirror::freshness::parse_http_date;
use crate::mirror::Timeouts;
use std::io::Read;
use std::time::SystemTime;
use tracing::debug;

/// Response head plus a reader over the undecoded body
pub(crate) struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Directory listings are relayed, never cached
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|t| t.split(';').any(|part| part.trim() == "text/html"))
    }
}

/// Status and headers of an upstream HEAD request
pub(crate) struct UpstreamHead {
    pub status: u16,
    pub content_length: Option<u64>,
    pub last_modified: Option<SystemTime>,
}

pub(crate) struct Upstream {
    agent: ureq::Agent,
    base_url: String,
}

fn header(headers: &ureq::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl Upstream {
    pub fn new(base_url: &str, timeouts: &Timeouts) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(timeouts.connect))
            .timeout_recv_response(Some(timeouts.response))
            .timeout_recv_body(Some(timeouts.body))
            .build()
            .into();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Absolute upstream URL for a request path (with query)
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn get(&self, path: &str, accept_encoding: Option<&str>) -> Result<UpstreamResponse, ureq::Error> {
        let url = self.url(path);
        debug!("GET {}", url);

        let mut request = self.agent.get(&url);
        if let Some(encoding) = accept_encoding {
            request = request.header("Accept-Encoding", encoding);
        }
        let response = request.call()?;

        let (parts, body) = response.into_parts();
        Ok(UpstreamResponse {
            status: parts.status.as_u16(),
            content_type: header(&parts.headers, "content-type"),
            content_encoding: header(&parts.headers, "content-encoding"),
            content_length: header(&parts.headers, "content-length").and_then(|v| v.parse().ok()),
            body: Box::new(body.into_reader()),
        })
    }

    pub fn head(&self, path: &str) -> Result<UpstreamHead, ureq::Error> {
        let url = self.url(path);
        debug!("HEAD {}", url);

        let response = self.agent.head(&url).call()?;
        let headers = response.headers();
        Ok(UpstreamHead {
            status: response.status().as_u16(),
            content_length: header(headers, "content-length").and_then(|v| v.parse().ok()),
            last_modified: header(headers, "last-modified").and_then(|v| parse_http_date(&v)),
        })
    }

    /// Upstream's `Last-Modified` for a path, if it can be learned
    pub fn last_modified(&self, path: &str) -> Option<SystemTime> {
        match self.head(path) {
            Ok(head) if (200..300).contains(&head.status) => head.last_modified,
            Ok(head) => {
                debug!("HEAD {} returned {}", path, head.status);
                None
            }
            Err(e) => {
                debug!("HEAD {} failed: {}", path, e);
                None
            }
        }
    }
}
