//! Per-request routing for a mirror
//!
//! GET/HEAD only. Cached package files are served from disk; index files are
//! first checked for freshness; everything else is fetched from upstream and
//! cached on the way through.

use crate::mirror::fetch::{self, FetchRequest, CHUNK_SIZE};
use crate::mirror::freshness;
use crate::mirror::range::{self, RangeRequest};
use crate::mirror::MirrorContext;
use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub(crate) type MirrorBody = UnsyncBoxBody<Bytes, io::Error>;

pub(crate) fn empty(status: StatusCode) -> Response<MirrorBody> {
    let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Body fed chunk by chunk from a blocking download
pub(crate) fn channel_body(rx: mpsc::Receiver<io::Result<Bytes>>) -> MirrorBody {
    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk.map(Frame::data), rx))
    });
    StreamBody::new(chunks).boxed_unsync()
}

pub(crate) fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

pub(crate) fn set_header(response: &mut Response<MirrorBody>, name: HeaderName, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        response.headers_mut().insert(name, value);
    }
}

fn request_header(request: &Parts, name: HeaderName) -> Option<String> {
    request
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Answer one request, never failing the connection
pub(crate) async fn handle(ctx: Arc<MirrorContext>, request: Request<Incoming>) -> Response<MirrorBody> {
    let (request, _body) = request.into_parts();
    let response = route(&ctx, &request).await;
    if ctx.verbose() {
        info!("{} {} {}", request.method, request.uri, response.status().as_u16());
    } else {
        debug!("{} {} {}", request.method, request.uri, response.status().as_u16());
    }
    response
}

async fn route(ctx: &Arc<MirrorContext>, request: &Parts) -> Response<MirrorBody> {
    let head = match request.method {
        Method::GET => false,
        Method::HEAD => true,
        _ => return empty(StatusCode::METHOD_NOT_ALLOWED),
    };

    let path = request.uri.path();
    let upstream_path = request
        .uri
        .path_and_query()
        .map_or(path, |pq| pq.as_str())
        .to_string();

    if ctx.config.is_ignored(path) || path.split('/').any(|segment| segment == "..") {
        return empty(StatusCode::NOT_FOUND);
    }

    let range = request_header(request, header::RANGE);

    // Directory listings are upstream's business
    if path.is_empty() || path.ends_with('/') {
        return if head {
            upstream_head(ctx, upstream_path).await
        } else {
            let passthrough = FetchRequest {
                path: upstream_path,
                cache: None,
                range: None,
                accept_encoding: request_header(request, header::ACCEPT_ENCODING),
            };
            fetch_response(ctx, passthrough).await
        };
    }

    let cache = ctx.config.cache_path(path);
    let download = FetchRequest {
        path: upstream_path.clone(),
        cache: Some(cache.clone()),
        range: range.clone(),
        accept_encoding: None,
    };

    match tokio::fs::metadata(&cache).await {
        Ok(metadata) if metadata.is_file() => {
            if head {
                return cached_head(metadata.len());
            }
            if ctx.config.is_index(&cache) && index_is_stale(ctx, &cache, &upstream_path, &metadata).await {
                return fetch_response(ctx, download).await;
            }
            serve_cached(&cache, range.as_deref()).await
        }
        // A directory: the path names a listing without its trailing slash
        Ok(_) => {
            if head {
                return empty(StatusCode::NOT_FOUND);
            }
            let passthrough = FetchRequest {
                path: upstream_path,
                cache: None,
                range: None,
                accept_encoding: request_header(request, header::ACCEPT_ENCODING),
            };
            fetch_response(ctx, passthrough).await
        }
        Err(_) if head => upstream_head(ctx, upstream_path).await,
        Err(_) => fetch_response(ctx, download).await,
    }
}

/// Check an index file against upstream. A fresh file is touched so the next
/// check measures from now.
async fn index_is_stale(
    ctx: &Arc<MirrorContext>,
    cache: &Path,
    upstream_path: &str,
    metadata: &std::fs::Metadata,
) -> bool {
    let ctx = ctx.clone();
    let cache: PathBuf = cache.to_path_buf();
    let upstream_path = upstream_path.to_string();
    let cached = metadata.modified().unwrap_or(UNIX_EPOCH);

    let check = tokio::task::spawn_blocking(move || {
        let stale = freshness::is_stale(&ctx.config.freshness, cached, SystemTime::now(), || {
            ctx.upstream.last_modified(&upstream_path)
        });
        if !stale {
            let touched = std::fs::OpenOptions::new()
                .write(true)
                .open(&cache)
                .and_then(|f| f.set_modified(SystemTime::now()));
            if let Err(e) = touched {
                debug!("Could not touch {}: {}", cache.display(), e);
            }
        }
        stale
    });

    match check.await {
        Ok(stale) => stale,
        Err(e) => {
            warn!("Freshness check panicked: {}", e);
            false
        }
    }
}

async fn fetch_response(ctx: &Arc<MirrorContext>, request: FetchRequest) -> Response<MirrorBody> {
    let (respond, response) = oneshot::channel();
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || fetch::fetch(ctx, request, respond));
    // Dropped without an answer only if the download panicked
    response.await.unwrap_or_else(|_| empty(StatusCode::BAD_GATEWAY))
}

async fn upstream_head(ctx: &Arc<MirrorContext>, path: String) -> Response<MirrorBody> {
    let ctx = ctx.clone();
    match tokio::task::spawn_blocking(move || ctx.upstream.head(&path)).await {
        Ok(Ok(head)) => {
            let mut response = empty(status_code(head.status));
            if let Some(len) = head.content_length.filter(|_| (200..300).contains(&head.status)) {
                set_header(&mut response, header::CONTENT_LENGTH, len);
            }
            response
        }
        Ok(Err(e)) => {
            warn!("Upstream HEAD failed: {}", e);
            empty(StatusCode::BAD_GATEWAY)
        }
        Err(e) => {
            warn!("Upstream HEAD panicked: {}", e);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn cached_head(len: u64) -> Response<MirrorBody> {
    let mut response = empty(StatusCode::OK);
    set_header(&mut response, header::CONTENT_LENGTH, len);
    set_header(&mut response, header::ACCEPT_RANGES, "bytes");
    response
}

/// Serve a cached file, honoring `Range`
async fn serve_cached(cache: &Path, range_header: Option<&str>) -> Response<MirrorBody> {
    let mut file = match tokio::fs::File::open(cache).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return empty(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("Cannot open {}: {}", cache.display(), e);
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let len = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            warn!("Cannot stat {}: {}", cache.display(), e);
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let (status, start, length, content_range) = match range::resolve(range_header, len) {
        RangeRequest::Full => (StatusCode::OK, 0, len, None),
        RangeRequest::Partial(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.len(), Some(r.content_range(len))),
        RangeRequest::Unsatisfiable => {
            let mut response = empty(StatusCode::RANGE_NOT_SATISFIABLE);
            set_header(&mut response, header::CONTENT_RANGE, format!("bytes */{}", len));
            return response;
        }
    };

    if start > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(start)).await {
            warn!("Cannot seek {}: {}", cache.display(), e);
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let chunks = stream::unfold((file, length), |(mut file, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let mut buffer = vec![0u8; CHUNK_SIZE.min(remaining as usize)];
        match file.read(&mut buffer).await {
            Ok(0) => {
                let error = io::Error::new(io::ErrorKind::UnexpectedEof, "cache file shrank while serving");
                Some((Err(error), (file, 0)))
            }
            Ok(n) => {
                buffer.truncate(n);
                Some((Ok(Frame::data(Bytes::from(buffer))), (file, remaining - n as u64)))
            }
            Err(e) => Some((Err(e), (file, 0))),
        }
    });

    let mut response = Response::new(StreamBody::new(chunks).boxed_unsync());
    *response.status_mut() = status;
    set_header(&mut response, header::CONTENT_LENGTH, length);
    set_header(&mut response, header::ACCEPT_RANGES, "bytes");
    if let Some(value) = content_range {
        set_header(&mut response, header::CONTENT_RANGE, value);
    }
    response
}
