//! Upstream downloads streamed to the client while being cached
//!
//! Runs on the blocking pool. The response head goes back to the async
//! handler over a oneshot; body chunks follow over a bounded channel. When
//! the client goes away the download keeps draining upstream into the cache
//! file so the entry is still completed.

use crate::mirror::handler::{channel_body, empty, set_header, status_code, MirrorBody};
use crate::mirror::range::{self, RangeRequest};
use crate::mirror::upstream::UpstreamResponse;
use crate::mirror::MirrorContext;
use bytes::Bytes;
use hyper::header;
use hyper::{Response, StatusCode};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub(crate) const CHUNK_SIZE: usize = 16 * 1024;
const CHANNEL_DEPTH: usize = 32;

type Chunks = mpsc::Sender<io::Result<Bytes>>;

/// One upstream GET on behalf of a client
pub(crate) struct FetchRequest {
    /// Request path and query, relative to the upstream root
    pub path: String,
    /// Where to cache the body; `None` relays without caching
    pub cache: Option<PathBuf>,
    pub range: Option<String>,
    pub accept_encoding: Option<String>,
}

/// Fetch `request` from upstream, answering the client through `respond`
pub(crate) fn fetch(
    ctx: Arc<MirrorContext>,
    request: FetchRequest,
    respond: oneshot::Sender<Response<MirrorBody>>,
) {
    let upstream = match ctx.upstream.get(&request.path, request.accept_encoding.as_deref()) {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Fetching {} failed: {}", ctx.upstream.url(&request.path), e);
            let status = match e {
                ureq::Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            let _ = respond.send(empty(status));
            return;
        }
    };

    if !upstream.is_success() {
        debug!("Upstream answered {} for {}", upstream.status, request.path);
        let _ = respond.send(empty(status_code(upstream.status)));
        return;
    }

    // Caching an HTML listing at `dir/` would create a file where the cache
    // needs a directory.
    match request.cache.filter(|_| !upstream.is_html()) {
        Some(cache) => download(upstream, &cache, request.range.as_deref(), respond),
        None => relay(upstream, respond),
    }
}

fn send(client: &mut Option<Chunks>, chunk: Bytes, what: &str) {
    if let Some(tx) = client {
        if tx.blocking_send(Ok(chunk)).is_err() {
            debug!("Client went away, finishing {} for the cache", what);
            *client = None;
        }
    }
}

/// Stream an upstream response to the client untouched
fn relay(mut upstream: UpstreamResponse, respond: oneshot::Sender<Response<MirrorBody>>) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let mut response = Response::new(channel_body(rx));
    *response.status_mut() = status_code(upstream.status);
    if let Some(value) = &upstream.content_type {
        set_header(&mut response, header::CONTENT_TYPE, value);
    }
    if let Some(value) = &upstream.content_encoding {
        set_header(&mut response, header::CONTENT_ENCODING, value);
    }
    if let Some(len) = upstream.content_length {
        set_header(&mut response, header::CONTENT_LENGTH, len);
    }
    if respond.send(response).is_err() {
        return;
    }

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        match upstream.body.read(&mut buffer) {
            Ok(0) => return,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n]))).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

/// Temporary sibling of `cache` that the download is written to
fn create_temp(cache: &Path) -> io::Result<(PathBuf, File)> {
    let parent = cache
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let name = cache.file_name().map_or_else(String::new, |n| n.to_string_lossy().to_string());
    let temp = parent.join(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple()));
    let file = File::create(&temp)?;
    Ok((temp, file))
}

/// Part of a chunk starting at `chunk_start` that falls inside the window
fn window_slice(window: RangeRequest, chunk_start: u64, data: &[u8]) -> Option<&[u8]> {
    let slice = match window {
        RangeRequest::Full => data,
        RangeRequest::Unsatisfiable => return None,
        RangeRequest::Partial(r) => {
            let chunk_end = chunk_start + data.len() as u64;
            let start = r.start.max(chunk_start);
            let end = (r.end + 1).min(chunk_end);
            if start >= end {
                return None;
            }
            &data[(start - chunk_start) as usize..(end - chunk_start) as usize]
        }
    };
    (!slice.is_empty()).then_some(slice)
}

fn abort(temp: &Path, client: Option<Chunks>, error: io::Error) {
    warn!("Download into {} failed: {}", temp.display(), error);
    if let Err(e) = std::fs::remove_file(temp) {
        debug!("Could not remove {}: {}", temp.display(), e);
    }
    if let Some(tx) = client {
        let _ = tx.blocking_send(Err(error));
    }
}

/// Write the upstream body into the cache while streaming the requested
/// window of it to the client
fn download(
    mut upstream: UpstreamResponse,
    cache: &Path,
    range_header: Option<&str>,
    respond: oneshot::Sender<Response<MirrorBody>>,
) {
    let (temp, mut file) = match create_temp(cache) {
        Ok(created) => created,
        Err(e) => {
            warn!("Cannot cache {}: {}", cache.display(), e);
            return relay(upstream, respond);
        }
    };
    let what = cache.display().to_string();

    // Without a known length the Range header is ignored and everything sent
    let total = upstream.content_length;
    let window = match total {
        Some(len) => range::resolve(range_header, len),
        None => RangeRequest::Full,
    };

    let (response, client) = match window {
        RangeRequest::Unsatisfiable => {
            let mut response = empty(StatusCode::RANGE_NOT_SATISFIABLE);
            set_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes */{}", total.unwrap_or(0)),
            );
            (response, None)
        }
        RangeRequest::Partial(r) => {
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            let mut response = Response::new(channel_body(rx));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            set_header(&mut response, header::CONTENT_LENGTH, r.len());
            set_header(&mut response, header::CONTENT_RANGE, r.content_range(total.unwrap_or(0)));
            (response, Some(tx))
        }
        RangeRequest::Full => {
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            let mut response = Response::new(channel_body(rx));
            if let Some(len) = total {
                set_header(&mut response, header::CONTENT_LENGTH, len);
            }
            (response, Some(tx))
        }
    };
    let mut client = if respond.send(response).is_ok() { client } else { None };

    // When the client's window runs to the end of the file, its last chunk is
    // held back until the cache file is in place, so a client that finished
    // reading always finds the file cached.
    let window_end = match window {
        RangeRequest::Partial(r) => Some(r.end),
        _ => None,
    };
    let hold_back = window_end.is_none_or(|end| total == Some(end + 1));

    let mut pending: Option<Bytes> = None;
    let mut offset: u64 = 0;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match upstream.body.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return abort(&temp, client, e),
        };
        if let Err(e) = file.write_all(&buffer[..n]) {
            return abort(&temp, client, e);
        }

        let chunk_start = offset;
        offset += n as u64;
        if let Some(slice) = window_slice(window, chunk_start, &buffer[..n]) {
            let chunk = Bytes::copy_from_slice(slice);
            if hold_back {
                if let Some(previous) = pending.replace(chunk) {
                    send(&mut client, previous, &what);
                }
            } else {
                send(&mut client, chunk, &what);
            }
        }
        if window_end.is_some_and(|end| !hold_back && offset > end) {
            // Window delivered; end the response and keep caching
            client = None;
        }
    }

    if let Some(expected) = total {
        if offset != expected {
            let error = io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("upstream sent {} of {} bytes", offset, expected),
            );
            return abort(&temp, client, error);
        }
    }

    if let Err(e) = file.sync_all() {
        return abort(&temp, client, e);
    }
    drop(file);
    if let Err(e) = std::fs::rename(&temp, cache) {
        return abort(&temp, client, e);
    }
    debug!("Cached {} ({} bytes)", what, offset);

    if let Some(last) = pending {
        send(&mut client, last, &what);
    }
}
