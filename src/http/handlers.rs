//! Article request handlers
//!
//! Each handler follows the same shape: validate the URL, run preconditions,
//! ask the dispatcher for a connection, drive the NNTP exchange, and give
//! the connection back to the pool (`put` when the session stayed healthy,
//! `close` when the framing is no longer trustworthy). Per-request errors
//! are logged with the method and Message-ID and never take the process
//! down.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use super::AppState;
use super::range::{
    Precondition, RangeError, check_preconditions, generate_boundary, parse_range,
    ranges_mime_size, sum_ranges_size, write_multipart,
};
use crate::dispatch::{FetchError, FetchVerb, PostError};
use crate::nntp::{Headers, MessageId, NntpConnection, NntpError, OutboundArticle};

const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Headers never exposed to HTTP clients
const PRIVACY_STRIPPED: [&str; 2] = ["organization", "x-complaints-to"];

/// Query parameters accepted by POST
#[derive(Debug, Deserialize, Default)]
pub struct PostQuery {
    #[serde(default)]
    f: Option<String>,
    #[serde(default)]
    g: Option<String>,
    #[serde(default)]
    s: Option<String>,
}

/// `/m/<id>.<ext>` GET/HEAD: buffered article with range support
pub async fn message_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(id) = parse_name(&name) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let range_header = match check_preconditions(&method, &headers) {
        Precondition::NotModified => return not_modified(),
        Precondition::PreconditionFailed => return StatusCode::PRECONDITION_FAILED.into_response(),
        Precondition::Proceed { range } => range,
    };

    let fetched = match state.dispatcher.fetch(FetchVerb::Article, &id).await {
        Ok(fetched) => fetched,
        Err(err) => return fetch_error_response(&method, &id, &err),
    };
    let mut conn = fetched.conn;

    let mut buf = state.buffers.acquire();
    let n = match read_body_into(&mut conn, false, &mut buf).await {
        Ok(n) => {
            state.dispatcher.pool().put(conn);
            n
        }
        Err(BodyReadError::Overflow) => {
            // Abandoning mid-body desyncs the session framing
            state.dispatcher.pool().close(conn);
            error!(method = %method, message_id = %id, "article exceeds size limit");
            return StatusCode::INSUFFICIENT_STORAGE.into_response();
        }
        Err(BodyReadError::Nntp(err)) => {
            state.dispatcher.pool().close(conn);
            error!(method = %method, message_id = %id, error = %err, "body read error");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let size = n as u64;
    let mut ranges = Vec::new();
    if size > 0 {
        if let Some(range_header) = range_header.as_deref() {
            match parse_range(range_header, size) {
                Ok(parsed) => ranges = parsed,
                Err(err) => {
                    error!(method = %method, message_id = %id, "invalid range");
                    let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
                    if err == RangeError::NoOverlap {
                        response.headers_mut().insert(
                            header::CONTENT_RANGE,
                            header_value(&format!("bytes */{size}")),
                        );
                    }
                    return response;
                }
            }
            if sum_ranges_size(&ranges) > size {
                // More bytes requested than the article holds: either an
                // attack or a confused client, serve the whole thing
                ranges.clear();
            }
        }
    }

    let mut code = StatusCode::OK;
    let mut content_type = CONTENT_TYPE_TEXT.to_string();
    let mut extra_content_range = None;
    let payload: Vec<u8> = match ranges.len() {
        0 => buf[..n].to_vec(),
        1 => {
            // RFC 7233 §4.1: a single-range response must not be multipart
            let ra = ranges[0];
            code = StatusCode::PARTIAL_CONTENT;
            extra_content_range = Some(ra.content_range(size));
            buf[ra.start as usize..(ra.start + ra.length) as usize].to_vec()
        }
        _ => {
            code = StatusCode::PARTIAL_CONTENT;
            let boundary = generate_boundary();
            let payload = write_multipart(&ranges, CONTENT_TYPE_TEXT, size, &boundary, &buf[..n]);
            debug_assert_eq!(
                ranges_mime_size(&ranges, CONTENT_TYPE_TEXT, size, &boundary),
                payload.len() as u64
            );
            content_type = format!("multipart/byteranges; boundary={boundary}");
            payload
        }
    };

    let mut response = Response::builder().status(code);
    if let Some(headers_mut) = response.headers_mut() {
        propagate_article_headers(headers_mut, &fetched.headers);
        headers_mut.insert(header::CONTENT_TYPE, header_value(&content_type));
        headers_mut.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers_mut.insert(header::ETAG, header_value(&format!("\"{}\"", id.short())));
        headers_mut.insert(header::CONTENT_LENGTH, header_value(&payload.len().to_string()));
        if let Some(content_range) = extra_content_range {
            headers_mut.insert(header::CONTENT_RANGE, header_value(&content_range));
        }
    }

    info!(method = %method, message_id = %id, "served article");
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(payload)
    };
    response.body(body).unwrap_or_else(|_| {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

/// `/d/<id>.<ext>` GET/HEAD: raw dot-encoded article, streamed
pub async fn raw_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(id) = parse_name(&name) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match check_preconditions(&method, &headers) {
        Precondition::NotModified => return not_modified(),
        Precondition::PreconditionFailed => return StatusCode::PRECONDITION_FAILED.into_response(),
        // Raw articles are streamed without range support
        Precondition::Proceed { .. } => {}
    }

    let fetched = match state.dispatcher.fetch(FetchVerb::Article, &id).await {
        Ok(fetched) => fetched,
        Err(err) => return fetch_error_response(&method, &id, &err),
    };
    let mut conn = fetched.conn;

    if method == Method::HEAD {
        // Drain the pending body so the session can be reused; the raw
        // byte count is what a GET would have streamed
        let mut sink = state.buffers.acquire();
        let n = match read_body_into(&mut conn, true, &mut sink).await {
            Ok(n) => {
                state.dispatcher.pool().put(conn);
                n
            }
            Err(BodyReadError::Overflow) => {
                state.dispatcher.pool().close(conn);
                error!(method = %method, message_id = %id, "article exceeds size limit");
                return StatusCode::INSUFFICIENT_STORAGE.into_response();
            }
            Err(BodyReadError::Nntp(err)) => {
                state.dispatcher.pool().close(conn);
                error!(method = %method, message_id = %id, error = %err, "body read error");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        let mut response = Response::builder().status(StatusCode::OK);
        if let Some(headers_mut) = response.headers_mut() {
            propagate_article_headers(headers_mut, &fetched.headers);
            headers_mut.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_TEXT));
            headers_mut.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            headers_mut.insert(header::ETAG, header_value(&format!("\"{}\"", id.short())));
            headers_mut.insert(header::CONTENT_LENGTH, header_value(&n.to_string()));
        }
        return response.body(Body::empty()).unwrap_or_else(|_| {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        });
    }

    enum StreamEnd {
        Done,
        Overflow,
        ClientGone,
        Fail(NntpError),
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let pool = state.dispatcher.pool().clone();
    let limit = state.article_size_limit;
    let stream_id = id.clone();
    let stream_method = method.clone();
    tokio::spawn(async move {
        let mut sent = 0usize;
        let end = loop {
            let line = match conn.read_body_line(true).await {
                Ok(Some(line)) => Bytes::copy_from_slice(line),
                Ok(None) => break StreamEnd::Done,
                Err(err) => break StreamEnd::Fail(err),
            };
            sent += line.len();
            if sent > limit {
                break StreamEnd::Overflow;
            }
            if tx.send(Ok(line)).await.is_err() {
                break StreamEnd::ClientGone;
            }
        };
        match end {
            StreamEnd::Done => pool.put(conn),
            StreamEnd::Overflow => {
                pool.close(conn);
                error!(method = %stream_method, message_id = %stream_id, "article exceeds size limit");
                let _ = tx
                    .send(Err(std::io::Error::other("article size limit exceeded")))
                    .await;
            }
            StreamEnd::ClientGone => pool.close(conn),
            StreamEnd::Fail(err) => {
                pool.close(conn);
                error!(method = %stream_method, message_id = %stream_id, error = %err, "body read error");
                let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
            }
        }
    });

    let mut response = Response::builder().status(StatusCode::OK);
    if let Some(headers_mut) = response.headers_mut() {
        propagate_article_headers(headers_mut, &fetched.headers);
        headers_mut.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_TEXT));
        headers_mut.insert(header::ETAG, header_value(&format!("\"{}\"", id.short())));
    }

    info!(method = %method, message_id = %id, "streaming raw article");
    response
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `/h/<id>.<ext>` GET/HEAD: headers only, via the NNTP HEAD command
pub async fn head_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(id) = parse_name(&name) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match check_preconditions(&method, &headers) {
        Precondition::NotModified => return not_modified(),
        Precondition::PreconditionFailed => return StatusCode::PRECONDITION_FAILED.into_response(),
        Precondition::Proceed { .. } => {}
    }

    let fetched = match state.dispatcher.fetch(FetchVerb::Head, &id).await {
        Ok(fetched) => fetched,
        Err(err) => return fetch_error_response(&method, &id, &err),
    };
    // HEAD responses are fully consumed by the fetch
    state.dispatcher.pool().put(fetched.conn);

    let mut response = Response::builder().status(StatusCode::OK);
    if let Some(headers_mut) = response.headers_mut() {
        propagate_article_headers(headers_mut, &fetched.headers);
        headers_mut.insert(header::ETAG, header_value(&format!("\"{}\"", id.short())));
    }

    info!(method = %method, message_id = %id, "served headers");
    response
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `POST /m/<id>.<ext>`: post an article, dot-encoding the body
pub async fn message_post(
    state: State<AppState>,
    path: Path<String>,
    query: Query<PostQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_post(state, path, query, headers, body, false).await
}

/// `POST /d/<id>.<ext>`: post an article whose body is already dot-encoded
pub async fn raw_post(
    state: State<AppState>,
    path: Path<String>,
    query: Query<PostQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_post(state, path, query, headers, body, true).await
}

async fn handle_post(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PostQuery>,
    headers: HeaderMap,
    body: Body,
    raw: bool,
) -> Response {
    let Some(id) = parse_name(&name) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // Buffer the request body under the article cap
    let mut buf = state.buffers.acquire();
    let mut n = 0usize;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                error!(method = "POST", message_id = %id, error = %err, "request body error");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        if n + chunk.len() > buf.len() {
            error!(method = "POST", message_id = %id, "request body exceeds size limit");
            return StatusCode::INSUFFICIENT_STORAGE.into_response();
        }
        buf[n..n + chunk.len()].copy_from_slice(&chunk);
        n += chunk.len();
    }
    if n == 0 {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let article = OutboundArticle {
        headers: synthesize_headers(&id, &headers, &query, &state.default_newsgroup),
        body: buf[..n].to_vec(),
        message_id: id,
    };

    match state.dispatcher.post(&article, raw).await {
        Ok(()) => {
            info!(method = "POST", message_id = %article.message_id, "article posted");
            StatusCode::OK.into_response()
        }
        Err(err @ PostError::Refused { .. }) => {
            error!(method = "POST", message_id = %article.message_id, error = %err, "posting refused");
            StatusCode::CONFLICT.into_response()
        }
        Err(err) => {
            error!(method = "POST", message_id = %article.message_id, error = %err, "NNTP error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Build the outbound NNTP headers for a POST (priority: `X-Usenet-*`
/// pass-through, then query parameters, then generated fallbacks)
fn synthesize_headers(
    id: &MessageId,
    request_headers: &HeaderMap,
    query: &PostQuery,
    default_newsgroup: &str,
) -> Headers {
    let mut out = Headers::new();
    for (name, value) in request_headers {
        let name = name.as_str();
        if let Some(stripped) = name.strip_prefix("x-usenet-") {
            if stripped.is_empty() {
                continue;
            }
            if let Ok(value) = value.to_str() {
                out.add(canonical_header_name(stripped), value);
            }
        }
    }

    if out.get("From").is_none() {
        match &query.f {
            Some(f) if !f.is_empty() => out.set("From", f.clone()),
            _ => out.set("From", format!("{}@ngPost.com", generate_from_token())),
        }
    }
    if out.get("Newsgroups").is_none() {
        match &query.g {
            Some(g) if !g.is_empty() => out.set("Newsgroups", g.clone()),
            _ => out.set("Newsgroups", default_newsgroup),
        }
    }
    if out.get("Subject").is_none() {
        match &query.s {
            Some(s) if !s.is_empty() => out.set("Subject", s.clone()),
            _ => {
                let prefix = id.local_part();
                if prefix.is_empty() {
                    out.set("Subject", id.short());
                } else {
                    out.set("Subject", prefix);
                }
            }
        }
    }
    if let Some(len) = request_headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
    {
        out.set("Content-Length", len);
    }
    out
}

/// Characters easy to confuse on paper are left out, and a token must carry
/// at least one uppercase letter and one digit before it is accepted
fn generate_from_token() -> String {
    const ALPHABET: &[u8] =
        b"abcdefghijkmnopqrstuvwxyzACEFHJKLMNPRTUVWXY3479";
    const LEN: usize = 12;

    let mut rng = rand::thread_rng();
    loop {
        let token: String = (0..LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        if token.chars().any(|c| c.is_ascii_uppercase())
            && token.chars().any(|c| c.is_ascii_digit())
        {
            return token;
        }
    }
}

/// `x-usenet-reply-to` → `Reply-To`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Copy article headers onto the response as `X-Usenet-*`, dropping the
/// privacy-stripped names
fn propagate_article_headers(out: &mut HeaderMap, article_headers: &Headers) {
    for (name, value) in article_headers.iter() {
        if PRIVACY_STRIPPED
            .iter()
            .any(|stripped| name.eq_ignore_ascii_case(stripped))
        {
            continue;
        }
        let header_name = format!("x-usenet-{}", name.to_ascii_lowercase());
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(header_name),
            HeaderValue::from_str(value),
        ) {
            out.append(name, value);
        }
    }
}

/// Build a header value from text that is already known to be ASCII; the
/// empty-value fallback only triggers on values we never actually produce
fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Strip the extension and validate the Message-ID; `None` means HTTP 400.
///
/// Only `.csv` and `.nfo` are accepted so edge caches treat the responses
/// as static cacheable files.
fn parse_name(name: &str) -> Option<MessageId> {
    let stem = name
        .strip_suffix(".csv")
        .or_else(|| name.strip_suffix(".nfo"))?;
    MessageId::parse(stem).ok()
}

/// RFC 7232 §4.1: 304 carries no entity headers
fn not_modified() -> Response {
    StatusCode::NOT_MODIFIED.into_response()
}

fn fetch_error_response(method: &Method, id: &MessageId, err: &FetchError) -> Response {
    match err {
        FetchError::Exhausted => {
            error!(method = %method, message_id = %id, "article not found on any server");
            StatusCode::NOT_FOUND.into_response()
        }
        FetchError::Transport(inner) => {
            error!(method = %method, message_id = %id, error = %inner, "NNTP transport error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        FetchError::Pool(inner) => {
            error!(method = %method, message_id = %id, error = %inner, "pool error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

enum BodyReadError {
    Overflow,
    Nntp(NntpError),
}

/// Drain the pending article body into `buf`; the buffer length is the
/// article size cap, so running out of room is the 507 signal
async fn read_body_into(
    conn: &mut NntpConnection,
    raw: bool,
    buf: &mut [u8],
) -> Result<usize, BodyReadError> {
    let mut n = 0usize;
    loop {
        match conn.read_body_line(raw).await {
            Ok(Some(line)) => {
                if n + line.len() > buf.len() {
                    return Err(BodyReadError::Overflow);
                }
                buf[n..n + line.len()].copy_from_slice(line);
                n += line.len();
            }
            Ok(None) => return Ok(n),
            Err(err) => return Err(BodyReadError::Nntp(err)),
        }
    }
}
