//! Sends a byte source as an HTTP response with conditional-request and
//! range-request semantics.
//!
//! The caller prepares the response headers (entity tag, content type,
//! content encoding) and hands over a [`Content`]; everything from
//! `If-Modified-Since` to multipart byte ranges is handled here.

use std::io::{self, SeekFrom};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::header::{
    HeaderName, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, LAST_MODIFIED, RANGE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, DuplexStream,
};
use tokio_util::io::ReaderStream;
use tracing::warn;

use staticd_tree::Content;

use crate::ranges::{
    byteranges_size, parse_range, part_header, random_boundary, sum_ranges_size, trailer,
    HttpRange,
};

/// Chunk size for skipping over unwanted bytes of a forward-only source.
const SKIP_CHUNK: usize = 32 * 1024;

/// Capacity of the pipe between the multipart producer task and the
/// response body.
const PIPE_CAPACITY: usize = 32 * 1024;

/// Sends `content` as the response to a GET or HEAD request, honoring
/// `If-Modified-Since`, `If-None-Match`, `If-Range` and `Range`.
///
/// `headers` must already carry the entity tag and content type the caller
/// wants; the conditional checks read them from there and the map becomes
/// the response headers. A seekable source learns its size by seeking and
/// `declared_size` is ignored; a stream uses `declared_size`, and with no
/// size at all range support is switched off and the body goes out without
/// a Content-Length.
pub async fn respond(
    method: &Method,
    req_headers: &HeaderMap,
    mut headers: HeaderMap,
    modtime: Option<SystemTime>,
    declared_size: Option<u64>,
    mut content: Content,
) -> Response {
    if check_last_modified(req_headers, &mut headers, modtime) {
        return finish(StatusCode::NOT_MODIFIED, headers, Body::empty());
    }
    let (range_header, done) = check_etag(method, req_headers, &mut headers, modtime);
    if done {
        return finish(StatusCode::NOT_MODIFIED, headers, Body::empty());
    }

    let size = match &mut content {
        Content::Seekable(s) => match measure(s).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(err = %e, "unable to determine content size");
                return plain_error(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        Content::Stream(_) => declared_size,
    };

    let mut code = StatusCode::OK;
    let mut send_size = size;
    if let Some(size) = size {
        // Overlapping ranges only work against a source that can rewind;
        // a forward-only stream needs them sorted and disjoint.
        let can_seek = content.is_seekable();
        let mut ranges = match parse_range(range_header.as_deref(), size, can_seek, !can_seek) {
            Ok(r) => r,
            Err(_) => return plain_error(StatusCode::RANGE_NOT_SATISFIABLE),
        };
        if sum_ranges_size(&ranges) > size {
            // The client asked for more bytes than the entity holds, which
            // no sane client does. Ignore the ranges and send everything.
            ranges.clear();
        }

        if ranges.len() == 1 {
            let range = ranges[0];
            let positioned = match &mut content {
                Content::Seekable(s) => {
                    s.seek(SeekFrom::Start(range.start)).await.map(|_| ())
                }
                Content::Stream(s) => skip(s.as_mut(), range.start).await,
            };
            if let Err(e) = positioned {
                warn!(err = %e, "unable to position content at range start");
                return plain_error(StatusCode::RANGE_NOT_SATISFIABLE);
            }
            code = StatusCode::PARTIAL_CONTENT;
            headers.insert(
                CONTENT_RANGE,
                HeaderValue::try_from(range.content_range(size)).expect("ascii header"),
            );
            send_size = Some(range.length);
        } else if ranges.len() > 1 {
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();
            let boundary = random_boundary();

            code = StatusCode::PARTIAL_CONTENT;
            send_size = Some(byteranges_size(&ranges, &boundary, &content_type, size));
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::try_from(format!("multipart/byteranges; boundary={boundary}"))
                    .expect("ascii header"),
            );

            let (pipe_w, pipe_r) = tokio::io::duplex(PIPE_CAPACITY);
            tokio::spawn(async move {
                if let Err(e) =
                    write_byteranges(content, ranges, boundary, content_type, size, pipe_w).await
                {
                    // Dropping the writer closes the pipe, so the client
                    // sees a truncated body instead of a hang.
                    warn!(err = %e, "aborting multipart range body");
                }
            });
            content = Content::Stream(Box::new(pipe_r));
        }

        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(n) = send_size {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(n));
        }
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        match send_size {
            Some(n) => Body::from_stream(ReaderStream::new(content.take(n))),
            None => Body::from_stream(ReaderStream::new(content)),
        }
    };
    finish(code, headers, body)
}

/// A plain-text error response, for when there is no entity to describe.
pub(crate) fn plain_error(code: StatusCode) -> Response {
    let mut resp = Response::new(Body::from(format!(
        "{} {}\n",
        code.as_u16(),
        code.canonical_reason().unwrap_or("")
    )));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=UTF-8"),
    );
    resp
}

fn finish(code: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut resp = Response::new(body);
    *resp.status_mut() = code;
    *resp.headers_mut() = headers;
    resp
}

/// Handles `If-Modified-Since`. True means the request is complete with a
/// 304 and the entity headers have been stripped; otherwise `Last-Modified`
/// is set.
fn check_last_modified(
    req: &HeaderMap,
    headers: &mut HeaderMap,
    modtime: Option<SystemTime>,
) -> bool {
    // A missing mtime or the epoch means "unknown"; no conditional logic.
    let Some(modtime) = modtime.filter(|t| *t != UNIX_EPOCH) else {
        return false;
    };

    if let Some(since) =
        header_str(req, &IF_MODIFIED_SINCE).and_then(|v| httpdate::parse_http_date(v).ok())
    {
        // The header format has second granularity, so the entity only
        // counts as modified once it is at least a full second newer.
        if modtime < since + Duration::from_secs(1) {
            headers.remove(CONTENT_TYPE);
            headers.remove(CONTENT_LENGTH);
            return true;
        }
    }
    headers.insert(
        LAST_MODIFIED,
        HeaderValue::try_from(httpdate::fmt_http_date(modtime)).expect("ascii header"),
    );
    false
}

/// Handles `If-Range` and `If-None-Match` against the entity tag already on
/// the response. Returns the effective `Range` header (dropped if the
/// `If-Range` precondition fails) and whether the request is complete with
/// a 304.
fn check_etag(
    method: &Method,
    req: &HeaderMap,
    headers: &mut HeaderMap,
    modtime: Option<SystemTime>,
) -> (Option<String>, bool) {
    let etag = header_str(headers, &ETAG).unwrap_or("").to_owned();
    let mut range = header_str(req, &RANGE).map(str::to_owned);

    if let Some(if_range) = header_str(req, &IF_RANGE) {
        if !if_range.is_empty() && if_range != etag {
            // Not the current entity tag; maybe a date. Dates compare at
            // second granularity.
            let date_matches = match (
                modtime.filter(|t| *t != UNIX_EPOCH),
                httpdate::parse_http_date(if_range),
            ) {
                (Some(mt), Ok(t)) => unix_secs(mt) == unix_secs(t),
                _ => false,
            };
            if !date_matches {
                range = None;
            }
        }
    }

    if let Some(if_none_match) = header_str(req, &IF_NONE_MATCH) {
        if !etag.is_empty()
            && (method == Method::GET || method == Method::HEAD)
            && (if_none_match == etag || if_none_match == "*")
        {
            headers.remove(CONTENT_TYPE);
            headers.remove(CONTENT_LENGTH);
            return (None, true);
        }
    }

    (range, false)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Seeks to the end and back to learn the total size.
async fn measure<S: AsyncSeek + Unpin + ?Sized>(s: &mut S) -> io::Result<u64> {
    let n = s.seek(SeekFrom::End(0)).await?;
    s.seek(SeekFrom::Start(0)).await?;
    Ok(n)
}

/// Reads and discards `count` bytes from a forward-only source. Hitting EOF
/// first is an error.
async fn skip<R: AsyncRead + Unpin + ?Sized>(r: &mut R, mut count: u64) -> io::Result<()> {
    let mut buf = vec![0u8; SKIP_CHUNK];
    while count > 0 {
        let want = count.min(SKIP_CHUNK as u64) as usize;
        let n = r.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "content ended before range offset",
            ));
        }
        count -= n as u64;
    }
    Ok(())
}

/// Streams a multipart/byteranges body into the pipe: for each range the
/// part header, then exactly `length` content bytes.
async fn write_byteranges(
    mut content: Content,
    ranges: Vec<HttpRange>,
    boundary: String,
    content_type: String,
    size: u64,
    mut pipe: DuplexStream,
) -> io::Result<()> {
    let mut offset = 0u64;
    for (i, range) in ranges.iter().enumerate() {
        pipe.write_all(part_header(&boundary, i == 0, range, &content_type, size).as_bytes())
            .await?;
        match &mut content {
            Content::Seekable(s) => {
                s.seek(SeekFrom::Start(range.start)).await?;
            }
            // Forward-only ranges are sorted and disjoint, so skipping from
            // the previous range's end always suffices.
            Content::Stream(s) => skip(s.as_mut(), range.start - offset).await?,
        }
        copy_exact(&mut content, &mut pipe, range.length).await?;
        offset = range.start + range.length;
    }
    pipe.write_all(trailer(&boundary).as_bytes()).await?;
    pipe.shutdown().await
}

/// Copies exactly `count` bytes. Hitting EOF first is an error.
async fn copy_exact<R, W>(r: &mut R, w: &mut W, count: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(&mut r.take(count), w).await?;
    if copied < count {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "content ended inside range",
        ));
    }
    Ok(())
}
