//! The request handler: resolves a path against the current tree snapshot
//! and hands the entry to the content responder.

use axum::extract::{Request, State};
use axum::http::header::{ACCEPT_ENCODING, ALLOW, CONTENT_ENCODING, CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use percent_encoding::percent_decode_str;
use tracing::{info, instrument, warn};

use crate::content::{plain_error, respond};
use crate::{mime, AppState};

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub(crate) async fn serve(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    if method != Method::GET && method != Method::HEAD {
        let mut resp = plain_error(StatusCode::METHOD_NOT_ALLOWED);
        resp.headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return resp;
    }

    // Clients percent-encode spaces and non-ASCII names; the tree is keyed
    // by the decoded form. Sequences that are not UTF-8 name nothing.
    let Ok(path) = percent_decode_str(request.uri().path()).decode_utf8() else {
        info!("not found");
        return plain_error(StatusCode::NOT_FOUND);
    };
    let Some(resolved) = state.manager.resolve(&path) else {
        info!("not found");
        return plain_error(StatusCode::NOT_FOUND);
    };
    let entry = resolved.entry;

    let (content, still_gzipped) = match entry
        .open(accepts_gzip(request.headers()), state.decode_budget)
        .await
    {
        Ok(opened) => opened,
        Err(e) => {
            warn!(err = %e, name = %entry.name, "unable to open content");
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(ETAG, HeaderValue::from(entry.id));
    let content_type = mime::content_type(&resolved.name);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::try_from(content_type.as_str()).expect("ascii header"),
    );
    if still_gzipped {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }

    info!(etag = entry.id, content_type = %content_type, gzip = still_gzipped, "serving");

    respond(
        &method,
        request.headers(),
        headers,
        Some(entry.mtime),
        None,
        content,
    )
    .await
}

/// Whether any `Accept-Encoding` header lists gzip. Quality values are
/// ignored, like most static servers do.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|enc| enc.trim().split(';').next().unwrap_or("").trim() == "gzip")
}
