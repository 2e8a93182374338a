//! Extension to content-type mapping.

/// The content type to serve for a request-facing name.
///
/// Tarball double extensions (`.tar.gz` and friends) are recognized as a
/// whole; anything textual is declared UTF-8; unknown extensions fall back
/// to `application/octet-stream`. Compressed single extensions like `.gz`
/// are deliberately absent: those names are normally reachable only through
/// their decompressed alias.
pub fn content_type(name: &str) -> String {
    let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    let mut mime = lookup(ext);
    if mime.is_empty()
        && (name.ends_with(".tar.gz") || name.ends_with(".tar.xz") || name.ends_with(".tar.bz2"))
    {
        mime = lookup("tgz");
    }
    if mime.is_empty() {
        mime = "application/octet-stream";
    }
    if mime.starts_with("text/") {
        format!("{mime}; charset=UTF-8")
    } else {
        mime.to_owned()
    }
}

fn lookup(ext: &str) -> &'static str {
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "svg" | "svgz" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "ps" => "application/postscript",
        "zip" => "application/zip",
        "tgz" => "application/x-gtar-compressed",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "",
    }
}
