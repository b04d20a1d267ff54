//! Dynamic-response header formatting and MIME-type lookup.
//!
//! Per spec.md §1 these are "trivial... external collaborators"; this
//! module keeps them that way — a small extension table (grounded in
//! `examples/original_source`'s `HttpResponse::getContentType`, inferred
//! from its call sites in `worker.cpp`/`response_cache.h` since the header
//! itself wasn't in the retrieval pack) and one header-bytes builder shared
//! by both the cache-build path ([`crate::cache`]) and the cache-miss
//! dynamic path ([`crate::worker`]).

use crate::http::types::Version;
use std::path::Path;

const SERVER_HEADER: &str = "hyperstatic";

/// Extension → MIME type, covering the static-file-server content types the
/// original source's `getContentType` switch enumerates (inferred from its
/// call sites, since `http_response.h`/`.cpp` weren't in the retrieval
/// pack). Falls back to `application/octet-stream`.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Builds a complete `HTTP/1.x 200 OK` header block (status line through
/// the blank line, no body) for a dynamic (cache-miss) response, matching
/// the wire shape spec.md §3 specifies for cache entries.
pub fn build_200_header(version: Version, content_type: &str, content_length: u64, keep_alive: bool) -> Vec<u8> {
    let status_line = match version {
        Version::Http11 => "HTTP/1.1 200 OK\r\n",
        Version::Http10 => "HTTP/1.0 200 OK\r\n",
    };
    let connection = if keep_alive { "keep-alive" } else { "close" };

    let mut header = Vec::with_capacity(128);
    header.extend_from_slice(status_line.as_bytes());
    header.extend_from_slice(format!("Server: {SERVER_HEADER}\r\n").as_bytes());
    header.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    header.extend_from_slice(format!("Content-Length: {content_length}\r\n").as_bytes());
    header.extend_from_slice(format!("Connection: {connection}\r\n").as_bytes());
    header.extend_from_slice(b"\r\n");
    header
}
