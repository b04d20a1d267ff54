//! HTTP-visible error taxonomy and startup error plumbing.
//!
//! The hot-path taxonomy is deliberately small — spec.md §7 is explicit that
//! there is no 5xx path and no structured error type crosses the connection
//! hot path. [`HttpError`] only ever becomes one of the three byte-exact
//! responses below; the macro shape generating them is grounded in the
//! teacher library's `http_errors!` in its own `errors.rs`, narrowed from the
//! teacher's 13-variant JSON taxonomy down to the 3 status codes spec.md
//! names, and switched from JSON bodies to the plain HTML bodies the
//! original source (`http_response.cpp`, inferred from `worker.cpp`'s
//! inline response construction) uses for static-file serving.
//!
//! [`StartupError`] is the ambient-stack addition (§2 of SPEC_FULL.md):
//! ordinary `std::error::Error` plumbing for the handful of fallible
//! operations that happen before a worker enters its loop.

use crate::http::types::Version;
use std::{fmt, io};

/// The three client-visible error outcomes the hot path can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// Accumulated unparseable input exceeded 10 MiB.
    BadRequest,
    /// `stat` on the resolved on-disk path failed.
    NotFound,
    /// Method other than GET/HEAD on a cache miss.
    MethodNotAllowed,
}

macro_rules! http_errors {
    ($($name:ident: $status:literal, $len:literal => $body:literal; )*) => {
        impl HttpError {
            /// Renders the complete HTTP response bytes for this error,
            /// choosing the status line for the request's HTTP version.
            /// These responses always close the connection (`keep-alive`
            /// is never set on an error response — see SPEC_FULL.md's
            /// Open Questions Resolved, item 2).
            pub const fn as_http(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (Self::$name, Version::Http11) => concat!(
                        "HTTP/1.1 ", $status, "\r\n",
                        "Server: hyperstatic\r\n",
                        "Content-Type: text/html\r\n",
                        "Content-Length: ", $len, "\r\n",
                        "Connection: close\r\n",
                        "\r\n",
                        $body
                    ).as_bytes(),
                    (Self::$name, Version::Http10) => concat!(
                        "HTTP/1.0 ", $status, "\r\n",
                        "Server: hyperstatic\r\n",
                        "Content-Type: text/html\r\n",
                        "Content-Length: ", $len, "\r\n",
                        "Connection: close\r\n",
                        "\r\n",
                        $body
                    ).as_bytes(),
                )* }
            }
        }

        // `concat!` can't compute `$body.len()` itself (it only accepts
        // literals, not expressions), so `$len` stays a separate literal —
        // but a mismatch between it and the body it's paired with is now a
        // compile error instead of a silently wrong `Content-Length` header.
        $(
            const _: () = assert!($len == $body.len(), concat!("Content-Length literal does not match body length for ", stringify!($name)));
        )*
    };
}

http_errors! {
    BadRequest: "400 Bad Request", 50
        => "<html><body><h1>400 Bad Request</h1></body></html>";
    NotFound: "404 Not Found", 48
        => "<html><body><h1>404 Not Found</h1></body></html>";
    MethodNotAllowed: "405 Method Not Allowed", 57
        => "<html><body><h1>405 Method Not Allowed</h1></body></html>";
}

/// Fallible errors that can occur before a worker enters its event loop.
/// Never seen on the connection hot path — see module docs. Document-root
/// preload failures are reported directly as `io::Error` in `main`, since
/// that step runs once on the main thread rather than per worker.
#[derive(Debug)]
pub enum StartupError {
    /// Creating or registering the epoll instance failed.
    Socket(io::Error),
    /// `socket`/`setsockopt`/`bind`/`listen` on the worker's listener failed.
    Bind(io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "failed to create epoll instance: {e}"),
            Self::Bind(e) => write!(f, "failed to bind listener: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodies_have_correct_content_length() {
        for (err, expected_len) in [
            (HttpError::BadRequest, 50),
            (HttpError::NotFound, 48),
            (HttpError::MethodNotAllowed, 57),
        ] {
            for version in [Version::Http11, Version::Http10] {
                let resp = err.as_http(version);
                let text = std::str::from_utf8(resp).unwrap();
                let header_end = text.find("\r\n\r\n").unwrap() + 4;
                let body = &text[header_end..];
                assert_eq!(body.len(), expected_len, "{err:?} {version:?}");
                assert!(text.contains(&format!("Content-Length: {expected_len}\r\n")));
            }
        }
    }

    #[test]
    fn errors_close_the_connection() {
        for err in [HttpError::BadRequest, HttpError::NotFound, HttpError::MethodNotAllowed] {
            let resp = err.as_http(Version::Http11);
            let text = std::str::from_utf8(resp).unwrap();
            assert!(text.contains("Connection: close\r\n"));
        }
    }

    #[test]
    fn status_line_matches_version() {
        let resp10 = HttpError::NotFound.as_http(Version::Http10);
        let text = std::str::from_utf8(resp10).unwrap();
        assert!(text.starts_with("HTTP/1.0 404 Not Found\r\n"));

        let resp11 = HttpError::NotFound.as_http(Version::Http11);
        let text = std::str::from_utf8(resp11).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
