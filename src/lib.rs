//! hyperstatic — a static-content HTTP/1.1 file server built for very high
//! single-host throughput.
//!
//! # Architecture
//!
//! The server starts N independent workers (one per hardware thread by
//! default). Each worker owns:
//!
//! - its own epoll instance ([`worker`]),
//! - its own listening socket, bound with `SO_REUSEADDR`/`SO_REUSEPORT` so the
//!   kernel load-balances accepted connections across workers,
//! - its own connection object pool ([`pool`]),
//! - its own active-connection index.
//!
//! Workers share, read-only, a [response cache](cache::ResponseCache) built
//! once at startup by walking the document root and pre-encoding complete
//! HTTP/1.1 200 responses for every small regular file.
//!
//! There is no cross-worker coordination on the hot path and no locking: the
//! cache is immutable for the lifetime of all workers, and everything else is
//! worker-local.
//!
//! # Non-goals
//!
//! Chunked transfer decoding, HTTP/2, range requests, compression,
//! authentication, access logging, TLS, clustering, and any write traffic
//! (`PUT`/`POST`/`DELETE` are rejected with 405).
pub mod cache;
pub mod config;
pub mod connection;
pub mod errors;
pub mod http;
pub mod pool;
pub mod sys;
pub mod worker;

pub use cache::ResponseCache;
pub use config::Config;
pub use connection::Connection;
pub use pool::ConnectionPool;
pub use worker::Worker;
