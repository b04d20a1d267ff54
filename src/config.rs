//! Server configuration: CLI-resolved positional arguments plus the internal
//! knobs spec.md calls out explicitly (max events per wake, idle timeout,
//! sendfile toggle).
//!
//! Grounded in `examples/original_source/src/server_config.h`, reshaped into
//! the teacher library's `*Limits` struct-with-`Default` idiom
//! ([`crate::limits`] in the teacher, now folded into this single `Config`
//! since the server is an application rather than a library with
//! independently tunable subsystems).

use std::path::PathBuf;

/// Resolved server configuration.
///
/// Positional fields (`port`, `workers`, `doc_root`) come from the command
/// line; the remaining fields are internal defaults not currently exposed on
/// the CLI, matching spec.md §6 ("internal knobs").
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port every worker's listener binds to.
    pub port: u16,
    /// Number of independent worker threads to spawn.
    pub workers: usize,
    /// Document root static files are served from.
    pub doc_root: PathBuf,
    /// Maximum number of readiness events drained per `epoll_wait` wake.
    pub max_events: usize,
    /// Connections idle longer than this are closed by the periodic sweep.
    pub idle_timeout_ms: u64,
    /// Whether cache-miss large files are streamed via `sendfile(2)` rather
    /// than read into the write buffer.
    pub use_sendfile: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            doc_root: PathBuf::from("./www"),
            max_events: 4096,
            idle_timeout_ms: 60_000,
            use_sendfile: true,
        }
    }
}

impl Config {
    /// Resolves a [`Config`] from up to three positional CLI arguments:
    /// `[port] [workers] [doc_root]`. Unparsable or missing arguments fall
    /// back to [`Config::default`]'s value for that field, mirroring the
    /// original source's tolerant `std::atoi`-based argument walk.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut config = Self::default();
        let mut args = args.into_iter().skip(1);

        if let Some(port) = args.next() {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Some(workers) = args.next() {
            if let Ok(workers) = workers.parse::<usize>() {
                if workers > 0 {
                    config.workers = workers;
                }
            }
        }
        if let Some(doc_root) = args.next() {
            config.doc_root = PathBuf::from(doc_root);
        }

        config
    }
}
