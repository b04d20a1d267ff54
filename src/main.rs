//! Process entry point: resolve configuration, initialize logging, preload
//! the response cache, spawn one worker per core, and block until a
//! shutdown signal arrives.
//!
//! Grounded in the teacher's `server.rs` (`ctrlc` + `core_affinity` +
//! `thread::Builder` worker spawn, one `SO_REUSEPORT` listener per worker)
//! and `examples/original_source/src/main.cpp`'s startup sequence: parse
//! config, preload the cache once, start N workers, wait for a signal, join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyperstatic::{sys, Config, ResponseCache, Worker};

fn main() {
    let config = Config::from_args(std::env::args());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    sys::ignore_sigpipe();

    let cache = match ResponseCache::preload(&config.doc_root) {
        Ok(cache) => cache,
        Err(err) => {
            tracing::error!(error = %err, doc_root = %config.doc_root.display(), "failed to preload document root");
            std::process::exit(1);
        }
    };
    tracing::info!(entries = cache.len(), doc_root = %config.doc_root.display(), "response cache preloaded");
    let cache = Arc::new(cache);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received, draining active connections");
        shutdown_handler.store(true, Ordering::Release);
    }) {
        tracing::warn!(error = %err, "failed to install signal handler");
    }

    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    tracing::info!(workers = config.workers, port = config.port, "starting workers");

    let mut handles = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        let config = config.clone();
        let cache = cache.clone();
        let shutdown = shutdown.clone();
        let core_id = if core_ids.is_empty() { None } else { Some(core_ids[id % core_ids.len()]) };

        let handle = std::thread::Builder::new()
            .name(format!("hyperstatic-worker-{id}"))
            .spawn(move || {
                if let Some(core_id) = core_id {
                    core_affinity::set_for_current(core_id);
                }

                let mut worker = match Worker::new(id, &config, &cache) {
                    Ok(worker) => worker,
                    Err(err) => {
                        tracing::error!(worker = id, error = %err, "failed to start worker");
                        return;
                    }
                };
                tracing::info!(worker = id, "entering event loop");
                worker.run(&shutdown);
                tracing::info!(worker = id, "exited event loop");
            })
            .expect("failed to spawn worker thread");

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
}
