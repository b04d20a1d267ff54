//! The immutable, startup-built response cache: a map from URL path to a
//! complete, pre-encoded HTTP/1.1 200 response byte sequence.
//!
//! Grounded in `examples/original_source/src/response_cache.h` (the
//! directory walk, the 1 MiB cutoff, the `/index.html` → `/` alias) and the
//! teacher's style of building an immutable lookup structure once at
//! startup and sharing it read-only across workers (no locking needed,
//! same as the teacher's `Router` being cloned into each worker thread
//! rather than mutexed).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Static files larger than this are served via sendfile on a cache miss
/// instead of being pre-materialized (spec.md §3).
pub const MAX_CACHED_FILE_SIZE: u64 = 1024 * 1024;

const SERVER_HEADER: &str = "hyperstatic";

/// Built once by [`ResponseCache::preload`] before any worker starts, then
/// shared read-only for the lifetime of the process.
pub struct ResponseCache {
    entries: HashMap<String, Vec<u8>>,
}

impl ResponseCache {
    /// Walks `doc_root` and builds complete response byte sequences for
    /// every regular file at most [`MAX_CACHED_FILE_SIZE`] bytes. A path
    /// ending in `/index.html` is additionally aliased to its directory
    /// path ending in `/`, matching spec.md §4.3.
    ///
    /// Runs synchronously on the calling (main) thread; may block on disk,
    /// which is acceptable since it happens once, before any worker is
    /// spawned.
    pub fn preload(doc_root: &Path) -> io::Result<Self> {
        let mut entries = HashMap::new();
        if doc_root.is_dir() {
            walk_directory(doc_root, doc_root, &mut entries)?;
        }
        Ok(Self { entries })
    }

    /// Looks up a request path; empty or trailing-slash paths are treated
    /// as `index.html` within that directory before the exact-match lookup.
    pub fn lookup(&self, request_path: &str) -> Option<&[u8]> {
        let key = normalize_lookup_key(request_path);
        self.entries.get(key.as_ref()).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_lookup_key(request_path: &str) -> std::borrow::Cow<'_, str> {
    if request_path.is_empty() || request_path.ends_with('/') {
        std::borrow::Cow::Owned(format!("{request_path}index.html"))
    } else {
        std::borrow::Cow::Borrowed(request_path)
    }
}

fn walk_directory(
    root: &Path,
    dir: &Path,
    entries: &mut HashMap<String, Vec<u8>>,
) -> io::Result<()> {
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        let file_type = dirent.file_type()?;

        if file_type.is_dir() {
            walk_directory(root, &path, entries)?;
        } else if file_type.is_file() {
            insert_file(root, &path, entries);
        }
    }
    Ok(())
}

fn insert_file(root: &Path, path: &Path, entries: &mut HashMap<String, Vec<u8>>) {
    let Ok(metadata) = fs::metadata(path) else { return };
    if metadata.len() > MAX_CACHED_FILE_SIZE {
        return;
    }
    let Ok(body) = fs::read(path) else { return };
    let Some(url_path) = relative_url_path(root, path) else { return };

    let content_type = crate::http::response::content_type_for(path);
    let response = build_cached_response(content_type, &body);

    if let Some(dir_alias) = url_path.strip_suffix("/index.html") {
        entries.insert(format!("{dir_alias}/"), response.clone());
    }
    entries.insert(url_path, response);
}

/// Converts an on-disk path under `root` into a `/`-rooted, forward-slash
/// URL path, e.g. `www/sub/index.html` under root `www` → `/sub/index.html`.
fn relative_url_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut url = String::from("/");
    for (i, component) in rel.components().enumerate() {
        if i > 0 {
            url.push('/');
        }
        url.push_str(component.as_os_str().to_str()?);
    }
    Some(url)
}

fn build_cached_response(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(body.len() + 128);
    response.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    response.extend_from_slice(format!("Server: {SERVER_HEADER}\r\n").as_bytes());
    response.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    response.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    response.extend_from_slice(b"Connection: keep-alive\r\n");
    response.extend_from_slice(b"\r\n");
    response.extend_from_slice(body);
    response
}

/// Builds the path to the on-disk file for a cache-miss request path
/// (spec.md §6: "literal string concatenation", see DESIGN.md's Open
/// Questions Resolved for the `..`-rejection hardening applied only here).
pub fn resolve_disk_path(doc_root: &Path, request_path: &str) -> Option<PathBuf> {
    if request_path.split('/').any(|segment| segment == "..") {
        return None;
    }
    let tail = request_path.strip_prefix('/').unwrap_or(request_path);
    let tail = if tail.is_empty() || request_path.ends_with('/') {
        format!("{tail}index.html")
    } else {
        tail.to_string()
    };
    Some(doc_root.join(tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_doc_root(files: &[(&str, &[u8])]) -> tempfile_dir::TempDir {
        let dir = tempfile_dir::TempDir::new();
        for (rel, contents) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, contents).unwrap();
        }
        dir
    }

    /// Minimal drop-on-scope temp directory helper, in lieu of pulling in
    /// the `tempfile` crate for a handful of cache-build tests.
    mod tempfile_dir {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut path = std::env::temp_dir();
                let unique = format!(
                    "hyperstatic-cache-test-{}-{}",
                    std::process::id(),
                    Box::into_raw(Box::new(0u8)) as usize
                );
                path.push(unique);
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn caches_small_files_and_serves_byte_exact_response() {
        let root = make_doc_root(&[("index.html", b"hello")]);
        let cache = ResponseCache::preload(root.path()).unwrap();

        let bytes = cache.lookup("/").expect("directory alias should hit");
        let text = std::str::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("hello"));

        let direct = cache.lookup("/index.html").unwrap();
        assert_eq!(bytes, direct, "directory alias and direct path must be byte-identical");
    }

    #[test]
    fn skips_files_over_the_size_cutoff() {
        let big = vec![b'x'; (MAX_CACHED_FILE_SIZE + 1) as usize];
        let root = make_doc_root(&[("big.bin", &big)]);
        let cache = ResponseCache::preload(root.path()).unwrap();
        assert!(cache.lookup("/big.bin").is_none());
    }

    #[test]
    fn nested_directories_get_rooted_url_paths() {
        let root = make_doc_root(&[("assets/app.css", b"body{}")]);
        let cache = ResponseCache::preload(root.path()).unwrap();
        assert!(cache.lookup("/assets/app.css").is_some());
    }

    #[test]
    fn empty_and_trailing_slash_paths_resolve_to_index_html() {
        let root = make_doc_root(&[("sub/index.html", b"nested")]);
        let cache = ResponseCache::preload(root.path()).unwrap();
        assert!(cache.lookup("/sub/").is_some());
        assert_eq!(cache.lookup("/sub/"), cache.lookup("/sub/index.html"));
    }

    #[test]
    fn resolve_disk_path_rejects_dotdot_segments() {
        let root = PathBuf::from("/srv/www");
        assert!(resolve_disk_path(&root, "/../etc/passwd").is_none());
        assert!(resolve_disk_path(&root, "/a/../b").is_none());
        assert_eq!(resolve_disk_path(&root, "/ok.txt"), Some(root.join("ok.txt")));
    }

    #[test]
    fn resolve_disk_path_maps_trailing_slash_to_index_html() {
        let root = PathBuf::from("/srv/www");
        assert_eq!(resolve_disk_path(&root, "/sub/"), Some(root.join("sub/index.html")));
        assert_eq!(resolve_disk_path(&root, ""), Some(root.join("index.html")));
    }
}
