//! File-backing collaborators for the read-only filesystem.
//!
//! `path_open` resolves a file by asking a [`FileBacking`] for its whole
//! contents in one blocking call; the backing hands out its own descriptor
//! number, which is passed back to [`FileBacking::close`] when the guest
//! closes the file.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use spin::Mutex;

/// A file fetched from a backing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    /// Backing-side descriptor, passed back on close.
    pub fd: u32,
    /// Whole file contents.
    pub data: Vec<u8>,
}

/// Failure to fetch a file.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Source of file contents for `path_open`.
pub trait FileBacking {
    /// Fetch a file by its root-relative name. May block.
    fn open(&mut self, filename: &str) -> Result<FilePayload, FetchError>;

    /// Release a backing-side descriptor.
    fn close(&mut self, fd: u32);
}

// ---------------------------------------------------------------------------
// In-memory backing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryFiles {
    files: BTreeMap<String, Vec<u8>>,
    open: BTreeSet<u32>,
    closed: Vec<u32>,
    next_fd: u32,
}

/// Backing serving a preloaded set of files.
///
/// Clones share state, so a caller can keep one clone to inspect which
/// descriptors were opened and closed.
#[derive(Debug, Default, Clone)]
pub struct MemoryBacking {
    inner: Arc<Mutex<MemoryFiles>>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`MemoryBacking::insert`].
    pub fn with_file(self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    /// Add or replace a file.
    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        let key = name.trim_start_matches('/').to_string();
        self.inner.lock().files.insert(key, data.into());
    }

    /// Descriptors currently open.
    pub fn open_fds(&self) -> Vec<u32> {
        self.inner.lock().open.iter().copied().collect()
    }

    /// Descriptors closed so far, in close order.
    pub fn closed_fds(&self) -> Vec<u32> {
        self.inner.lock().closed.clone()
    }
}

impl FileBacking for MemoryBacking {
    fn open(&mut self, filename: &str) -> Result<FilePayload, FetchError> {
        let mut inner = self.inner.lock();
        let data = inner
            .files
            .get(filename)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(filename.to_string()))?;
        // Backing-side numbering starts high so it never looks like a guest fd.
        let fd = 100 + inner.next_fd;
        inner.next_fd += 1;
        inner.open.insert(fd);
        Ok(FilePayload { fd, data })
    }

    fn close(&mut self, fd: u32) {
        let mut inner = self.inner.lock();
        if inner.open.remove(&fd) {
            inner.closed.push(fd);
        }
    }
}

// ---------------------------------------------------------------------------
// Directory backing
// ---------------------------------------------------------------------------

/// Backing serving files below a local directory.
#[derive(Debug)]
pub struct DirBacking {
    root: PathBuf,
    open: BTreeSet<u32>,
    next_fd: u32,
}

impl DirBacking {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirBacking {
            root: root.into(),
            open: BTreeSet::new(),
            next_fd: 1,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of descriptors not yet closed.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    fn resolve(&self, filename: &str) -> Option<PathBuf> {
        let relative = Path::new(filename);
        let confined = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined || filename.is_empty() {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl FileBacking for DirBacking {
    fn open(&mut self, filename: &str) -> Result<FilePayload, FetchError> {
        let path = self
            .resolve(filename)
            .ok_or_else(|| FetchError::NotFound(filename.to_string()))?;
        let data = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound(filename.to_string()),
            _ => FetchError::Transport(format!("{}: {}", path.display(), e)),
        })?;

        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd);
        log::debug!("[wajs:fs] open {} -> fd {} ({} bytes)", path.display(), fd, data.len());
        Ok(FilePayload { fd, data })
    }

    fn close(&mut self, fd: u32) {
        if self.open.remove(&fd) {
            log::debug!("[wajs:fs] close fd {}", fd);
        } else {
            log::warn!("[wajs:fs] close of unknown fd {}", fd);
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP backing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenResponse {
    fd: u32,
    payload: OpenPayload,
}

#[derive(Debug, Deserialize)]
struct OpenPayload {
    data: Vec<u8>,
}

/// Backing talking to the file server's `/fd_open` and `/fd_close` routes.
#[derive(Debug, Clone)]
pub struct HttpBacking {
    base_url: String,
    timeout: Duration,
}

impl HttpBacking {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        HttpBacking {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, route: &str, key: &str, value: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}/{}", self.base_url, route);
        let resp = ureq::get(&url)
            .query(key, value)
            .config()
            .timeout_global(Some(self.timeout))
            .http_status_as_error(false)
            .build()
            .call()
            .map_err(|e| match e {
                ureq::Error::Timeout(_) => FetchError::Timeout,
                other => FetchError::Transport(other.to_string()),
            })?;

        let status: u16 = resp.status().into();
        if status == 404 {
            return Err(FetchError::NotFound(value.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FetchError::Protocol(format!("{} returned HTTP {}", route, status)));
        }

        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(body)
    }
}

impl FileBacking for HttpBacking {
    fn open(&mut self, filename: &str) -> Result<FilePayload, FetchError> {
        let body = self.get("fd_open", "filename", filename)?;
        let parsed = parse_open_response(&body)?;
        log::debug!(
            "[wajs:fs] fetched {} -> fd {} ({} bytes)",
            filename,
            parsed.fd,
            parsed.data.len()
        );
        Ok(parsed)
    }

    fn close(&mut self, fd: u32) {
        if let Err(e) = self.get("fd_close", "fd", &fd.to_string()) {
            log::warn!("[wajs:fs] fd_close {} failed: {}", fd, e);
        }
    }
}

/// Parse the `/fd_open` JSON body.
fn parse_open_response(body: &[u8]) -> Result<FilePayload, FetchError> {
    let response: OpenResponse =
        serde_json::from_slice(body).map_err(|e| FetchError::Protocol(e.to_string()))?;
    Ok(FilePayload {
        fd: response.fd,
        data: response.payload.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backing_open_close() {
        let backing = MemoryBacking::new().with_file("data.bin", vec![1, 2, 3]);
        let mut handle = backing.clone();

        let payload = handle.open("data.bin").unwrap();
        assert_eq!(payload.data, vec![1, 2, 3]);
        assert_eq!(backing.open_fds(), vec![payload.fd]);

        handle.close(payload.fd);
        assert!(backing.open_fds().is_empty());
        assert_eq!(backing.closed_fds(), vec![payload.fd]);
    }

    #[test]
    fn test_memory_backing_missing() {
        let mut backing = MemoryBacking::new();
        assert!(matches!(backing.open("nope"), Err(FetchError::NotFound(_))));
    }

    #[test]
    fn test_memory_backing_strips_leading_slash() {
        let mut backing = MemoryBacking::new().with_file("/a/b.txt", "hi");
        assert_eq!(backing.open("a/b.txt").unwrap().data, b"hi".to_vec());
    }

    #[test]
    fn test_dir_backing_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/level.txt"), b"level one").unwrap();

        let mut backing = DirBacking::new(dir.path());
        let payload = backing.open("assets/level.txt").unwrap();
        assert_eq!(payload.data, b"level one".to_vec());
        assert_eq!(backing.open_count(), 1);

        backing.close(payload.fd);
        assert_eq!(backing.open_count(), 0);
    }

    #[test]
    fn test_dir_backing_refuses_escape() {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = DirBacking::new(dir.path().join("root"));
        assert!(matches!(
            backing.open("../secret"),
            Err(FetchError::NotFound(_))
        ));
        assert!(matches!(
            backing.open("/etc/passwd"),
            Err(FetchError::NotFound(_))
        ));
    }

    #[test]
    fn test_dir_backing_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = DirBacking::new(dir.path());
        assert!(matches!(backing.open("missing"), Err(FetchError::NotFound(_))));
    }

    #[test]
    fn test_parse_open_response() {
        let body = br#"{"fd": 7, "payload": {"type": "Buffer", "data": [104, 105]}}"#;
        let payload = parse_open_response(body).unwrap();
        assert_eq!(payload.fd, 7);
        assert_eq!(payload.data, b"hi".to_vec());
    }

    #[test]
    fn test_parse_open_response_rejects_garbage() {
        assert!(matches!(
            parse_open_response(b"<html>"),
            Err(FetchError::Protocol(_))
        ));
    }

    #[test]
    fn test_http_backing_unreachable() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let mut backing = HttpBacking::new("http://127.0.0.1:9/", Duration::from_millis(500));
        assert_eq!(backing.base_url(), "http://127.0.0.1:9");
        assert!(backing.open("a.txt").is_err());
    }
}
