//! Address normalization.
//!
//! A small, directly-testable parser rather than a URL-parsing crate, since
//! this is in the end a `host:port` split with two defaults and a Unix-socket
//! escape hatch.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::DEFAULT_PORT;

/// A normalized service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `host:port`, to be dialed over TCP.
    Tcp { host: String, port: u16 },
    /// An absolute filesystem path, to be dialed as a Unix domain socket.
    Unix(PathBuf),
}

impl Address {
    /// Parses `s` as `host:port`, `host`, `:port`, empty (→ `localhost:6379`),
    /// or an absolute path (→ Unix domain socket, normalized).
    pub fn parse(s: &str) -> Address {
        if s.starts_with('/') {
            return Address::Unix(normalize_path(s));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => (s, ""),
        };

        let host = if host.is_empty() { "localhost" } else { host };
        let port: u16 = if port.is_empty() {
            DEFAULT_PORT
        } else {
            port.parse().unwrap_or(DEFAULT_PORT)
        };

        Address::Tcp {
            host: host.to_string(),
            port,
        }
    }

    /// `true` if this address dials a Unix domain socket.
    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Unix(path) => path.display().fmt(f),
        }
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address::parse(s)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Address::parse(&s)
    }
}

/// Collapses `..` and duplicate separators the way a shell would, without
/// touching the filesystem (the path need not exist yet when a `Config` is built).
fn normalize_path(s: &str) -> PathBuf {
    let mut out: Vec<&str> = Vec::new();
    for component in s.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let mut normalized = String::from("/");
    normalized.push_str(&out.join("/"));
    PathBuf::from(normalized)
}

/// Exposed for callers that already hold a `Path` (e.g. discovered via config) and
/// want to force Unix-socket interpretation regardless of a leading slash.
impl From<&Path> for Address {
    fn from(p: &Path) -> Self {
        Address::Unix(p.to_path_buf())
    }
}
