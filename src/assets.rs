//! Static files served verbatim from memory.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, warn};

/// A static file loaded at startup.
#[derive(Debug, Clone)]
pub struct Asset {
    pub content_type: &'static str,
    pub body: Bytes,
}

/// Every regular file of the static directory, keyed by lower-cased file name.
#[derive(Debug, Clone, Default)]
pub struct StaticAssets {
    files: HashMap<String, Asset>,
}

/// Guesses a `Content-Type` from the file extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "webmanifest" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

impl StaticAssets {
    /// Reads every regular file directly inside `dir`.
    ///
    /// A missing directory yields an empty set; unreadable files are logged
    /// and skipped.
    pub fn load(dir: &Path) -> Self {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "static directory not readable");
                return Self::default();
            }
        };

        let files = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_lowercase();
                match std::fs::read(entry.path()) {
                    Ok(body) => {
                        debug!(file = %name, bytes = body.len(), "loaded static asset");
                        Some((name, body))
                    }
                    Err(e) => {
                        warn!(file = %name, error = %e, "failed to read static asset");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        let mut assets = Self::default();
        for (name, body) in files {
            assets.insert(name, body);
        }
        assets
    }

    /// Registers an asset under the lower-cased `name`.
    pub fn insert(&mut self, name: impl Into<String>, body: impl Into<Bytes>) {
        let name = name.into().to_lowercase();
        let asset = Asset {
            content_type: content_type_for(&name),
            body: body.into(),
        };
        self.files.insert(name, asset);
    }

    /// Looks up a request path: lower-cased, with leading slashes removed.
    /// The root path never matches.
    pub fn get(&self, path: &str) -> Option<&Asset> {
        let key = path.trim_start_matches('/').to_lowercase();
        if key.is_empty() {
            return None;
        }
        self.files.get(&key)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
