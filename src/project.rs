// src/project.rs
//! Project file: a content-addressed request/response cache persisted
//! under the project path. Identical requests across runs are answered
//! from disk instead of the network.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

use crate::error::TemplarError;
use crate::templates::model::ResponseData;

/// A stored response snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl From<&ResponseData> for CachedResponse {
    fn from(r: &ResponseData) -> Self {
        Self {
            status: r.status,
            headers: r.headers.clone(),
            body: r.body.clone(),
        }
    }
}

impl CachedResponse {
    pub fn into_response(self) -> ResponseData {
        ResponseData {
            status: self.status,
            headers: self.headers,
            body: self.body,
            duration_ms: 0,
        }
    }
}

/// Hash of the canonical request bytes, the cache key
pub fn request_hash(method: &str, url: &str, headers: &[(String, String)], body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\x00");
    hasher.update(url.as_bytes());
    let mut sorted: Vec<_> = headers.to_vec();
    sorted.sort();
    for (key, value) in sorted {
        hasher.update(b"\x00");
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
    }
    hasher.update(b"\x00");
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// On-disk cache rooted at the project path, with an in-memory index
pub struct ProjectFile {
    root: PathBuf,
    index: Mutex<HashMap<String, CachedResponse>>,
}

impl ProjectFile {
    /// Open (or create) the cache directory and load existing entries.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TemplarError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            TemplarError::Config(format!(
                "cannot create project path {}: {}",
                root.display(),
                e
            ))
        })?;

        let mut index = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path)
                .map_err(TemplarError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(TemplarError::from))
            {
                Ok(cached) => {
                    index.insert(key.to_string(), cached);
                }
                Err(e) => debug!("skipping unreadable cache entry {}: {}", path.display(), e),
            }
        }

        debug!("project file loaded {} cached responses", index.len());
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn get(&self, hash: &str) -> Option<CachedResponse> {
        self.index
            .lock()
            .expect("project index poisoned")
            .get(hash)
            .cloned()
    }

    /// Store a response; persistence failures degrade to memory-only.
    pub fn put(&self, hash: &str, response: CachedResponse) {
        let path = self.root.join(format!("{}.json", hash));
        match serde_json::to_string(&response) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&path, raw) {
                    debug!("could not persist cache entry {}: {}", path.display(), e);
                }
            }
            Err(e) => debug!("could not serialize cache entry: {}", e),
        }
        self.index
            .lock()
            .expect("project index poisoned")
            .insert(hash.to_string(), response);
    }

    pub fn len(&self) -> usize {
        self.index.lock().expect("project index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
