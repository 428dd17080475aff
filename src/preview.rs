//! Host-side preview resources
//!
//! Every encoded buffer shown to the user (original thumbnails, results,
//! overlay and raw masks) is registered here and addressed by a
//! `PreviewUrl`. Each URL must be released exactly once; releasing an
//! unknown or already-released URL is an error.

use crate::error::{ClearcutError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Handle to a registered preview buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PreviewUrl(u64);

impl fmt::Display for PreviewUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:clearcut/{}", self.0)
    }
}

/// Create/release counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreviewStats {
    pub created: usize,
    pub released: usize,
    pub live: usize,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    live: HashMap<PreviewUrl, Arc<[u8]>>,
    created: usize,
    released: usize,
}

/// Shared registry of preview buffers
///
/// Clones refer to the same registry.
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl PreviewRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `bytes` and return its URL
    pub fn create(&self, bytes: impl Into<Arc<[u8]>>) -> PreviewUrl {
        let mut registry = self.lock();
        registry.next_id += 1;
        let url = PreviewUrl(registry.next_id);
        registry.live.insert(url, bytes.into());
        registry.created += 1;
        trace!(%url, "Preview created");
        url
    }

    /// Release a URL
    ///
    /// # Errors
    /// Returns `ClearcutError::Internal` for unknown or already released URLs
    pub fn release(&self, url: PreviewUrl) -> Result<()> {
        let mut registry = self.lock();
        if registry.live.remove(&url).is_none() {
            return Err(ClearcutError::internal(format!(
                "Preview {} released twice or never created",
                url
            )));
        }
        registry.released += 1;
        trace!(%url, "Preview released");
        Ok(())
    }

    /// Bytes behind a live URL
    #[must_use]
    pub fn get(&self, url: PreviewUrl) -> Option<Arc<[u8]>> {
        self.lock().live.get(&url).cloned()
    }

    #[must_use]
    pub fn is_live(&self, url: PreviewUrl) -> bool {
        self.lock().live.contains_key(&url)
    }

    #[must_use]
    pub fn stats(&self) -> PreviewStats {
        let registry = self.lock();
        PreviewStats {
            created: registry.created,
            released: registry.released,
            live: registry.live.len(),
        }
    }
}
