use std::sync::Arc;

use crate::archive::gallica::{self, Gallica};
use crate::archive::Archive;
use crate::cache::ResolutionCache;
use crate::rate_limit::RateLimiters;
use crate::{CoreError, Settings};

/// Everything one run shares: settings, HTTP client, per-host limiters, the
/// cache and the archive. Built once at startup and passed around as
/// `Arc<RunContext>`.
pub struct RunContext {
    pub settings: Settings,
    pub client: reqwest::Client,
    pub limiters: Arc<RateLimiters>,
    pub cache: ResolutionCache,
    pub archive: Arc<dyn Archive>,
}

impl RunContext {
    /// Context talking to the real archive.
    pub fn new(settings: Settings) -> Result<Self, CoreError> {
        let client = gallica::build_client()?;
        let limiters = Arc::new(RateLimiters::new(settings.retrieval.min_request_interval));
        let archive = Arc::new(Gallica::new(
            client.clone(),
            limiters.clone(),
            settings.retrieval.clone(),
        ));
        let cache = open_cache(&settings)?;
        Ok(Self {
            settings,
            client,
            limiters,
            cache,
            archive,
        })
    }

    /// Context over any archive implementation, with an in-memory cache
    /// unless the settings name a cache file.
    pub fn with_archive(settings: Settings, archive: Arc<dyn Archive>) -> Result<Self, CoreError> {
        let limiters = Arc::new(RateLimiters::new(settings.retrieval.min_request_interval));
        let cache = open_cache(&settings)?;
        Ok(Self {
            settings,
            client: reqwest::Client::new(),
            limiters,
            cache,
            archive,
        })
    }

    /// Flush persistent state. Call once at shutdown.
    pub fn flush(&self) -> Result<(), CoreError> {
        tracing::debug!(
            hits = self.cache.hits(),
            misses = self.cache.misses(),
            "flushing cache"
        );
        self.cache.flush()
    }
}

fn open_cache(settings: &Settings) -> Result<ResolutionCache, CoreError> {
    match &settings.cache_path {
        Some(path) => ResolutionCache::open(path),
        None => Ok(ResolutionCache::in_memory()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::mock::MockArchive;

    #[test]
    fn mock_context_uses_memory_cache() {
        let ctx = RunContext::with_archive(Settings::default(), Arc::new(MockArchive::new())).unwrap();
        assert!(!ctx.cache.has_persistence());
        ctx.flush().unwrap();
    }

    #[test]
    fn file_cache_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_path: Some(dir.path().join("nested").join("cache.db")),
            ..Settings::default()
        };
        let ctx = RunContext::new(settings).unwrap();
        assert!(ctx.cache.has_persistence());
    }
}
