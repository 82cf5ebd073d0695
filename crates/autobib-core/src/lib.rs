use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub mod archive;
pub mod cache;
pub mod catalog;
pub mod config_file;
pub mod context;
pub mod issue;
pub mod locate;
pub mod pages;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod record;
pub mod resolver;
pub mod retrieval;
pub mod scoring;
pub mod toc;
mod xml;

pub use archive::{Archive, ArchiveError, Ark, ProbeOutcome};
pub use cache::{CacheTable, ResolutionCache};
pub use context::RunContext;
pub use pipeline::{EntryOutcome, EntryStatus};
pub use rate_limit::RateLimiters;
pub use record::{Article, BibliographicRecord, Book, Collection, Journal, Numbers};
pub use resolver::{Resolution, ResolutionState, Resolver};
pub use retrieval::{DownloadOutcome, Retriever, generate_blocks};
pub use scoring::{Match, ScoreRank, score};

/// Errors surfaced by the resolve → retrieve → clean pipeline.
///
/// Every variant is scoped to one bibliography entry; a batch keeps going.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("parsing error: {0}")]
    Parsing(String),
    #[error("matching error: {0}")]
    Matching(String),
    #[error("download error: {0}")]
    Download(String),
    #[error("extraction error: {0}")]
    Extraction(#[from] autobib_pdf::PdfError),
    #[error("unrecognized table-of-contents format")]
    UnrecognizedToc,
    #[error("unsupported record kind: {0}")]
    UnsupportedRecordKind(&'static str),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Defaults for [`Settings`].
pub mod defaults {
    pub const BASE_URL: &str = "https://gallica.bnf.fr";
    pub const CATALOG_URL: &str = "https://catalogue.bnf.fr/api/SRU";
    pub const TIMEOUT_SECS: u64 = 60;
    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 120;
    pub const MIN_REQUEST_INTERVAL_SECS: f64 = 2.0;
    pub const CHUNK_SIZE: u32 = 100;
    pub const TRIALS: u32 = 3;
    pub const MAX_RATE_LIMIT_BACKOFF_SECS: u64 = 256;
    pub const SKIP_THRESHOLD: f64 = 0.7;
    pub const MIN_CONFIDENCE: f64 = 0.5;
    pub const GIVE_UP: usize = 50;
    pub const EARLY_STOP_AFTER: usize = 4;
    pub const MAX_CANDIDATES: usize = 5;
    pub const WORKERS: usize = 6;
}

/// Knobs for the resolution engine.
#[derive(Debug, Clone)]
pub struct MatchSettings {
    /// Enumeration stops once a candidate scores above this.
    pub skip_threshold: f64,
    /// Matches below this are never selected.
    pub min_confidence: f64,
    /// Maximum catalog hits examined per search.
    pub give_up: usize,
    /// Scored candidates required before the early stop may trigger.
    pub early_stop_after: usize,
    /// Cap on the article candidates kept after scoring.
    pub max_candidates: usize,
    /// Read issue tables of contents; when off every issue goes through OCR.
    pub use_toc: bool,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            skip_threshold: defaults::SKIP_THRESHOLD,
            min_confidence: defaults::MIN_CONFIDENCE,
            give_up: defaults::GIVE_UP,
            early_stop_after: defaults::EARLY_STOP_AFTER,
            max_candidates: defaults::MAX_CANDIDATES,
            use_toc: true,
        }
    }
}

/// Knobs for the retrieval engine and the archive client.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub base_url: String,
    /// SRU endpoint of the bibliographic catalog.
    pub catalog_url: String,
    pub timeout: Duration,
    pub download_timeout: Duration,
    pub min_request_interval: Duration,
    pub chunk_size: u32,
    pub trials: u32,
    /// A rate-limit back-off longer than this aborts the download.
    pub max_rate_limit_backoff: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            base_url: defaults::BASE_URL.to_string(),
            catalog_url: defaults::CATALOG_URL.to_string(),
            timeout: Duration::from_secs(defaults::TIMEOUT_SECS),
            download_timeout: Duration::from_secs(defaults::DOWNLOAD_TIMEOUT_SECS),
            min_request_interval: Duration::from_secs_f64(defaults::MIN_REQUEST_INTERVAL_SECS),
            chunk_size: defaults::CHUNK_SIZE,
            trials: defaults::TRIALS,
            max_rate_limit_backoff: Duration::from_secs(defaults::MAX_RATE_LIMIT_BACKOFF_SECS),
        }
    }
}

/// Knobs for what happens to a file once it is downloaded.
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    /// Run the page cleaner at all.
    pub post_process: bool,
    pub preserve_text: bool,
    pub equal_size: bool,
    /// Fetch archive OCR geometry and crop from it.
    pub ocr_bounds: bool,
    pub skip_existing: bool,
    /// Delete the raw download after cleaning.
    pub clean: bool,
    /// Drop the archive's cover page from the output.
    pub suppress_cover: bool,
    pub workers: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            post_process: true,
            preserve_text: true,
            equal_size: false,
            ocr_bounds: true,
            skip_existing: false,
            clean: true,
            suppress_cover: false,
            workers: defaults::WORKERS,
        }
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub matching: MatchSettings,
    pub retrieval: RetrievalSettings,
    pub processing: ProcessingSettings,
    /// Path to the persistent cache. `None` keeps the cache in memory.
    pub cache_path: Option<PathBuf>,
    /// Skip the cached-resolution fast path. Results are still written.
    pub ignore_cache: bool,
}

impl Settings {
    /// Apply a config file over the built-in defaults.
    pub fn from_config(file: &config_file::ConfigFile) -> Self {
        let mut settings = Settings::default();
        if let Some(a) = &file.archive {
            if let Some(v) = &a.base_url {
                settings.retrieval.base_url = v.trim_end_matches('/').to_string();
            }
            if let Some(v) = &a.catalog_url {
                settings.retrieval.catalog_url = v.clone();
            }
            if let Some(v) = a.timeout_secs {
                settings.retrieval.timeout = Duration::from_secs(v);
            }
            if let Some(v) = a.download_timeout_secs {
                settings.retrieval.download_timeout = Duration::from_secs(v);
            }
            if let Some(v) = a.min_request_interval_secs {
                settings.retrieval.min_request_interval = Duration::from_secs_f64(v.max(0.001));
            }
        }
        if let Some(r) = &file.retrieval {
            if let Some(v) = r.chunk_size {
                settings.retrieval.chunk_size = v.max(1);
            }
            if let Some(v) = r.trials {
                settings.retrieval.trials = v.max(1);
            }
            if let Some(v) = r.max_rate_limit_backoff_secs {
                settings.retrieval.max_rate_limit_backoff = Duration::from_secs(v);
            }
        }
        if let Some(m) = &file.matching {
            if let Some(v) = m.skip_threshold {
                settings.matching.skip_threshold = v;
            }
            if let Some(v) = m.min_confidence {
                settings.matching.min_confidence = v;
            }
            if let Some(v) = m.give_up {
                settings.matching.give_up = v;
            }
            if let Some(v) = m.use_toc {
                settings.matching.use_toc = v;
            }
        }
        if let Some(c) = &file.cache {
            if c.disabled == Some(true) {
                settings.cache_path = None;
            } else {
                settings.cache_path = c
                    .path
                    .as_ref()
                    .map(PathBuf::from)
                    .or_else(config_file::default_cache_path);
            }
        } else {
            settings.cache_path = config_file::default_cache_path();
        }
        if let Some(p) = &file.processing {
            if let Some(v) = p.preserve_text {
                settings.processing.preserve_text = v;
            }
            if let Some(v) = p.equal_size {
                settings.processing.equal_size = v;
            }
            if let Some(v) = p.ocr_bounds {
                settings.processing.ocr_bounds = v;
            }
            if let Some(v) = p.skip_existing {
                settings.processing.skip_existing = v;
            }
            if let Some(v) = p.workers {
                settings.processing.workers = v.max(1);
            }
        }
        settings
    }

    /// Overlay `AUTOBIB_*` variables read through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(var = name, value = %raw, "ignoring unparseable environment value");
                    None
                }
            }
        }

        if let Some(v) = lookup("AUTOBIB_BASE_URL") {
            self.retrieval.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = parse::<u64>("AUTOBIB_TIMEOUT_SECS", lookup("AUTOBIB_TIMEOUT_SECS")) {
            self.retrieval.timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u32>("AUTOBIB_CHUNK_SIZE", lookup("AUTOBIB_CHUNK_SIZE")) {
            self.retrieval.chunk_size = v.max(1);
        }
        if let Some(v) = parse::<f64>("AUTOBIB_MIN_CONFIDENCE", lookup("AUTOBIB_MIN_CONFIDENCE")) {
            self.matching.min_confidence = v;
        }
        if let Some(v) = parse::<usize>("AUTOBIB_WORKERS", lookup("AUTOBIB_WORKERS")) {
            self.processing.workers = v.max(1);
        }
        if let Some(v) = lookup("AUTOBIB_CACHE_PATH") {
            self.cache_path = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_file::{ArchiveConfig, CacheConfig, ConfigFile, MatchingConfig};
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.retrieval.chunk_size, 100);
        assert_eq!(s.retrieval.min_request_interval, Duration::from_secs(2));
        assert_eq!(s.matching.skip_threshold, 0.7);
        assert_eq!(s.matching.min_confidence, 0.5);
        assert_eq!(s.matching.early_stop_after, 4);
        assert_eq!(s.processing.workers, 6);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let file = ConfigFile {
            archive: Some(ArchiveConfig {
                base_url: Some("http://localhost:9000/".into()),
                timeout_secs: Some(5),
                ..Default::default()
            }),
            matching: Some(MatchingConfig {
                min_confidence: Some(0.8),
                ..Default::default()
            }),
            cache: Some(CacheConfig {
                disabled: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let s = Settings::from_config(&file);
        assert_eq!(s.retrieval.base_url, "http://localhost:9000");
        assert_eq!(s.retrieval.timeout, Duration::from_secs(5));
        assert_eq!(s.matching.min_confidence, 0.8);
        assert!(s.cache_path.is_none());
    }

    #[test]
    fn env_overrides_config() {
        let env: HashMap<&str, &str> = [
            ("AUTOBIB_CHUNK_SIZE", "25"),
            ("AUTOBIB_WORKERS", "not a number"),
            ("AUTOBIB_CACHE_PATH", "/tmp/x.db"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.retrieval.chunk_size, 25);
        assert_eq!(s.processing.workers, 6);
        assert_eq!(s.cache_path, Some(PathBuf::from("/tmp/x.db")));
    }
}
