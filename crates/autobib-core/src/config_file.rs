use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub archive: Option<ArchiveConfig>,
    pub retrieval: Option<RetrievalConfig>,
    pub matching: Option<MatchingConfig>,
    pub cache: Option<CacheConfig>,
    pub processing: Option<ProcessingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub base_url: Option<String>,
    pub catalog_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
    pub min_request_interval_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub chunk_size: Option<u32>,
    pub trials: Option<u32>,
    pub max_rate_limit_backoff_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub skip_threshold: Option<f64>,
    pub min_confidence: Option<f64>,
    pub give_up: Option<usize>,
    pub use_toc: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: Option<String>,
    pub disabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub preserve_text: Option<bool>,
    pub equal_size: Option<bool>,
    pub ocr_bounds: Option<bool>,
    pub skip_existing: Option<bool>,
    pub workers: Option<usize>,
}

/// Platform config directory path: `<config_dir>/autobib/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("autobib").join("config.toml"))
}

/// Platform cache database path: `<cache_dir>/autobib/cache.db`.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("autobib").join("cache.db"))
}

/// Load config by cascading CWD `.autobib.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".autobib.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config");
            None
        }
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        archive: merge_section(base.archive, overlay.archive, |b, o| ArchiveConfig {
            base_url: o.base_url.or(b.base_url),
            catalog_url: o.catalog_url.or(b.catalog_url),
            timeout_secs: o.timeout_secs.or(b.timeout_secs),
            download_timeout_secs: o.download_timeout_secs.or(b.download_timeout_secs),
            min_request_interval_secs: o
                .min_request_interval_secs
                .or(b.min_request_interval_secs),
        }),
        retrieval: merge_section(base.retrieval, overlay.retrieval, |b, o| RetrievalConfig {
            chunk_size: o.chunk_size.or(b.chunk_size),
            trials: o.trials.or(b.trials),
            max_rate_limit_backoff_secs: o
                .max_rate_limit_backoff_secs
                .or(b.max_rate_limit_backoff_secs),
        }),
        matching: merge_section(base.matching, overlay.matching, |b, o| MatchingConfig {
            skip_threshold: o.skip_threshold.or(b.skip_threshold),
            min_confidence: o.min_confidence.or(b.min_confidence),
            give_up: o.give_up.or(b.give_up),
            use_toc: o.use_toc.or(b.use_toc),
        }),
        cache: merge_section(base.cache, overlay.cache, |b, o| CacheConfig {
            path: o.path.or(b.path),
            disabled: o.disabled.or(b.disabled),
        }),
        processing: merge_section(base.processing, overlay.processing, |b, o| {
            ProcessingConfig {
                preserve_text: o.preserve_text.or(b.preserve_text),
                equal_size: o.equal_size.or(b.equal_size),
                ocr_bounds: o.ocr_bounds.or(b.ocr_bounds),
                skip_existing: o.skip_existing.or(b.skip_existing),
                workers: o.workers.or(b.workers),
            }
        }),
    }
}

fn merge_section<T: Default>(
    base: Option<T>,
    overlay: Option<T>,
    f: impl FnOnce(T, T) -> T,
) -> Option<T> {
    match (base, overlay) {
        (None, None) => None,
        (b, o) => Some(f(b.unwrap_or_default(), o.unwrap_or_default())),
    }
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    save_to_path(config, &path)?;
    Ok(path)
}

pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_section_parses() {
        let toml_str = "[matching]\nmin_confidence = 0.6\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        let matching = parsed.matching.unwrap();
        assert_eq!(matching.min_confidence, Some(0.6));
        assert!(matching.skip_threshold.is_none());
        assert!(parsed.archive.is_none());
    }

    #[test]
    fn merge_overlay_wins_field_by_field() {
        let base = ConfigFile {
            archive: Some(ArchiveConfig {
                base_url: Some("https://base".into()),
                timeout_secs: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            archive: Some(ArchiveConfig {
                timeout_secs: Some(90),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay).archive.unwrap();
        assert_eq!(merged.base_url.as_deref(), Some("https://base"));
        assert_eq!(merged.timeout_secs, Some(90));
    }

    #[test]
    fn merge_keeps_absent_sections_absent() {
        let merged = merge(ConfigFile::default(), ConfigFile::default());
        assert!(merged.cache.is_none());
        assert!(merged.processing.is_none());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ConfigFile {
            cache: Some(CacheConfig {
                path: Some("/tmp/cache.db".into()),
                disabled: Some(false),
            }),
            ..Default::default()
        };
        save_to_path(&config, &path).unwrap();
        let loaded = load_from_path(&path).unwrap();
        assert_eq!(loaded.cache.unwrap().path.as_deref(), Some("/tmp/cache.db"));
    }

    #[test]
    fn unparseable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[matching\nmin_confidence = ").unwrap();
        assert!(load_from_path(&path).is_none());
    }
}
