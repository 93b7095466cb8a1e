use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::store::StorageBackend;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub chunking: Option<ChunkingConfig>,
    pub concurrency: Option<ConcurrencyConfig>,
    pub extraction: Option<ExtractionConfig>,
    pub pipeline: Option<PipelineConfig>,
    pub progress: Option<ProgressConfig>,
    pub storage: Option<StorageFileConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size_pages: Option<usize>,
    pub page_threshold: Option<usize>,
    pub size_threshold_mb: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub per_document: Option<usize>,
    pub global_calls: Option<usize>,
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub soft_time_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageFileConfig {
    pub backend: Option<StorageBackend>,
    pub database_path: Option<String>,
    pub upload_dir: Option<String>,
}

/// Platform config directory path: `<config_dir>/pagewise/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pagewise").join("config.toml"))
}

/// Load config by cascading CWD `.pagewise.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".pagewise.toml"));

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
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

/// Field-wise merge of one optional section.
fn merge_section<T>(
    base: Option<T>,
    overlay: Option<T>,
    fields: impl FnOnce(T, T) -> T,
) -> Option<T> {
    match (base, overlay) {
        (None, None) => None,
        (Some(b), None) => Some(b),
        (None, Some(o)) => Some(o),
        (Some(b), Some(o)) => Some(fields(b, o)),
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        chunking: merge_section(base.chunking, overlay.chunking, |b, o| ChunkingConfig {
            chunk_size_pages: o.chunk_size_pages.or(b.chunk_size_pages),
            page_threshold: o.page_threshold.or(b.page_threshold),
            size_threshold_mb: o.size_threshold_mb.or(b.size_threshold_mb),
        }),
        concurrency: merge_section(base.concurrency, overlay.concurrency, |b, o| {
            ConcurrencyConfig {
                per_document: o.per_document.or(b.per_document),
                global_calls: o.global_calls.or(b.global_calls),
                requests_per_minute: o.requests_per_minute.or(b.requests_per_minute),
            }
        }),
        extraction: merge_section(base.extraction, overlay.extraction, |b, o| {
            ExtractionConfig {
                timeout_secs: o.timeout_secs.or(b.timeout_secs),
                max_attempts: o.max_attempts.or(b.max_attempts),
                model: o.model.or(b.model),
                api_key: o.api_key.or(b.api_key),
                temperature: o.temperature.or(b.temperature),
                max_output_tokens: o.max_output_tokens.or(b.max_output_tokens),
            }
        }),
        pipeline: merge_section(base.pipeline, overlay.pipeline, |b, o| PipelineConfig {
            soft_time_limit_secs: o.soft_time_limit_secs.or(b.soft_time_limit_secs),
        }),
        progress: merge_section(base.progress, overlay.progress, |b, o| ProgressConfig {
            ttl_secs: o.ttl_secs.or(b.ttl_secs),
        }),
        storage: merge_section(base.storage, overlay.storage, |b, o| StorageFileConfig {
            backend: o.backend.or(b.backend),
            database_path: o.database_path.or(b.database_path),
            upload_dir: o.upload_dir.or(b.upload_dir),
        }),
    }
}

/// Apply file values over `config`. Absent values leave `config` unchanged.
pub fn apply(file: &ConfigFile, config: &mut Config) {
    if let Some(c) = &file.chunking {
        if let Some(v) = c.chunk_size_pages {
            config.chunk_size_pages = v;
        }
        if let Some(v) = c.page_threshold {
            config.page_threshold = v;
        }
        if let Some(v) = c.size_threshold_mb {
            config.size_threshold_mb = v;
        }
    }
    if let Some(c) = &file.concurrency {
        if let Some(v) = c.per_document {
            config.per_document_concurrency = v;
        }
        if let Some(v) = c.global_calls {
            config.global_concurrency = v;
        }
        if c.requests_per_minute.is_some() {
            config.requests_per_minute = c.requests_per_minute;
        }
    }
    if let Some(e) = &file.extraction {
        if let Some(v) = e.timeout_secs {
            config.extraction_timeout_secs = v;
        }
        if let Some(v) = e.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = &e.model {
            config.model = v.clone();
        }
        if e.api_key.is_some() {
            config.api_key = e.api_key.clone();
        }
        if let Some(v) = e.temperature {
            config.temperature = v;
        }
        if let Some(v) = e.max_output_tokens {
            config.max_output_tokens = v;
        }
    }
    if let Some(v) = file.pipeline.as_ref().and_then(|p| p.soft_time_limit_secs) {
        config.soft_time_limit_secs = v;
    }
    if let Some(v) = file.progress.as_ref().and_then(|p| p.ttl_secs) {
        config.progress_ttl_secs = v;
    }
    if let Some(s) = &file.storage {
        if let Some(v) = s.backend {
            config.storage.backend = v;
        }
        if let Some(v) = &s.database_path {
            config.storage.database_path = PathBuf::from(v);
        }
        if let Some(v) = &s.upload_dir {
            config.storage.upload_dir = PathBuf::from(v);
        }
    }
}

impl From<&Config> for ConfigFile {
    /// Every value of `config` except the API key, which stays in the environment.
    fn from(config: &Config) -> Self {
        ConfigFile {
            chunking: Some(ChunkingConfig {
                chunk_size_pages: Some(config.chunk_size_pages),
                page_threshold: Some(config.page_threshold),
                size_threshold_mb: Some(config.size_threshold_mb),
            }),
            concurrency: Some(ConcurrencyConfig {
                per_document: Some(config.per_document_concurrency),
                global_calls: Some(config.global_concurrency),
                requests_per_minute: config.requests_per_minute,
            }),
            extraction: Some(ExtractionConfig {
                timeout_secs: Some(config.extraction_timeout_secs),
                max_attempts: Some(config.max_attempts),
                model: Some(config.model.clone()),
                api_key: None,
                temperature: Some(config.temperature),
                max_output_tokens: Some(config.max_output_tokens),
            }),
            pipeline: Some(PipelineConfig {
                soft_time_limit_secs: Some(config.soft_time_limit_secs),
            }),
            progress: Some(ProgressConfig {
                ttl_secs: Some(config.progress_ttl_secs),
            }),
            storage: Some(StorageFileConfig {
                backend: Some(config.storage.backend),
                database_path: Some(config.storage.database_path.display().to_string()),
                upload_dir: Some(config.storage.upload_dir.display().to_string()),
            }),
        }
    }
}

/// Save `config` to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
    Ok(path)
}
