//! Configuration management for the file reader server
//!
//! Everything comes from environment variables (optionally via `.env`).
//! Unset variables take their defaults; malformed values are errors.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::cache::{CacheConfig, NamespaceSplit};
use crate::ocr::{OcrConfig, OcrProviderKind};
use crate::parsers::{ArchiveLimits, ParserSettings};
use crate::reader::ReaderConfig;

const MB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;

/// External conversions get three quarters of the per-file budget, so they
/// stop and clean up before the reader abandons the file.
fn conversion_timeout(file_timeout: Duration) -> Duration {
    file_timeout.saturating_sub(file_timeout / 4)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// How the tool protocol is exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Stdio,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "stdio" => Ok(Self::Stdio),
            other => Err(format!("unknown transport {other}, expected http or stdio")),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Stdio => f.write_str("stdio"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

/// Which local files may be read
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Empty means unrestricted
    pub allowed_dirs: Vec<PathBuf>,
    pub allow_relative: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub reader: ReaderConfig,
    pub storage: StorageConfig,
    pub parsers: ParserSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3001,
                transport: Transport::Http,
            },
            cache: CacheConfig::default(),
            reader: ReaderConfig::default(),
            storage: StorageConfig::default(),
            parsers: ParserSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let defaults = Config::default();

        let cache = CacheConfig {
            root_dir: PathBuf::from(vars.string("CACHE_ROOT_DIR", "cache")),
            total_size_bytes: vars.scaled("TOTAL_CACHE_SIZE_MB", 500, MB)?,
            split: NamespaceSplit {
                parsed: vars.parse("CACHE_SPLIT_PARSED", 0.6)?,
                image: vars.parse("CACHE_SPLIT_IMAGE", 0.2)?,
                archive: vars.parse("CACHE_SPLIT_ARCHIVE", 0.2)?,
            },
            // 0 disables age-based expiry
            retention: match vars.scaled("CACHE_EXPIRE_DAYS", 30, DAY_SECS)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            sweep_interval: Duration::from_secs(vars.parse("CACHE_SWEEP_INTERVAL_SECS", 3600)?),
        };

        let reader = ReaderConfig {
            max_file_size: vars.scaled("FILE_READER_MAX_FILE_SIZE_MB", 20, MB)?,
            max_files_per_request: vars.parse("FILE_READER_MAX_FILES_PER_REQUEST", 10)?,
            max_workers: vars.parse("FILE_READER_MAX_WORKERS", 5)?,
            timeout: Duration::from_secs(vars.parse("FILE_READER_TIMEOUT_SECS", 120)?),
            min_content_length: vars.parse("FILE_READER_MIN_CONTENT_LENGTH", 10)?,
        };

        let storage = StorageConfig {
            allowed_dirs: vars
                .get("LOCAL_FILE_ALLOWED_DIRECTORIES")
                .map(|dirs| {
                    dirs.split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            allow_relative: vars.flag("LOCAL_FILE_ALLOW_RELATIVE_PATHS")?,
        };

        let ocr_defaults = OcrConfig::default();
        let ocr = OcrConfig {
            provider: vars.parse("OCR_PROVIDER", OcrProviderKind::None)?,
            openai_api_key: vars.get("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()),
            openai_base_url: vars.string("OPENAI_BASE_URL", &ocr_defaults.openai_base_url),
            openai_model: vars.string("OPENAI_MODEL", &ocr_defaults.openai_model),
            ollama_url: vars.string("OLLAMA_URL", &ocr_defaults.ollama_url),
            ollama_model: vars.string("OLLAMA_MODEL", &ocr_defaults.ollama_model),
            language: vars.string("OCR_LANGUAGE", &ocr_defaults.language),
        };

        let archive_defaults = ArchiveLimits::default();
        let parsers = ParserSettings {
            ocr,
            archive: ArchiveLimits {
                max_entries: vars.parse("ARCHIVE_MAX_ENTRIES", archive_defaults.max_entries)?,
                max_depth: vars.parse("ARCHIVE_MAX_DEPTH", archive_defaults.max_depth)?,
                ..archive_defaults
            },
            conversion_timeout: conversion_timeout(reader.timeout),
        };

        Ok(Config {
            server: ServerConfig {
                host: vars.string("SERVER_HOST", &defaults.server.host),
                port: vars.parse("SERVER_PORT", defaults.server.port)?,
                transport: vars.parse("MCP_TRANSPORT", defaults.server.transport)?,
            },
            cache,
            reader,
            storage,
            parsers,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// An integer given in `unit`s, converted to base units
    fn scaled(&self, name: &'static str, default: u64, unit: u64) -> Result<u64, ConfigError> {
        let value: u64 = self.parse(name, default)?;
        value.checked_mul(unit).ok_or_else(|| ConfigError::Invalid {
            var: name,
            value: value.to_string(),
            reason: "value too large".to_string(),
        })
    }

    fn flag(&self, name: &'static str) -> Result<bool, ConfigError> {
        match self.get(name).map(|v| v.trim().to_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "" | "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var: name,
                    value: v,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }
}
