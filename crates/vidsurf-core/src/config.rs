// SPDX-License-Identifier: CEPL-1.0
//! Renderer and source configuration, loaded from a TOML file.
//!
//! ```toml
//! [renderer]
//! validation = true
//! external_format = "auto"   # auto | always | never
//!
//! [source]
//! width = 1920
//! height = 1080
//! max_images = 8
//! ```
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "vidsurf.toml";

/// Whether imported buffers use the driver-private ("external") image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalFormatPolicy {
    /// Try a fully specified format first, fall back to external.
    #[default]
    Auto,
    /// Always import through the external format.
    Always,
    /// Never fall back to the external format; an unsupported buffer is fatal.
    Never,
}

impl ExternalFormatPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExternalFormatPolicy::Auto => "auto",
            ExternalFormatPolicy::Always => "always",
            ExternalFormatPolicy::Never => "never",
        }
    }
}

impl fmt::Display for ExternalFormatPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExternalFormatPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ExternalFormatPolicy::Auto),
            "always" => Ok(ExternalFormatPolicy::Always),
            "never" => Ok(ExternalFormatPolicy::Never),
            other => Err(ConfigError::UnknownPolicy(other.to_owned())),
        }
    }
}

/// Consumed once, when the renderer backend is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub validation: bool,
    pub external_format: ExternalFormatPolicy,
}

/// Sizing of the platform image reader that feeds decoded buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub width: u32,
    pub height: u32,
    pub max_images: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            width: 1920,
            height: 1080,
            max_images: 8,
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 || self.max_images == 0 {
            return Err(ConfigError::InvalidSource(*self));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub renderer: RendererConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown external format policy `{0}` (expected auto, always or never)")]
    UnknownPolicy(String),
    #[error("invalid source config {0:?}: size and image count must be non-zero")]
    InvalidSource(SourceConfig),
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("{} not found, using defaults", path.display());
                return Ok(AppConfig::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let cfg = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.source.validate()?;
        debug!(?cfg, "loaded {}", path.display());
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_auto_without_validation() {
        let cfg = AppConfig::default();
        assert!(!cfg.renderer.validation);
        assert_eq!(cfg.renderer.external_format, ExternalFormatPolicy::Auto);
        assert_eq!(cfg.source.max_images, 8);
    }

    #[test]
    fn partial_tables_keep_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [renderer]
            external_format = "never"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.renderer.external_format, ExternalFormatPolicy::Never);
        assert!(!cfg.renderer.validation);
        assert_eq!(cfg.source, SourceConfig::default());
    }

    #[test]
    fn unknown_policy_in_toml_is_rejected() {
        let err = AppConfig::from_toml_str("[renderer]\nexternal_format = \"sometimes\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn policy_parses_from_str() {
        assert_eq!("always".parse::<ExternalFormatPolicy>().unwrap(), ExternalFormatPolicy::Always);
        assert!(matches!(
            "yes".parse::<ExternalFormatPolicy>(),
            Err(ConfigError::UnknownPolicy(s)) if s == "yes"
        ));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn load_reads_both_tables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[renderer]\nvalidation = true\nexternal_format = \"always\"\n\n[source]\nwidth = 1280\nheight = 720\nmax_images = 4"
        )
        .unwrap();

        let cfg = AppConfig::load(file.path()).unwrap();
        assert!(cfg.renderer.validation);
        assert_eq!(cfg.renderer.external_format, ExternalFormatPolicy::Always);
        assert_eq!(
            cfg.source,
            SourceConfig {
                width: 1280,
                height: 720,
                max_images: 4
            }
        );
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[renderer\nvalidation = ").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn zero_sized_source_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[source]\nwidth = 0").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(ConfigError::InvalidSource(_))
        ));
    }
}
