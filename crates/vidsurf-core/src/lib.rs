// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
pub mod config;

pub use config::{
    AppConfig, ConfigError, ExternalFormatPolicy, RendererConfig, SourceConfig, DEFAULT_CONFIG_PATH,
};

/// Installs the process-wide subscriber. `RUST_LOG` wins; otherwise `info`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
