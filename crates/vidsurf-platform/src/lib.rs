// SPDX-License-Identifier: CEPL-1.0
//! Host glue: a winit window adapter and, on Android, the image reader the
//! decoder writes into.
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(target_os = "android")]
mod image_reader;
mod window;

pub use winit;

#[cfg(target_os = "android")]
pub use image_reader::ImageReaderSource;
pub use window::WinitWindow;

use anyhow::Result;
use std::sync::Arc;
use vidsurf_core::SourceConfig;
use vidsurf_render::BufferSource;

/// Opens the platform's decoder output queue.
#[cfg(target_os = "android")]
pub fn open_source(cfg: &SourceConfig) -> Result<Arc<dyn BufferSource>> {
    Ok(Arc::new(ImageReaderSource::new(cfg)?))
}

/// Opens the platform's decoder output queue.
#[cfg(not(target_os = "android"))]
pub fn open_source(cfg: &SourceConfig) -> Result<Arc<dyn BufferSource>> {
    anyhow::bail!(
        "no hardware-buffer image source on this platform ({}x{} requested)",
        cfg.width,
        cfg.height
    )
}
