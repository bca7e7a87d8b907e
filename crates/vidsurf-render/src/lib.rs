// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic half of the video surface renderer.
//!
//! A [`Renderer`] owns one render thread. Hosts talk to it only by enqueuing
//! [`ControlEvent`]s; the thread runs a [`RenderLoop`] that owns a [`Backend`]
//! and with it every GPU object, the import cache and the frame chain.
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod backend;
pub mod cache;
pub mod error;
pub mod event;
pub mod frame;
mod render_loop;
mod renderer;
pub mod source;
pub mod target;

pub use backend::{Backend, Presented};
pub use cache::{ImportCache, SlotId, CACHE_CAPACITY};
pub use error::{CacheError, FrameError, RenderError};
pub use event::{event_queue, ControlEvent, EventReceiver, EventSender};
pub use frame::{AcquireGpu, Acquired, FrameRing};
pub use render_loop::{LoopState, RenderLoop};
pub use renderer::Renderer;
pub use source::{
    Availability, BufferId, BufferSource, ExternalBuffer, Pop, Sample, SampleFeed, SourceListener,
};
pub use target::{ensure_target, SwapTarget, SwapchainStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

/// An OS window the renderer can present into.
pub trait NativeWindow: HasWindowHandle + HasDisplayHandle + Send + Sync {
    /// Current drawable size in physical pixels.
    fn size(&self) -> RenderSize;
}
