// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use crate::{
    error::RenderError,
    source::{BufferId, SampleFeed},
    NativeWindow,
};

/// Outcome of one presentation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Frame,
    /// The swap chain went stale while acquiring; it is rebuilt next time.
    Skipped,
    /// The source ended; nothing more will ever be drawn.
    EndOfStream,
}

/// The GPU side of the renderer. Driven only from the render thread, and
/// only in the orders the [`RenderLoop`](crate::RenderLoop) state machine allows.
pub trait Backend: Send + 'static {
    fn bind_window(&mut self, window: Arc<dyn NativeWindow>) -> Result<(), RenderError>;

    /// Drains all GPU work on the window's images, then tears down the
    /// frame chain, swap chain and surface, in that order.
    fn unbind_window(&mut self) -> Result<(), RenderError>;

    fn start(&mut self, feed: SampleFeed) -> Result<(), RenderError>;

    /// Acquires, fills and presents exactly one frame.
    fn present(&mut self) -> Result<Presented, RenderError>;

    /// Non-blocking: resets frames whose fences have signaled.
    fn collect(&mut self) -> Result<(), RenderError>;

    /// Non-blocking: frees imports that are reclaimed and unheld.
    fn evict_dead(&mut self);

    fn buffer_reclaimed(&mut self, buffer: BufferId);
}
