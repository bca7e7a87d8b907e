// SPDX-License-Identifier: CEPL-1.0
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use crate::{
    backend::Backend,
    event::{event_queue, ControlEvent, EventSender},
    render_loop::RenderLoop,
    source::BufferSource,
    NativeWindow,
};

/// Host-facing handle. Every call enqueues an event and returns at once.
///
/// Dropping the handle stops the render thread and waits for it, which in
/// turn drains the GPU and frees everything the backend owns.
pub struct Renderer {
    events: EventSender,
    thread: Option<JoinHandle<()>>,
}

impl Renderer {
    /// Moves `backend` onto a new render thread. Any error on that thread is
    /// logged and aborts the process.
    pub fn spawn<B: Backend>(backend: B) -> Result<Self> {
        let (events, inbox) = event_queue();
        let loop_events = events.clone();
        let thread = thread::Builder::new()
            .name("vidsurf-render".into())
            .spawn(move || {
                let mut render_loop = RenderLoop::new(backend, loop_events, inbox);
                if let Err(e) = render_loop.run() {
                    error!("render loop failed: {e:#}");
                    std::process::abort();
                }
            })
            .context("spawning render thread")?;

        Ok(Renderer {
            events,
            thread: Some(thread),
        })
    }

    pub fn start(&self, source: Arc<dyn BufferSource>) {
        self.push(ControlEvent::Start(source));
    }

    pub fn stop(&self) {
        self.push(ControlEvent::Stop);
    }

    pub fn pause(&self) {
        self.push(ControlEvent::Pause);
    }

    pub fn unpause(&self) {
        self.push(ControlEvent::Unpause);
    }

    pub fn bind_window(&self, window: Arc<dyn NativeWindow>) {
        self.push(ControlEvent::BindWindow(window));
    }

    pub fn unbind_window(&self) {
        self.push(ControlEvent::UnbindWindow);
    }

    fn push(&self, event: ControlEvent) {
        debug!(event = event.name(), "push");
        if self.events.send(event).is_err() {
            warn!("render thread is gone, event dropped");
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // The loop may already have stopped itself at end of stream.
        let _ = self.events.send(ControlEvent::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("render thread panicked");
            }
        }
    }
}
