// SPDX-License-Identifier: CEPL-1.0
use std::{fmt, sync::Arc};

use tracing::{debug, info, trace, warn};

use crate::{
    backend::{Backend, Presented},
    error::RenderError,
    event::{ControlEvent, EventReceiver, EventSender},
    source::{Availability, BufferId, BufferSource, SampleFeed, SourceListener},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopState {
    pub started: bool,
    pub paused: bool,
    pub window_bound: bool,
    /// The source ended and a Stop is queued; nothing more is drawn.
    pub ending: bool,
}

impl Default for LoopState {
    fn default() -> Self {
        LoopState {
            started: false,
            paused: true,
            window_bound: false,
            ending: false,
        }
    }
}

impl LoopState {
    pub fn should_present(&self) -> bool {
        self.started && !self.paused && self.window_bound && !self.ending
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}",
            if self.started { "started" } else { "not started" },
            if self.paused { "paused" } else { "unpaused" },
            if self.window_bound {
                "window bound"
            } else {
                "window unbound"
            },
        )?;
        if self.ending {
            f.write_str(", ending")?;
        }
        Ok(())
    }
}

/// Routes decoder notifications back to the render thread.
struct LoopListener {
    available: Arc<Availability>,
    events: EventSender,
}

impl SourceListener for LoopListener {
    fn buffer_available(&self) {
        self.available.notify();
    }

    fn buffer_removed(&self, buffer: BufferId) {
        debug!(?buffer, "push BufferReclaimed");
        let _ = self.events.send(ControlEvent::BufferReclaimed(buffer));
    }

    fn end_of_stream(&self) {
        self.available.end();
    }
}

/// The render thread's state machine. Owns the backend.
pub struct RenderLoop<B: Backend> {
    backend: B,
    events: EventReceiver,
    sender: EventSender,
    state: LoopState,
    source: Option<Arc<dyn BufferSource>>,
    frames_presented: u64,
}

impl<B: Backend> RenderLoop<B> {
    /// `sender` must feed `events`; the loop uses it to stop itself.
    pub fn new(backend: B, sender: EventSender, events: EventReceiver) -> Self {
        RenderLoop {
            backend,
            events,
            sender,
            state: LoopState::default(),
            source: None,
            frames_presented: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Runs until a Stop event is consumed.
    pub fn run(&mut self) -> Result<(), RenderError> {
        info!("render loop running");
        while self.step()? {}
        self.detach_source();
        info!(frames = self.frames_presented, "render loop stopped");
        Ok(())
    }

    /// One iteration: at most one event, then at most one frame, then
    /// reclamation. Blocks on the queue while paused. Returns `false` on Stop.
    pub fn step(&mut self) -> Result<bool, RenderError> {
        let event = if self.state.paused {
            // We hold a sender, so the queue never disconnects.
            Some(self.events.recv().unwrap_or(ControlEvent::Stop))
        } else {
            self.events.try_recv().ok()
        };

        if let Some(event) = event {
            if !self.handle(event)? {
                return Ok(false);
            }
        }

        if self.state.should_present() {
            self.present_one()?;
        }
        if self.state.window_bound {
            self.backend.collect()?;
        }
        self.backend.evict_dead();
        Ok(true)
    }

    fn handle(&mut self, event: ControlEvent) -> Result<bool, RenderError> {
        debug!(event = event.name(), state = %self.state, "pop");
        match event {
            ControlEvent::Start(source) => {
                self.require(!self.state.started, "Start")?;
                let available = Arc::new(Availability::new());
                let listener = Arc::new(LoopListener {
                    available: available.clone(),
                    events: self.sender.clone(),
                });
                source.set_listener(Some(listener))?;
                self.source = Some(source.clone());
                self.backend.start(SampleFeed::new(source, available))?;
                self.state.started = true;
                info!("started");
            }
            ControlEvent::Stop => {
                info!("stop");
                return Ok(false);
            }
            ControlEvent::Pause => {
                self.require(self.state.started, "Pause")?;
                self.state.paused = true;
            }
            ControlEvent::Unpause => {
                self.require(self.state.started, "Unpause")?;
                self.state.paused = false;
            }
            ControlEvent::BindWindow(window) => {
                self.require(!self.state.window_bound, "BindWindow")?;
                self.backend.bind_window(window)?;
                self.state.window_bound = true;
            }
            ControlEvent::UnbindWindow => {
                self.require(self.state.window_bound, "UnbindWindow")?;
                self.backend.unbind_window()?;
                self.state.window_bound = false;
            }
            ControlEvent::BufferReclaimed(buffer) => self.backend.buffer_reclaimed(buffer),
        }
        Ok(true)
    }

    fn present_one(&mut self) -> Result<(), RenderError> {
        match self.backend.present()? {
            Presented::Frame => self.frames_presented += 1,
            Presented::Skipped => trace!("frame skipped"),
            Presented::EndOfStream => {
                info!(frames = self.frames_presented, "source ended, stopping");
                self.state.ending = true;
                let _ = self.sender.send(ControlEvent::Stop);
            }
        }
        Ok(())
    }

    fn require(&self, ok: bool, event: &'static str) -> Result<(), RenderError> {
        if ok {
            Ok(())
        } else {
            Err(RenderError::InvalidTransition {
                event,
                state: self.state,
            })
        }
    }

    fn detach_source(&mut self) {
        if let Some(source) = self.source.take() {
            if let Err(e) = source.set_listener(None) {
                warn!("detaching source listener: {e:#}");
            }
        }
    }
}

impl<B: Backend> Drop for RenderLoop<B> {
    fn drop(&mut self) {
        self.detach_source();
    }
}
