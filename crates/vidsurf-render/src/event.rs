// SPDX-License-Identifier: CEPL-1.0
use std::{fmt, sync::Arc};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    source::{BufferId, BufferSource},
    NativeWindow,
};

/// Requests consumed in FIFO order by the render thread.
pub enum ControlEvent {
    Start(Arc<dyn BufferSource>),
    Stop,
    Pause,
    Unpause,
    BindWindow(Arc<dyn NativeWindow>),
    UnbindWindow,
    /// The decoder will no longer update this buffer.
    BufferReclaimed(BufferId),
}

impl ControlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ControlEvent::Start(_) => "Start",
            ControlEvent::Stop => "Stop",
            ControlEvent::Pause => "Pause",
            ControlEvent::Unpause => "Unpause",
            ControlEvent::BindWindow(_) => "BindWindow",
            ControlEvent::UnbindWindow => "UnbindWindow",
            ControlEvent::BufferReclaimed(_) => "BufferReclaimed",
        }
    }
}

impl fmt::Debug for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEvent::BufferReclaimed(id) => write!(f, "BufferReclaimed({id:?})"),
            other => f.write_str(other.name()),
        }
    }
}

pub type EventSender = Sender<ControlEvent>;
pub type EventReceiver = Receiver<ControlEvent>;

/// Multi-producer queue feeding the render thread. Pushes never block.
pub fn event_queue() -> (EventSender, EventReceiver) {
    crossbeam_channel::unbounded()
}
