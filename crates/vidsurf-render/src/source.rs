// SPDX-License-Identifier: CEPL-1.0
//! Where decoded buffers come from.
//!
//! The decoder pipeline itself lives outside this crate. It hands the renderer
//! a [`BufferSource`], announces new buffers through a [`SourceListener`], and
//! the render thread pulls the newest one through a [`SampleFeed`].
use std::{ffi::c_void, fmt, ptr::NonNull, sync::Arc};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Identity of an externally owned buffer. Equal ids are the same allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub const fn new(raw: usize) -> Self {
        BufferId(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({:#x})", self.0)
    }
}

/// Non-owning handle to a decoder buffer (an `AHardwareBuffer*` on Android).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalBuffer {
    raw: NonNull<c_void>,
}

// SAFETY: the handle is an opaque, reference-counted platform object; this
// type never dereferences it.
unsafe impl Send for ExternalBuffer {}

impl ExternalBuffer {
    pub fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(|raw| ExternalBuffer { raw })
    }

    pub fn id(self) -> BufferId {
        BufferId(self.raw.as_ptr() as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.raw.as_ptr()
    }
}

/// A decoded image held on behalf of a frame.
///
/// Dropping the sample hands the image back to the decoder, so it must stay
/// alive until the GPU is done sampling it.
pub trait Sample: Send {
    fn buffer(&self) -> Result<ExternalBuffer>;
}

impl<T: Sample + ?Sized> Sample for Box<T> {
    fn buffer(&self) -> Result<ExternalBuffer> {
        (**self).buffer()
    }
}

pub enum Pop {
    Sample(Box<dyn Sample>),
    /// Lost a race with the decoder; wait for the next announcement.
    Retry,
}

/// Notifications from the decoder. Called on decoder threads.
pub trait SourceListener: Send + Sync {
    fn buffer_available(&self);
    fn buffer_removed(&self, buffer: BufferId);
    fn end_of_stream(&self);
}

pub trait BufferSource: Send + Sync {
    /// Installs (or with `None`, removes) the listener for this source.
    fn set_listener(&self, listener: Option<Arc<dyn SourceListener>>) -> Result<()>;

    /// Pulls the most recent decoded buffer, dropping any older ones.
    fn pop_latest(&self) -> Result<Pop>;
}

#[derive(Debug)]
struct AvailState {
    count: u64,
    ended: bool,
}

/// Count of announced-but-unpopped buffers, plus end of stream.
///
/// Starts at one: the decoder is already running when the renderer starts.
#[derive(Debug)]
pub struct Availability {
    state: Mutex<AvailState>,
    ready: Condvar,
}

impl Default for Availability {
    fn default() -> Self {
        Self::new()
    }
}

impl Availability {
    pub fn new() -> Self {
        Availability {
            state: Mutex::new(AvailState {
                count: 1,
                ended: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut state = self.state.lock();
        state.count += 1;
        self.ready.notify_one();
    }

    pub fn end(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        self.ready.notify_all();
    }

    pub fn pending(&self) -> u64 {
        self.state.lock().count
    }

    /// Blocks until something was announced, then calls `pop` with the lock
    /// held. Returns `None` once the stream has ended and nothing is pending.
    ///
    /// No timeout: a decoder that stalls without ending parks the caller.
    pub fn pop_with(
        &self,
        mut pop: impl FnMut() -> Result<Pop>,
    ) -> Result<Option<Box<dyn Sample>>> {
        let mut state = self.state.lock();
        loop {
            while state.count == 0 && !state.ended {
                self.ready.wait(&mut state);
            }
            if state.count == 0 {
                return Ok(None);
            }

            let popped = pop()?;
            // Latest-only: whatever was announced so far has been consumed.
            state.count = 0;
            match popped {
                Pop::Sample(sample) => return Ok(Some(sample)),
                Pop::Retry => trace!("no buffer ready, waiting for the next one"),
            }
        }
    }
}

/// The render thread's handle on a started source.
#[derive(Clone)]
pub struct SampleFeed {
    source: Arc<dyn BufferSource>,
    available: Arc<Availability>,
}

impl SampleFeed {
    pub fn new(source: Arc<dyn BufferSource>, available: Arc<Availability>) -> Self {
        SampleFeed { source, available }
    }

    /// The newest decoded sample, or `None` when the stream is over.
    pub fn next_sample(&self) -> Result<Option<Box<dyn Sample>>> {
        self.available.pop_with(|| self.source.pop_latest())
    }
}
