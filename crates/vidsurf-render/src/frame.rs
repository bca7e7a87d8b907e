// SPDX-License-Identifier: CEPL-1.0
//! Host-side bookkeeping for the frame chain: which sample each swap-chain
//! image is displaying, and which frames are still on the GPU.
//!
//! The backend owns the actual fences; this type only sees them through the
//! `signaled` callback of [`FrameRing::collect`].
use std::collections::VecDeque;

use tracing::trace;

use crate::{
    cache::{ImportCache, SlotId},
    error::{FrameError, RenderError},
    source::{ExternalBuffer, Sample, SampleFeed},
};

/// The GPU half of acquiring a frame, supplied by the backend.
pub trait AcquireGpu {
    /// Asks the swap chain for its next image. `None` means it went stale.
    fn acquire_image(&mut self) -> anyhow::Result<Option<usize>>;

    /// Blocks until frame `index`'s previous submission has completed.
    fn wait_frame(&mut self, index: usize) -> anyhow::Result<()>;

    /// Blocks until the image handed out by `acquire_image` is ready.
    fn wait_acquired(&mut self) -> anyhow::Result<()>;
}

/// Outcome of [`FrameRing::acquire_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Frame(usize),
    Stale,
    Ended,
}

#[derive(Debug, Clone, Copy)]
struct FrameState {
    bound: Option<SlotId>,
    is_reset: bool,
}

const RESET: FrameState = FrameState {
    bound: None,
    is_reset: true,
};

#[derive(Debug)]
pub struct FrameRing {
    frames: Vec<FrameState>,
    // Submission order; a single queue completes in this order.
    in_flight: VecDeque<usize>,
}

impl FrameRing {
    pub fn new(len: usize) -> Self {
        FrameRing {
            frames: vec![RESET; len],
            in_flight: VecDeque::with_capacity(len),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_reset(&self, index: usize) -> bool {
        self.frames.get(index).is_some_and(|f| f.is_reset)
    }

    pub fn bound(&self, index: usize) -> Option<SlotId> {
        self.frames.get(index).and_then(|f| f.bound)
    }

    pub fn is_in_flight(&self, index: usize) -> bool {
        self.in_flight.contains(&index)
    }

    pub fn in_flight(&self) -> impl Iterator<Item = usize> + '_ {
        self.in_flight.iter().copied()
    }

    /// Binds `sample` to frame `index`, importing its buffer on a cache miss.
    /// The frame must have been reset since its last use.
    pub fn bind_sample<V, S: Sample>(
        &mut self,
        index: usize,
        cache: &mut ImportCache<V, S>,
        sample: S,
        import: impl FnOnce(ExternalBuffer) -> anyhow::Result<V>,
    ) -> Result<SlotId, RenderError> {
        self.check(index)?;
        if !self.frames[index].is_reset {
            return Err(FrameError::NotReset(index).into());
        }

        let buffer = sample.buffer()?;
        let slot = cache.import_with(buffer.id(), || import(buffer))?;
        cache.hold(slot, sample)?;
        self.frames[index] = FrameState {
            bound: Some(slot),
            is_reset: false,
        };
        trace!(index, %slot, "frame bound");
        Ok(slot)
    }

    pub fn mark_submitted(&mut self, index: usize) -> Result<(), FrameError> {
        self.check(index)?;
        if self.frames[index].is_reset {
            return Err(FrameError::Unbound(index));
        }
        if self.is_in_flight(index) {
            return Err(FrameError::AlreadyInFlight(index));
        }
        self.in_flight.push_back(index);
        Ok(())
    }

    /// Clears frame `index` and hands its sample back to the decoder. The
    /// caller must know the frame's GPU work is complete.
    pub fn reset<V, S>(
        &mut self,
        index: usize,
        cache: &mut ImportCache<V, S>,
    ) -> Result<(), FrameError> {
        self.check(index)?;
        let frame = &mut self.frames[index];
        if let Some(slot) = frame.bound.take() {
            drop(cache.release(slot));
        }
        frame.is_reset = true;
        self.in_flight.retain(|&i| i != index);
        Ok(())
    }

    /// Acquires the next image, recycles its frame and binds the newest
    /// decoded sample to it.
    ///
    /// STRICT ORDER:
    /// - acquire the image
    /// - if its frame is still in use, wait its fence and reset it
    /// - wait for the image itself
    /// - block on the decoder, then bind
    pub fn acquire_next<V>(
        &mut self,
        gpu: &mut impl AcquireGpu,
        cache: &mut ImportCache<V, Box<dyn Sample>>,
        feed: &SampleFeed,
        import: impl FnOnce(ExternalBuffer) -> anyhow::Result<V>,
    ) -> Result<Acquired, RenderError> {
        let Some(index) = gpu.acquire_image()? else {
            return Ok(Acquired::Stale);
        };
        self.check(index)?;
        if !self.frames[index].is_reset {
            trace!(index, "waiting on previous use of frame");
            gpu.wait_frame(index)?;
            self.reset(index, cache)?;
        }
        gpu.wait_acquired()?;

        let Some(sample) = feed.next_sample()? else {
            return Ok(Acquired::Ended);
        };
        self.bind_sample(index, cache, sample, import)?;
        Ok(Acquired::Frame(index))
    }

    /// Resets in-flight frames front to back while `signaled` says their fence
    /// is done; stops at the first that is not. Returns how many were reset.
    pub fn collect<V, S>(
        &mut self,
        cache: &mut ImportCache<V, S>,
        mut signaled: impl FnMut(usize) -> anyhow::Result<bool>,
    ) -> Result<usize, RenderError> {
        let mut done = 0;
        while let Some(&index) = self.in_flight.front() {
            if !signaled(index)? {
                break;
            }
            self.reset(index, cache)?;
            done += 1;
        }
        if done > 0 {
            trace!(done, pending = self.in_flight.len(), "collected frames");
        }
        Ok(done)
    }

    /// Resets every frame. Only after all fences have been waited on.
    pub fn reset_all<V, S>(&mut self, cache: &mut ImportCache<V, S>) {
        for index in 0..self.frames.len() {
            if let Some(slot) = self.frames[index].bound.take() {
                drop(cache.release(slot));
            }
            self.frames[index].is_reset = true;
        }
        self.in_flight.clear();
    }

    fn check(&self, index: usize) -> Result<(), FrameError> {
        if index >= self.frames.len() {
            return Err(FrameError::OutOfRange {
                index,
                len: self.frames.len(),
            });
        }
        Ok(())
    }
}
