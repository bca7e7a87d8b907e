// SPDX-License-Identifier: CEPL-1.0
use thiserror::Error;

use crate::{cache::SlotId, render_loop::LoopState};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("import cache exhausted: all {capacity} slots are in use")]
    Full { capacity: usize },
    #[error("cache slot {0} already holds a sample")]
    AlreadyHeld(SlotId),
    #[error("cache slot {0} is vacant")]
    Vacant(SlotId),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame {index} is out of range for a chain of {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("frame {0} was acquired before being reset")]
    NotReset(usize),
    #[error("frame {0} has no bound sample")]
    Unbound(usize),
    #[error("frame {0} is already in flight")]
    AlreadyInFlight(usize),
}

/// Everything that can stop the render loop. All of it is fatal.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("{event} is not valid while {state}")]
    InvalidTransition {
        event: &'static str,
        state: LoopState,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
