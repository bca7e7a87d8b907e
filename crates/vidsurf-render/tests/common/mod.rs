// SPDX-License-Identifier: CEPL-1.0
//! Scripted stand-ins for the decoder, the window and the GPU.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    ffi::c_void,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use parking_lot::{Condvar, Mutex};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use vidsurf_render::{
    ensure_target, AcquireGpu, Acquired, Backend, BufferId, BufferSource, CacheError,
    ExternalBuffer, FrameError, FrameRing, ImportCache, NativeWindow, Pop, Presented, RenderError,
    RenderSize, Sample, SampleFeed, SourceListener, SwapTarget, SwapchainStatus,
};

pub fn raw(n: usize) -> usize {
    0x1000 + n * 0x40
}

pub fn id(n: usize) -> BufferId {
    BufferId::new(raw(n))
}

#[derive(Default)]
pub struct Journal {
    pub log: Vec<String>,
    pub presented: Vec<BufferId>,
}

impl Journal {
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log.iter().position(|l| l == entry)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.log.iter().filter(|l| l.starts_with(prefix)).count()
    }
}

pub type SharedJournal = Arc<Mutex<Journal>>;

pub struct MockWindow {
    size: RenderSize,
}

impl MockWindow {
    pub fn arc(width: u32, height: u32) -> Arc<dyn NativeWindow> {
        Arc::new(MockWindow {
            size: RenderSize { width, height },
        })
    }
}

impl HasWindowHandle for MockWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl HasDisplayHandle for MockWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl NativeWindow for MockWindow {
    fn size(&self) -> RenderSize {
        self.size
    }
}

pub struct MockSample {
    raw: usize,
    journal: SharedJournal,
}

impl Sample for MockSample {
    fn buffer(&self) -> Result<ExternalBuffer> {
        ExternalBuffer::from_raw(self.raw as *mut c_void).ok_or_else(|| anyhow!("null buffer"))
    }
}

impl Drop for MockSample {
    fn drop(&mut self) {
        self.journal
            .lock()
            .log
            .push(format!("release {:?}", BufferId::new(self.raw)));
    }
}

/// A decoder that only produces what the test tells it to.
pub struct MockSource {
    queue: Mutex<VecDeque<usize>>,
    drained: Condvar,
    listener: Mutex<Option<Arc<dyn SourceListener>>>,
    journal: SharedJournal,
}

impl MockSource {
    pub fn new(journal: SharedJournal) -> Arc<Self> {
        Arc::new(MockSource {
            queue: Mutex::new(VecDeque::new()),
            drained: Condvar::new(),
            listener: Mutex::new(None),
            journal,
        })
    }

    /// Queues a buffer without telling anyone.
    pub fn push(&self, raw: usize) {
        self.queue.lock().push_back(raw);
    }

    pub fn announce(&self, raw: usize) {
        self.push(raw);
        if let Some(l) = self.listener() {
            l.buffer_available();
        }
    }

    pub fn remove(&self, raw: usize) {
        if let Some(l) = self.listener() {
            l.buffer_removed(BufferId::new(raw));
        }
    }

    pub fn finish(&self) {
        if let Some(l) = self.listener() {
            l.end_of_stream();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().is_some()
    }

    pub fn wait_listening(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.is_listening() {
            assert!(Instant::now() < deadline, "renderer never started");
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn wait_drained(&self) {
        let mut queue = self.queue.lock();
        while !queue.is_empty() {
            let timed_out = self
                .drained
                .wait_for(&mut queue, Duration::from_secs(5))
                .timed_out();
            assert!(!timed_out, "renderer never pulled the buffer");
        }
    }

    fn listener(&self) -> Option<Arc<dyn SourceListener>> {
        self.listener.lock().clone()
    }
}

impl BufferSource for MockSource {
    fn set_listener(&self, listener: Option<Arc<dyn SourceListener>>) -> Result<()> {
        *self.listener.lock() = listener;
        Ok(())
    }

    fn pop_latest(&self) -> Result<Pop> {
        let mut queue = self.queue.lock();
        let latest = queue.pop_back();
        // Older buffers are skipped, like an image reader's latest-image pop.
        queue.clear();
        self.drained.notify_all();
        if let Some(raw) = latest {
            self.journal
                .lock()
                .log
                .push(format!("pop {:?}", BufferId::new(raw)));
        }
        Ok(match latest {
            Some(raw) => Pop::Sample(Box::new(MockSample {
                raw,
                journal: self.journal.clone(),
            })),
            None => Pop::Retry,
        })
    }
}

type MockCache = ImportCache<usize, Box<dyn Sample>>;

struct MockChain {
    ring: FrameRing,
    next: usize,
    generation: usize,
    status: SwapchainStatus,
}

impl SwapTarget for MockChain {
    fn status(&self) -> SwapchainStatus {
        self.status
    }
}

/// Waits out whatever is in flight, hands every sample back, then drops it.
fn retire(chain: MockChain, cache: &mut MockCache, journal: &SharedJournal) {
    let MockChain {
        mut ring,
        generation,
        ..
    } = chain;
    for index in ring.in_flight().collect::<Vec<_>>() {
        journal.lock().log.push(format!("wait frame {index}"));
    }
    ring.reset_all(cache);
    journal.lock().log.push(format!("destroy chain {generation}"));
}

/// Hands out images round-robin; every wait returns at once.
struct MockGpu<'a> {
    next: &'a mut usize,
    len: usize,
    status: &'a mut SwapchainStatus,
    stale: bool,
    journal: &'a SharedJournal,
}

impl AcquireGpu for MockGpu<'_> {
    fn acquire_image(&mut self) -> Result<Option<usize>> {
        if self.stale {
            *self.status = SwapchainStatus::Stale;
            self.journal.lock().log.push("acquire stale".into());
            return Ok(None);
        }
        let index = *self.next;
        *self.next = (index + 1) % self.len;
        self.journal.lock().log.push(format!("acquire {index}"));
        Ok(Some(index))
    }

    fn wait_frame(&mut self, index: usize) -> Result<()> {
        self.journal.lock().log.push(format!("wait frame {index}"));
        Ok(())
    }

    fn wait_acquired(&mut self) -> Result<()> {
        self.journal.lock().log.push("wait acquired".into());
        Ok(())
    }
}

/// Scripted swap-chain outcomes, consumed one per present.
#[derive(Default)]
struct Script {
    stale_acquires: usize,
    after_present: VecDeque<SwapchainStatus>,
}

/// A backend whose "GPU" finishes work as soon as it is polled, unless stalled.
pub struct MockBackend {
    journal: SharedJournal,
    cache: MockCache,
    chain: Option<MockChain>,
    window: Option<Arc<dyn NativeWindow>>,
    feed: Option<SampleFeed>,
    chain_len: usize,
    chains_built: usize,
    stalled: Arc<AtomicBool>,
    script: Mutex<Script>,
}

impl MockBackend {
    pub fn new(journal: SharedJournal, chain_len: usize) -> Self {
        MockBackend {
            journal,
            cache: ImportCache::new(),
            chain: None,
            window: None,
            feed: None,
            chain_len,
            chains_built: 0,
            stalled: Arc::new(AtomicBool::new(false)),
            script: Mutex::new(Script::default()),
        }
    }

    /// While set, no fence ever signals on its own.
    pub fn stall_handle(&self) -> Arc<AtomicBool> {
        self.stalled.clone()
    }

    /// The next acquire finds the swap chain out of date.
    pub fn script_stale_acquire(&self) {
        self.script.lock().stale_acquires += 1;
    }

    /// The next successful present reports `status` for its swap chain.
    pub fn script_present_status(&self, status: SwapchainStatus) {
        self.script.lock().after_present.push_back(status);
    }

    pub fn live_imports(&self) -> usize {
        self.cache.len()
    }

    fn log(&self, entry: String) {
        self.journal.lock().log.push(entry);
    }

    fn drop_chain(&mut self) {
        if let Some(chain) = self.chain.take() {
            retire(chain, &mut self.cache, &self.journal);
        }
    }
}

impl Backend for MockBackend {
    fn bind_window(&mut self, window: Arc<dyn NativeWindow>) -> Result<(), RenderError> {
        let size = window.size();
        self.log(format!("create surface {}x{}", size.width, size.height));
        self.window = Some(window);
        Ok(())
    }

    fn unbind_window(&mut self) -> Result<(), RenderError> {
        self.drop_chain();
        if let Some(window) = self.window.take() {
            let size = window.size();
            self.log(format!("destroy surface {}x{}", size.width, size.height));
        }
        Ok(())
    }

    fn start(&mut self, feed: SampleFeed) -> Result<(), RenderError> {
        self.log("start".into());
        self.feed = Some(feed);
        Ok(())
    }

    fn present(&mut self) -> Result<Presented, RenderError> {
        let Some(feed) = self.feed.clone() else {
            return Err(anyhow!("present before start").into());
        };
        if self.window.is_none() {
            return Err(anyhow!("present without a surface").into());
        }

        let MockBackend {
            journal,
            cache,
            chain,
            chain_len,
            chains_built,
            script,
            ..
        } = self;
        let chain = ensure_target(
            chain,
            |old| {
                retire(old, cache, journal);
                Ok::<_, RenderError>(())
            },
            || {
                *chains_built += 1;
                journal.lock().log.push(format!("create chain {chains_built}"));
                Ok(MockChain {
                    ring: FrameRing::new(*chain_len),
                    next: 0,
                    generation: *chains_built,
                    status: SwapchainStatus::Ok,
                })
            },
        )?;

        let stale = {
            let mut script = script.lock();
            let stale = script.stale_acquires > 0;
            script.stale_acquires = script.stale_acquires.saturating_sub(1);
            stale
        };
        let MockChain {
            ring, next, status, ..
        } = chain;
        let mut gpu = MockGpu {
            next: &mut *next,
            len: ring.len(),
            status: &mut *status,
            stale,
            journal: &*journal,
        };
        let index = match ring.acquire_next(&mut gpu, cache, &feed, |b| Ok(b.id().raw()))? {
            Acquired::Frame(index) => index,
            Acquired::Stale => return Ok(Presented::Skipped),
            Acquired::Ended => return Ok(Presented::EndOfStream),
        };
        ring.mark_submitted(index)?;

        let slot = ring.bound(index).ok_or(FrameError::Unbound(index))?;
        let &raw = cache.resources(slot).ok_or(CacheError::Vacant(slot))?;
        journal.lock().presented.push(BufferId::new(raw));
        if let Some(reported) = script.lock().after_present.pop_front() {
            *status = reported;
        }
        Ok(Presented::Frame)
    }

    fn collect(&mut self) -> Result<(), RenderError> {
        let stalled = self.stalled.load(Ordering::SeqCst);
        if let Some(chain) = self.chain.as_mut() {
            chain.ring.collect(&mut self.cache, |_| Ok(!stalled))?;
        }
        Ok(())
    }

    fn evict_dead(&mut self) {
        let mut journal = self.journal.lock();
        self.cache
            .evict_dead(|buffer, _| journal.log.push(format!("evict {buffer:?}")));
    }

    fn buffer_reclaimed(&mut self, buffer: BufferId) {
        self.cache.mark_reclaimed(buffer);
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.drop_chain();
        self.cache.drain(|_, _, held| drop(held));
        self.log("teardown".into());
    }
}
