// SPDX-License-Identifier: CEPL-1.0
//! `AImageReader` as a [`BufferSource`]: the decoder renders into the reader's
//! window and the renderer pulls the newest image back out.

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vidsurf_core::SourceConfig;
use vidsurf_render::{BufferSource, ExternalBuffer, Pop, Sample, SourceListener};

#[allow(non_camel_case_types)]
mod ffi {
    use std::ffi::c_void;

    pub enum AImageReader {}
    pub enum AImage {}
    pub enum AHardwareBuffer {}
    pub enum ANativeWindow {}

    pub type media_status_t = i32;

    pub const AMEDIA_OK: media_status_t = 0;
    pub const AMEDIA_IMGREADER_NO_BUFFER_AVAILABLE: media_status_t = -30001;
    pub const AIMAGE_FORMAT_YUV_420_888: i32 = 0x23;
    pub const AHARDWAREBUFFER_USAGE_GPU_SAMPLED_IMAGE: u64 = 1 << 8;

    #[repr(C)]
    pub struct AImageReader_ImageListener {
        pub context: *mut c_void,
        pub on_image_available: Option<unsafe extern "C" fn(*mut c_void, *mut AImageReader)>,
    }

    #[repr(C)]
    pub struct AImageReader_BufferRemovedListener {
        pub context: *mut c_void,
        pub on_buffer_removed:
            Option<unsafe extern "C" fn(*mut c_void, *mut AImageReader, *mut AHardwareBuffer)>,
    }

    #[link(name = "mediandk")]
    extern "C" {
        pub fn AImageReader_newWithUsage(
            width: i32,
            height: i32,
            format: i32,
            usage: u64,
            max_images: i32,
            reader: *mut *mut AImageReader,
        ) -> media_status_t;
        pub fn AImageReader_delete(reader: *mut AImageReader);
        pub fn AImageReader_getWindow(
            reader: *mut AImageReader,
            window: *mut *mut ANativeWindow,
        ) -> media_status_t;
        pub fn AImageReader_setImageListener(
            reader: *mut AImageReader,
            listener: *mut AImageReader_ImageListener,
        ) -> media_status_t;
        pub fn AImageReader_setBufferRemovedListener(
            reader: *mut AImageReader,
            listener: *mut AImageReader_BufferRemovedListener,
        ) -> media_status_t;
        pub fn AImageReader_acquireLatestImage(
            reader: *mut AImageReader,
            image: *mut *mut AImage,
        ) -> media_status_t;
        pub fn AImage_getHardwareBuffer(
            image: *const AImage,
            buffer: *mut *mut AHardwareBuffer,
        ) -> media_status_t;
        pub fn AImage_delete(image: *mut AImage);
    }
}

fn check(status: ffi::media_status_t, what: &str) -> Result<()> {
    if status != ffi::AMEDIA_OK {
        bail!("{what} failed: media_status={status}");
    }
    Ok(())
}

/// Owns the reader. Images keep it alive, since deleting the reader also
/// deletes every image acquired from it.
struct Reader {
    raw: NonNull<ffi::AImageReader>,
}

// The NDK serializes access to an AImageReader internally.
unsafe impl Send for Reader {}
unsafe impl Sync for Reader {}

impl Drop for Reader {
    fn drop(&mut self) {
        unsafe { ffi::AImageReader_delete(self.raw.as_ptr()) };
        debug!("image reader deleted");
    }
}

/// Listener slot handed to the NDK as callback context. Boxed so its address
/// is stable for as long as callbacks are registered.
struct Callbacks {
    listener: Mutex<Option<Arc<dyn SourceListener>>>,
}

impl Callbacks {
    fn current(&self) -> Option<Arc<dyn SourceListener>> {
        self.listener.lock().clone()
    }
}

unsafe extern "C" fn on_image_available(context: *mut c_void, _reader: *mut ffi::AImageReader) {
    let callbacks = unsafe { &*(context as *const Callbacks) };
    if let Some(listener) = callbacks.current() {
        listener.buffer_available();
    }
}

unsafe extern "C" fn on_buffer_removed(
    context: *mut c_void,
    _reader: *mut ffi::AImageReader,
    buffer: *mut ffi::AHardwareBuffer,
) {
    let callbacks = unsafe { &*(context as *const Callbacks) };
    let (Some(listener), Some(buffer)) = (callbacks.current(), ExternalBuffer::from_raw(buffer.cast()))
    else {
        return;
    };
    listener.buffer_removed(buffer.id());
}

/// One acquired image; deleting it hands the buffer back to the reader.
struct ReaderImage {
    image: NonNull<ffi::AImage>,
    _reader: Arc<Reader>,
}

unsafe impl Send for ReaderImage {}

impl Sample for ReaderImage {
    fn buffer(&self) -> Result<ExternalBuffer> {
        let mut ahb = ptr::null_mut();
        check(
            unsafe { ffi::AImage_getHardwareBuffer(self.image.as_ptr(), &mut ahb) },
            "AImage_getHardwareBuffer",
        )?;
        ExternalBuffer::from_raw(ahb.cast()).ok_or_else(|| anyhow!("image has no hardware buffer"))
    }
}

impl Drop for ReaderImage {
    fn drop(&mut self) {
        unsafe { ffi::AImage_delete(self.image.as_ptr()) };
    }
}

pub struct ImageReaderSource {
    reader: Arc<Reader>,
    callbacks: Box<Callbacks>,
}

impl ImageReaderSource {
    /// A YUV 4:2:0 reader whose buffers are allocated for GPU sampling.
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        cfg.validate()?;
        let mut raw = ptr::null_mut();
        check(
            unsafe {
                ffi::AImageReader_newWithUsage(
                    cfg.width as i32,
                    cfg.height as i32,
                    ffi::AIMAGE_FORMAT_YUV_420_888,
                    ffi::AHARDWAREBUFFER_USAGE_GPU_SAMPLED_IMAGE,
                    cfg.max_images as i32,
                    &mut raw,
                )
            },
            "AImageReader_newWithUsage",
        )?;
        let raw = NonNull::new(raw).ok_or_else(|| anyhow!("AImageReader_newWithUsage gave null"))?;
        info!(
            width = cfg.width,
            height = cfg.height,
            max_images = cfg.max_images,
            "image reader created"
        );
        Ok(Self {
            reader: Arc::new(Reader { raw }),
            callbacks: Box::new(Callbacks {
                listener: Mutex::new(None),
            }),
        })
    }

    /// The `ANativeWindow*` the decoder should render into. Owned by the reader.
    pub fn decoder_window(&self) -> Result<*mut c_void> {
        let mut window = ptr::null_mut();
        check(
            unsafe { ffi::AImageReader_getWindow(self.reader.raw.as_ptr(), &mut window) },
            "AImageReader_getWindow",
        )?;
        Ok(window.cast())
    }

    /// Called by the decoder's host once it has queued its last output buffer.
    pub fn end_of_stream(&self) {
        match self.callbacks.current() {
            Some(listener) => listener.end_of_stream(),
            None => warn!("end of stream with no renderer attached"),
        }
    }

    fn context(&self) -> *mut c_void {
        (&*self.callbacks as *const Callbacks).cast_mut().cast()
    }

    fn register(&self, attach: bool) -> Result<()> {
        let reader = self.reader.raw.as_ptr();
        let (mut images, mut removed) = (
            ffi::AImageReader_ImageListener {
                context: self.context(),
                on_image_available: Some(on_image_available),
            },
            ffi::AImageReader_BufferRemovedListener {
                context: self.context(),
                on_buffer_removed: Some(on_buffer_removed),
            },
        );
        let (images_ptr, removed_ptr) = if attach {
            (&mut images as *mut _, &mut removed as *mut _)
        } else {
            (ptr::null_mut(), ptr::null_mut())
        };
        check(
            unsafe { ffi::AImageReader_setImageListener(reader, images_ptr) },
            "AImageReader_setImageListener",
        )?;
        check(
            unsafe { ffi::AImageReader_setBufferRemovedListener(reader, removed_ptr) },
            "AImageReader_setBufferRemovedListener",
        )
    }
}

impl BufferSource for ImageReaderSource {
    fn set_listener(&self, listener: Option<Arc<dyn SourceListener>>) -> Result<()> {
        let attach = listener.is_some();
        *self.callbacks.listener.lock() = listener;
        self.register(attach)
    }

    fn pop_latest(&self) -> Result<Pop> {
        let mut image = ptr::null_mut();
        let status =
            unsafe { ffi::AImageReader_acquireLatestImage(self.reader.raw.as_ptr(), &mut image) };
        match status {
            ffi::AMEDIA_OK => {}
            ffi::AMEDIA_IMGREADER_NO_BUFFER_AVAILABLE => return Ok(Pop::Retry),
            other => bail!("AImageReader_acquireLatestImage failed: media_status={other}"),
        }
        let image = NonNull::new(image).ok_or_else(|| anyhow!("acquired a null image"))?;
        Ok(Pop::Sample(Box::new(ReaderImage {
            image,
            _reader: Arc::clone(&self.reader),
        })))
    }
}

impl Drop for ImageReaderSource {
    fn drop(&mut self) {
        // Callbacks must be gone before their context is freed; the reader
        // itself may outlive us through images still held by the renderer.
        if let Err(err) = self.register(false) {
            warn!("detaching image reader callbacks: {err:#}");
        }
    }
}
