// SPDX-License-Identifier: CEPL-1.0
//! Counted references to Android hardware buffers.

use anyhow::Result;
use ash::vk;
use std::ptr::NonNull;
use vidsurf_render::{BufferId, ExternalBuffer};

/// `AHARDWAREBUFFER_USAGE_GPU_SAMPLED_IMAGE`
pub const USAGE_GPU_SAMPLED_IMAGE: u64 = 1 << 8;

#[cfg(target_os = "android")]
mod ffi {
    use ash::vk::AHardwareBuffer;

    #[repr(C)]
    #[derive(Default)]
    pub struct AHardwareBuffer_Desc {
        pub width: u32,
        pub height: u32,
        pub layers: u32,
        pub format: u32,
        pub usage: u64,
        pub stride: u32,
        pub rfu0: u32,
        pub rfu1: u64,
    }

    #[link(name = "android")]
    extern "C" {
        pub fn AHardwareBuffer_acquire(buffer: *mut AHardwareBuffer);
        pub fn AHardwareBuffer_release(buffer: *mut AHardwareBuffer);
        pub fn AHardwareBuffer_describe(
            buffer: *const AHardwareBuffer,
            desc: *mut AHardwareBuffer_Desc,
        );
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub usage: u64,
}

/// One acquired reference on a hardware buffer; released on drop.
///
/// Only constructible on Android, so the off-target method bodies never run.
pub struct HardwareBufferRef {
    raw: NonNull<vk::AHardwareBuffer>,
    id: BufferId,
}

// AHardwareBuffer reference counting is thread-safe.
unsafe impl Send for HardwareBufferRef {}

impl HardwareBufferRef {
    #[cfg(target_os = "android")]
    pub fn acquire(buffer: ExternalBuffer) -> Result<Self> {
        let raw = NonNull::new(buffer.as_ptr().cast::<vk::AHardwareBuffer>())
            .ok_or_else(|| anyhow::anyhow!("null hardware buffer"))?;
        unsafe { ffi::AHardwareBuffer_acquire(raw.as_ptr()) };
        Ok(Self {
            raw,
            id: buffer.id(),
        })
    }

    #[cfg(not(target_os = "android"))]
    pub fn acquire(buffer: ExternalBuffer) -> Result<Self> {
        anyhow::bail!(
            "cannot import {:?}: hardware buffers exist only on Android",
            buffer.id()
        )
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn as_ptr(&self) -> *mut vk::AHardwareBuffer {
        self.raw.as_ptr()
    }

    pub fn describe(&self) -> BufferDesc {
        #[cfg(target_os = "android")]
        {
            let mut desc = ffi::AHardwareBuffer_Desc::default();
            unsafe { ffi::AHardwareBuffer_describe(self.raw.as_ptr(), &mut desc) };
            BufferDesc {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                usage: desc.usage,
            }
        }
        #[cfg(not(target_os = "android"))]
        BufferDesc::default()
    }
}

impl Drop for HardwareBufferRef {
    fn drop(&mut self) {
        #[cfg(target_os = "android")]
        unsafe {
            ffi::AHardwareBuffer_release(self.raw.as_ptr())
        };
    }
}
