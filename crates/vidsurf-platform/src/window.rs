// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;
use vidsurf_render::{NativeWindow, RenderSize};
use winit::raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use winit::window::Window;

/// Lets the render thread build a surface on a winit window.
pub struct WinitWindow {
    window: Arc<Window>,
}

impl WinitWindow {
    pub fn new(window: Arc<Window>) -> Arc<Self> {
        Arc::new(Self { window })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl HasWindowHandle for WinitWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for WinitWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl NativeWindow for WinitWindow {
    fn size(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize {
            width: size.width.max(1),
            height: size.height.max(1),
        }
    }
}
