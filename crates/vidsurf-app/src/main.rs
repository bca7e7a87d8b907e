// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use vidsurf_core::{init_tracing, AppConfig, ExternalFormatPolicy, DEFAULT_CONFIG_PATH};
use vidsurf_platform::{open_source, WinitWindow};
use vidsurf_render::{BufferSource, Renderer};
use vidsurf_render_vk::VkBackend;

use vidsurf_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing means defaults
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable VK_LAYER_KHRONOS_validation
    #[arg(long)]
    validation: bool,

    /// External format policy: auto | always | never
    #[arg(long)]
    external_format: Option<ExternalFormatPolicy>,

    /// Decoder output width
    #[arg(long)]
    width: Option<u32>,

    /// Decoder output height
    #[arg(long)]
    height: Option<u32>,
}

impl Args {
    /// Command-line flags win over the file.
    fn apply(&self, mut cfg: AppConfig) -> AppConfig {
        cfg.renderer.validation |= self.validation;
        if let Some(policy) = self.external_format {
            cfg.renderer.external_format = policy;
        }
        if let Some(w) = self.width {
            cfg.source.width = w;
        }
        if let Some(h) = self.height {
            cfg.source.height = h;
        }
        cfg
    }
}

struct App {
    cfg: AppConfig,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    source: Option<Arc<dyn BufferSource>>,
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppConfig) -> Self {
        Self {
            cfg,
            renderer: None,
            window: None,
            source: None,
            failure: None,
        }
    }

    /// First resume builds the renderer and starts the source; every resume
    /// binds a fresh window.
    fn resume(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let renderer = match self.renderer.take() {
            Some(r) => r,
            None => Renderer::spawn(VkBackend::new(event_loop, self.cfg.renderer)?)?,
        };
        let renderer = self.renderer.insert(renderer);

        if self.window.is_none() {
            let window = Arc::new(
                event_loop.create_window(Window::default_attributes().with_title("vidsurf"))?,
            );
            renderer.bind_window(WinitWindow::new(window.clone()));
            self.window = Some(window);
        }

        if self.source.is_none() {
            let source = open_source(&self.cfg.source)?;
            renderer.start(source.clone());
            self.source = Some(source);
        }
        renderer.unpause();
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        // Dropping the renderer joins the render thread, which drains the GPU.
        if let Some(renderer) = self.renderer.take() {
            renderer.stop();
        }
        self.window = None;
        self.source = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);
        if let Err(err) = self.resume(event_loop) {
            error!("startup failed: {err:#}");
            self.failure = Some(err);
            self.shutdown(event_loop);
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        let Some(renderer) = &self.renderer else {
            return;
        };
        if self.source.is_some() {
            renderer.pause();
        }
        if self.window.take().is_some() {
            renderer.unbind_window();
        }
        info!("suspended");
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }
            WindowEvent::Focused(focused) => {
                info!("Focused({})", focused);
                if let (Some(renderer), Some(_)) = (&self.renderer, &self.source) {
                    if focused {
                        renderer.unpause();
                    } else {
                        renderer.pause();
                    }
                }
            }
            _ => {}
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = args.apply(AppConfig::load(&args.config)?);
    cfg.source.validate()?;
    info!(
        validation = cfg.renderer.validation,
        external_format = %cfg.renderer.external_format,
        width = cfg.source.width,
        height = cfg.source.height,
        "config"
    );

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
