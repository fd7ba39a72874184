use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use truvis_crate_tools::init_log::init_log;
use truvis_rhi::{config::GfxConfig, gfx::Gfx};
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use crate::clear_renderer::ClearScreenRenderer;

pub fn panic_handler(info: &std::panic::PanicHookInfo) {
    log::error!("{}", info);
}

pub struct WinitApp {
    config: GfxConfig,

    /// window 创建之后才会初始化
    gfx: Option<Gfx>,
    renderer: Option<ClearScreenRenderer>,

    window: Option<Window>,
}
// 总的 main 函数
impl WinitApp {
    pub fn init_env() {
        std::panic::set_hook(Box::new(panic_handler));

        init_log(log::LevelFilter::Info);

        tracy_client::Client::start();
        tracy_client::set_thread_name!("RenderThread");
    }

    /// 整个程序的入口
    pub fn run(config: GfxConfig) -> anyhow::Result<()> {
        let event_loop = EventLoop::new()?;

        let mut app = Self {
            config,
            gfx: None,
            renderer: None,
            window: None,
        };
        event_loop.run_app(&mut app)?;

        log::info!("end run.");

        app.destroy();
        Ok(())
    }
}
// new & init
impl WinitApp {
    /// 在 window 创建之后调用，初始化 Gfx 和 Renderer
    fn init_after_window(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let window_attr = Window::default_attributes()
            .with_title(self.config.app_name.clone())
            .with_inner_size(winit::dpi::LogicalSize::new(1280.0, 720.0));
        let window = event_loop.create_window(window_attr)?;

        let gfx =
            Gfx::new(&self.config, window.display_handle()?.as_raw(), Some(window.window_handle()?.as_raw()))?;
        let surface = gfx.surface().ok_or_else(|| anyhow::anyhow!("gfx created without surface"))?;
        let renderer = ClearScreenRenderer::new(&gfx, surface, &self.config, Self::window_extent(&window))?;

        self.window = Some(window);
        self.gfx = Some(gfx);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn window_extent(window: &Window) -> vk::Extent2D {
        let size = window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}
// update
impl WinitApp {
    fn on_key(&mut self, event_loop: &ActiveEventLoop, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match event.logical_key.as_ref() {
            Key::Named(NamedKey::Escape) => event_loop.exit(),
            Key::Character("v") => renderer.toggle_vsync(),
            Key::Character("b") => renderer.toggle_checker(),
            _ => {}
        }
    }
}
// destroy
impl WinitApp {
    fn destroy(mut self) {
        if let Some(gfx) = self.gfx.take() {
            if let Some(renderer) = self.renderer.take() {
                renderer.destroy(&gfx);
            }
            gfx.destroy();
        }
        // surface 销毁之后再销毁 window
        self.window = None;
    }
}
// 各种 winit 的事件处理
impl ApplicationHandler for WinitApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        log::info!("winit event: resumed");
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.init_after_window(event_loop) {
            log::error!("failed to init: {:#}", e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let (Some(gfx), Some(renderer)) = (self.gfx.as_ref(), self.renderer.as_mut()) {
                    renderer.resize(gfx, size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                self.on_key(event_loop, &event);
            }
            WindowEvent::RedrawRequested => {
                if let (Some(gfx), Some(renderer), Some(window)) =
                    (self.gfx.as_ref(), self.renderer.as_mut(), self.window.as_ref())
                {
                    renderer.render(gfx, Self::window_extent(window));
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        log::warn!("winit event: suspended");
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!("loop exiting");
    }
}
