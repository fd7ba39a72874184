use std::ffi::CStr;

use crate::{
    commands::command_buffer::GfxCommandBuffer,
    config::GfxConfig,
    error::{GfxError, GfxResult, VkResultExt},
    foundation::{
        debug_messenger::GfxDebugMsger,
        device::GfxDevice,
        instance::GfxInstance,
        mem_allocator::{GfxMemAllocator, MemoryBudget},
    },
    resources::deletion_queue::{GfxDeletionQueue, VmaDestroyer},
    swapchain::surface::GfxSurface,
};

/// Vulkan 图形上下文
///
/// 持有 entry、instance、device、内存分配器以及 deletion queue，通过引用传递给需要的对象。
///
/// # 初始化流程
/// ```ignore
/// let gfx = Gfx::new(&config, display_handle, Some(window_handle))?;
/// let swapchain = GfxSwapchain::new(gfx.device(), gfx.surface().unwrap(), desc)?;
/// // 使用...
/// swapchain.destroy();
/// gfx.destroy();
/// ```
pub struct Gfx {
    /// 需要比 instance 活得更久
    vk_entry: ash::Entry,
    instance: GfxInstance,
    debug_msger: Option<GfxDebugMsger>,
    /// headless 时为 None
    surface: Option<GfxSurface>,
    device: GfxDevice,
    allocator: GfxMemAllocator,
    deletion_queue: GfxDeletionQueue,
}

// new & init
impl Gfx {
    const ENGINE_NAME: &'static str = "Truvis";

    /// # param
    /// * window_handle - 为 None 时不创建 surface，也不要求 present 能力
    pub fn new(
        config: &GfxConfig,
        display_handle: raw_window_handle::RawDisplayHandle,
        window_handle: Option<raw_window_handle::RawWindowHandle>,
    ) -> GfxResult<Self> {
        let _span = tracy_client::span!("Gfx::new");

        let vk_entry = unsafe { ash::Entry::load() }?;

        let surface_exts: Vec<&'static CStr> = if window_handle.is_some() {
            ash_window::enumerate_required_extensions(display_handle)
                .vk_err("enumerate_required_extensions")?
                .iter()
                .map(|ext| unsafe { CStr::from_ptr(*ext) })
                .collect()
        } else {
            vec![]
        };

        let instance =
            GfxInstance::new(&vk_entry, &config.app_name, Self::ENGINE_NAME, &surface_exts, config.validation)?;
        let debug_msger = if instance.debug_utils_enabled() {
            Some(GfxDebugMsger::new(&vk_entry, instance.ash_instance())?)
        } else {
            None
        };
        let surface = window_handle
            .map(|window_handle| GfxSurface::new(&vk_entry, instance.ash_instance(), display_handle, window_handle))
            .transpose()?;

        let selector = config
            .physical_device_selector()
            .map_err(|e| GfxError::InvalidSelector(format!("{e:#}")))?
            .require_present(surface.is_some());
        let device = GfxDevice::new(&instance, surface.as_ref(), &selector)?;
        log::info!("selected gpu: {:?}", device.gpu_name());

        let allocator =
            GfxMemAllocator::new(instance.ash_instance(), device.physical_device().handle(), device.ash_device())?;

        Ok(Self {
            vk_entry,
            instance,
            debug_msger,
            surface,
            device,
            allocator,
            deletion_queue: GfxDeletionQueue::new(),
        })
    }
}

// getters
impl Gfx {
    #[inline]
    pub fn vk_entry(&self) -> &ash::Entry {
        &self.vk_entry
    }

    #[inline]
    pub fn instance(&self) -> &GfxInstance {
        &self.instance
    }

    #[inline]
    pub fn surface(&self) -> Option<&GfxSurface> {
        self.surface.as_ref()
    }

    #[inline]
    pub fn device(&self) -> &GfxDevice {
        &self.device
    }

    #[inline]
    pub fn allocator(&self) -> &GfxMemAllocator {
        &self.allocator
    }

    #[inline]
    pub fn deletion_queue(&self) -> &GfxDeletionQueue {
        &self.deletion_queue
    }
}

// tools
impl Gfx {
    #[inline]
    fn destroyer(&self) -> VmaDestroyer<'_> {
        VmaDestroyer {
            device: self.device.functions(),
            allocator: &self.allocator,
        }
    }

    /// 等待 device idle，然后销毁 deletion queue 中的所有资源
    ///
    /// 用于 resize 以及退出前
    pub fn flush_deletion_queue(&self) -> usize {
        self.device.wait();
        self.deletion_queue.clear(&self.destroyer())
    }

    /// 每帧调用一次，时机：当前 frame slot 的 fence 已经 wait 完成之后（`acquire_next_image` 之后）
    ///
    /// 之后放入 deletion queue 的资源都带上 frame_id，并销毁 frames_in_flight 帧之前退休的资源
    pub fn cleanup_retired(&self, frame_id: u64, frames_in_flight: usize) -> usize {
        self.deletion_queue.begin_frame(frame_id);
        self.deletion_queue.cleanup(&self.destroyer(), frame_id, frames_in_flight as u64)
    }

    #[inline]
    pub fn memory_budget(&self) -> MemoryBudget {
        self.allocator.memory_budget(self.device.physical_device().memory_properties())
    }

    #[inline]
    pub fn cmd_immediate_submit<R>(&self, func: impl FnOnce(&GfxCommandBuffer) -> R) -> R {
        self.device.cmd_immediate_submit(func)
    }

    #[inline]
    pub fn cmd_immediate_submit_with_timeout<R>(
        &self,
        timeout_ns: u64,
        func: impl FnOnce(&GfxCommandBuffer) -> R,
    ) -> GfxResult<R> {
        self.device.cmd_immediate_submit_with_timeout(timeout_ns, func)
    }
}

// destroy
impl Gfx {
    /// 所有 swapchain、command pool 等对象都应当在此之前销毁或者 release
    pub fn destroy(self) {
        let Self {
            vk_entry,
            instance,
            debug_msger,
            surface,
            device,
            allocator,
            deletion_queue,
        } = self;

        device.wait();
        deletion_queue.clear(&VmaDestroyer {
            device: device.functions(),
            allocator: &allocator,
        });
        device.destroy_immediate();
        // vma 需要在 device 之前销毁
        drop(allocator);
        device.destroy();

        if let Some(surface) = surface {
            surface.destroy();
        }
        if let Some(debug_msger) = debug_msger {
            debug_msger.destroy();
        }
        instance.destroy();
        drop(vk_entry);
        log::info!("gfx destroyed");
    }
}
