use ash::vk;

use crate::error::{GfxResult, VkResultExt};
use crate::foundation::debug_messenger::DebugType;

/// window surface
///
/// # Destroy
/// 可以 Clone（swapchain 持有一份用于查询 capabilities），因此不实现 Drop，
/// 由 Gfx 在 device 销毁之后手动 destroy
#[derive(Clone)]
pub struct GfxSurface {
    pub(crate) handle: vk::SurfaceKHR,
    pub(crate) pf: ash::khr::surface::Instance,
}

// new & init
impl GfxSurface {
    pub fn new(
        vk_entry: &ash::Entry,
        instance: &ash::Instance,
        raw_display_handle: raw_window_handle::RawDisplayHandle,
        raw_window_handle: raw_window_handle::RawWindowHandle,
    ) -> GfxResult<Self> {
        let pf = ash::khr::surface::Instance::new(vk_entry, instance);
        let handle = unsafe {
            ash_window::create_surface(vk_entry, instance, raw_display_handle, raw_window_handle, None)
        }
        .vk_err("vkCreateSurfaceKHR")?;

        Ok(Self { handle, pf })
    }

    pub fn destroy(self) {
        log::info!("destroying surface");
        unsafe { self.pf.destroy_surface(self.handle, None) }
    }
}
// getters
impl GfxSurface {
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// 实时获取 surface capabilities，窗口尺寸变化后 current_extent 也会变化
    pub fn capabilities(&self, pdevice: vk::PhysicalDevice) -> GfxResult<vk::SurfaceCapabilitiesKHR> {
        unsafe { self.pf.get_physical_device_surface_capabilities(pdevice, self.handle) }
            .vk_err("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn formats(&self, pdevice: vk::PhysicalDevice) -> GfxResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe { self.pf.get_physical_device_surface_formats(pdevice, self.handle) }
            .vk_err("vkGetPhysicalDeviceSurfaceFormatsKHR")
    }

    pub fn present_modes(&self, pdevice: vk::PhysicalDevice) -> GfxResult<Vec<vk::PresentModeKHR>> {
        unsafe { self.pf.get_physical_device_surface_present_modes(pdevice, self.handle) }
            .vk_err("vkGetPhysicalDeviceSurfacePresentModesKHR")
    }

    /// 某个 queue family 是否可以 present 到这个 surface
    ///
    /// 查询失败时视为不支持
    pub fn supports_present(&self, pdevice: vk::PhysicalDevice, queue_family_index: u32) -> bool {
        unsafe { self.pf.get_physical_device_surface_support(pdevice, queue_family_index, self.handle) }
            .unwrap_or_else(|e| {
                log::warn!("failed to query present support of queue family {}: {:?}", queue_family_index, e);
                false
            })
    }
}

impl DebugType for GfxSurface {
    fn debug_type_name() -> &'static str {
        "GfxSurface"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
