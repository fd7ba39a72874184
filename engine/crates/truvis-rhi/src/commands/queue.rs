use std::{
    ffi::CString,
    sync::{Arc, Mutex},
};

use ash::vk;
use itertools::Itertools;

use crate::{
    commands::{fence::GfxFence, submit_info::GfxSubmitInfo},
    error::VkResultExt,
    foundation::{debug_messenger::DebugType, device::DeviceFunctions},
};

/// queue 在 RHI 中承担的角色
///
/// RHI 内部只在 Graphics 和 Transfer 上提交；Compute 留给外部调用者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Transfer,
    Compute,
}
impl QueueRole {
    pub const ALL: [QueueRole; 4] = [QueueRole::Graphics, QueueRole::Present, QueueRole::Transfer, QueueRole::Compute];

    #[inline]
    pub fn debug_name(self) -> &'static str {
        match self {
            QueueRole::Graphics => "Queue_Graphics",
            QueueRole::Present => "Queue_Present",
            QueueRole::Transfer => "Queue_Transfer",
            QueueRole::Compute => "Queue_Compute",
        }
    }
}

/// # destroy
///
/// 随 device 一同销毁，不需要手动 destroy
///
/// 多个角色可能对应同一个 VkQueue（例如 graphics 与 present），它们共享同一把锁；
/// vkQueueSubmit / vkQueuePresentKHR 要求对同一个 queue 的访问是外部同步的
#[derive(Clone)]
pub struct GfxQueue {
    pub(crate) handle: vk::Queue,
    pub(crate) role: QueueRole,
    pub(crate) family_index: u32,
    pub(crate) device_functions: Arc<DeviceFunctions>,
    pub(crate) lock: Arc<Mutex<()>>,
}
impl DebugType for GfxQueue {
    fn debug_type_name() -> &'static str {
        "GfxQueue"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

// getters
impl GfxQueue {
    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    #[inline]
    pub fn role(&self) -> QueueRole {
        self.role
    }

    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}

// tools
impl GfxQueue {
    /// 提交失败时视为致命错误
    pub fn submit(&self, batches: &[GfxSubmitInfo], fence: Option<&GfxFence>) {
        if self.role == QueueRole::Present {
            log::warn!("submitting work through the present queue role");
            debug_assert!(false, "work must not be submitted through the present queue role");
        }

        // batches 的存在是有必要的，submit_infos 引用的 batches 的内存
        let submit_infos = batches.iter().map(|b| b.submit_info()).collect_vec();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        unsafe {
            self.device_functions
                .queue_submit2(self.handle, &submit_infos, fence.map_or(vk::Fence::null(), |f| f.handle()))
                .vk_fatal("vkQueueSubmit2");
        }
    }

    /// present 一张 swapchain image，返回 suboptimal 标志
    pub(crate) fn present(&self, present_info: &vk::PresentInfoKHR) -> Result<bool, vk::Result> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { self.device_functions.swapchain.queue_present(self.handle, present_info) }
    }

    /// 根据 Vulkan 规范，vkQueueWaitIdle 应该和 Fence 效率相同
    pub fn wait_idle(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { self.device_functions.queue_wait_idle(self.handle).vk_fatal("vkQueueWaitIdle") }
    }
}

// debug 相关命令
impl GfxQueue {
    pub fn begin_label(&self, label_name: impl AsRef<str>, label_color: glam::Vec4) {
        let Some(debug_utils) = self.device_functions.debug_utils.as_ref() else {
            return;
        };
        let name = CString::new(label_name.as_ref()).unwrap_or_default();
        unsafe {
            debug_utils.queue_begin_debug_utils_label(
                self.handle,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(label_color.into()),
            );
        }
    }

    pub fn end_label(&self) {
        if let Some(debug_utils) = self.device_functions.debug_utils.as_ref() {
            unsafe { debug_utils.queue_end_debug_utils_label(self.handle) };
        }
    }

    pub fn insert_label(&self, label_name: impl AsRef<str>, label_color: glam::Vec4) {
        let Some(debug_utils) = self.device_functions.debug_utils.as_ref() else {
            return;
        };
        let name = CString::new(label_name.as_ref()).unwrap_or_default();
        unsafe {
            debug_utils.queue_insert_debug_utils_label(
                self.handle,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(label_color.into()),
            );
        }
    }
}
