use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ash::vk;
use itertools::Itertools;

use crate::{
    commands::command_buffer::GfxCommandBuffer,
    error::{GfxResult, VkResultExt},
    foundation::{
        debug_messenger::DebugType,
        device::{DeviceFunctions, GfxDevice},
    },
    resources::deletion_queue::DeletionQueue,
};

/// command pool 是和 queue family 绑定的，而不是和 queue 绑定的
///
/// # Destroy
/// 销毁 pool 时，其中分配的 command buffer 一并释放
pub struct GfxCommandPool {
    handle: Option<vk::CommandPool>,
    family_index: u32,
    device_functions: Arc<DeviceFunctions>,
    /// 每次 reset 递增，command buffer 借此得知自己被 pool reset 过
    reset_epoch: Arc<AtomicU64>,
    name: String,
}
// new & init
impl GfxCommandPool {
    pub fn new(
        device: &GfxDevice,
        family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new_with(device.functions().clone(), family_index, flags, debug_name)
    }

    /// device 创建过程中使用，此时还没有 GfxDevice
    pub(crate) fn new_with(
        device_functions: Arc<DeviceFunctions>,
        family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let handle = unsafe {
            device_functions.create_command_pool(
                &vk::CommandPoolCreateInfo::default().queue_family_index(family_index).flags(flags),
                None,
            )
        }
        .vk_err("vkCreateCommandPool")?;

        let command_pool = Self {
            handle: Some(handle),
            family_index,
            device_functions,
            reset_epoch: Arc::new(AtomicU64::new(0)),
            name: debug_name.as_ref().to_string(),
        };
        command_pool.device_functions.set_debug_name(&command_pool, &command_pool.name);
        Ok(command_pool)
    }
}
// getters
impl GfxCommandPool {
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.handle.unwrap_or_default()
    }

    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}
// tools
impl GfxCommandPool {
    pub fn allocate_buffer(&self, debug_name: impl AsRef<str>) -> GfxResult<GfxCommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let handle = unsafe { self.device_functions.allocate_command_buffers(&info) }
            .vk_err("vkAllocateCommandBuffers")?[0];
        Ok(self.wrap_buffer(handle, debug_name.as_ref()))
    }

    /// 命名为 `{debug_name}_{i}`
    pub fn allocate_buffers(&self, count: u32, debug_name: impl AsRef<str>) -> GfxResult<Vec<GfxCommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let handles = unsafe { self.device_functions.allocate_command_buffers(&info) }
            .vk_err("vkAllocateCommandBuffers")?;
        Ok(handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| self.wrap_buffer(handle, &format!("{}_{}", debug_name.as_ref(), i)))
            .collect())
    }

    fn wrap_buffer(&self, handle: vk::CommandBuffer, debug_name: &str) -> GfxCommandBuffer {
        let cmd = GfxCommandBuffer::new(
            handle,
            self.handle(),
            self.family_index,
            self.device_functions.clone(),
            self.reset_epoch.clone(),
            debug_name,
        );
        self.device_functions.set_debug_name(&cmd, debug_name);
        cmd
    }

    /// 这个调用并不会释放 command buffer，而是将 pool 内的 command buffer 设置到初始状态
    ///
    /// reset 之后，pool 内的 command buffer 又可以重新录制命令
    pub fn reset(&self, flags: vk::CommandPoolResetFlags) {
        unsafe { self.device_functions.reset_command_pool(self.handle(), flags) }.vk_fatal("vkResetCommandPool");
        self.reset_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// 释放之后，command buffer 不能再被使用
    pub fn free_buffers(&self, command_buffers: Vec<GfxCommandBuffer>) {
        if command_buffers.is_empty() {
            return;
        }
        debug_assert!(command_buffers.iter().all(|cmd| cmd.pool() == self.handle()));
        let handles = command_buffers.iter().map(|cmd| cmd.handle()).collect_vec();
        unsafe { self.device_functions.free_command_buffers(self.handle(), &handles) };
    }
}
// destroy
impl GfxCommandPool {
    pub fn release<A>(mut self, deletion_queue: &DeletionQueue<A>) {
        if let Some(handle) = self.handle.take() {
            deletion_queue.add_handle(handle);
        }
    }

    pub fn destroy(mut self) {
        if let Some(handle) = self.handle.take() {
            log::debug!("destroying command pool: {}", self.name);
            unsafe { self.device_functions.destroy_command_pool(handle, None) };
        }
    }
}
impl Drop for GfxCommandPool {
    fn drop(&mut self) {
        if self.handle.is_some() {
            log::warn!("GfxCommandPool({}) dropped without destroy() or release(), leaked", self.name);
        }
    }
}

impl DebugType for GfxCommandPool {
    fn debug_type_name() -> &'static str {
        "GfxCommandPool"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle()
    }
}
