use std::sync::Arc;

use ash::vk;

use crate::{
    error::{GfxResult, VkResultExt},
    foundation::{
        debug_messenger::DebugType,
        device::{DeviceFunctions, GfxDevice},
    },
    resources::deletion_queue::DeletionQueue,
};

/// CPU 可以观察到的 GPU 完成信号
///
/// # Destroy
/// 需要手动 `destroy()`，或者通过 `release()` 交给 deletion queue；
/// 直接 drop 会泄漏并给出警告
pub struct GfxFence {
    handle: Option<vk::Fence>,
    device_functions: Arc<DeviceFunctions>,
    name: String,
}

impl DebugType for GfxFence {
    fn debug_type_name() -> &'static str {
        "GfxFence"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle()
    }
}

// new & init
impl GfxFence {
    /// # param
    /// * signaled - 是否创建时就 signaled
    pub fn new(device: &GfxDevice, signaled: bool, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        Self::new_with(device.functions().clone(), signaled, debug_name)
    }

    pub(crate) fn new_with(
        device_functions: Arc<DeviceFunctions>,
        signaled: bool,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let fence_flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let handle = unsafe { device_functions.create_fence(&vk::FenceCreateInfo::default().flags(fence_flags), None) }
            .vk_err("vkCreateFence")?;

        let fence = Self {
            handle: Some(handle),
            device_functions,
            name: debug_name.as_ref().to_string(),
        };
        fence.device_functions.set_debug_name(&fence, &fence.name);
        Ok(fence)
    }
}

// getters
impl GfxFence {
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle.unwrap_or_default()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// tools
impl GfxFence {
    /// 阻塞等待 fence，超时返回 false
    pub fn wait(&self, timeout_ns: u64) -> bool {
        let fence = self.handle();
        match unsafe { self.device_functions.wait_for_fences(std::slice::from_ref(&fence), true, timeout_ns) } {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) => false,
            Err(e) => Err::<bool, _>(e).vk_fatal("vkWaitForFences"),
        }
    }

    pub fn reset(&self) {
        let fence = self.handle();
        unsafe { self.device_functions.reset_fences(std::slice::from_ref(&fence)) }.vk_fatal("vkResetFences");
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        unsafe { self.device_functions.get_fence_status(self.handle()) }.vk_fatal("vkGetFenceStatus")
    }
}

// destroy
impl GfxFence {
    /// 交给 deletion queue，在 GPU 不再使用之后销毁
    pub fn release<A>(mut self, deletion_queue: &DeletionQueue<A>) {
        if let Some(handle) = self.handle.take() {
            deletion_queue.add_handle(handle);
        }
    }

    /// 立即销毁，调用者需要保证 fence 不在使用中
    pub fn destroy(mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { self.device_functions.destroy_fence(handle, None) };
        }
    }
}
impl Drop for GfxFence {
    fn drop(&mut self) {
        if self.handle.is_some() {
            log::warn!("GfxFence({}) dropped without destroy() or release(), leaked", self.name);
        }
    }
}
