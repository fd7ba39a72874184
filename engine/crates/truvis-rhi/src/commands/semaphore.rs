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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    /// 每帧使用的 GPU-GPU 信号
    Binary,
    /// 单调递增的计数器，CPU 也可以 wait / signal
    Timeline,
}

/// # Destroy
/// 需要手动 `destroy()`，或者通过 `release()` 交给 deletion queue
pub struct GfxSemaphore {
    handle: Option<vk::Semaphore>,
    kind: SemaphoreKind,
    device_functions: Arc<DeviceFunctions>,
    name: String,
}

// new & init
impl GfxSemaphore {
    pub fn new_binary(device: &GfxDevice, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        Self::new_binary_with(device.functions().clone(), debug_name)
    }

    pub(crate) fn new_binary_with(
        device_functions: Arc<DeviceFunctions>,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let handle = unsafe { device_functions.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .vk_err("vkCreateSemaphore")?;
        Ok(Self::wrap(device_functions, handle, SemaphoreKind::Binary, debug_name.as_ref()))
    }

    pub fn new_timeline(device: &GfxDevice, initial_value: u64, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        let device_functions = device.functions().clone();
        let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let timeline_semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci);
        let handle = unsafe { device_functions.create_semaphore(&timeline_semaphore_ci, None) }
            .vk_err("vkCreateSemaphore")?;
        Ok(Self::wrap(device_functions, handle, SemaphoreKind::Timeline, debug_name.as_ref()))
    }

    fn wrap(device_functions: Arc<DeviceFunctions>, handle: vk::Semaphore, kind: SemaphoreKind, name: &str) -> Self {
        let semaphore = Self {
            handle: Some(handle),
            kind,
            device_functions,
            name: name.to_string(),
        };
        semaphore.device_functions.set_debug_name(&semaphore, name);
        semaphore
    }
}

// getters
impl GfxSemaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle.unwrap_or_default()
    }

    #[inline]
    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// timeline tools
impl GfxSemaphore {
    fn is_timeline(&self, op: &str) -> bool {
        if self.kind != SemaphoreKind::Timeline {
            log::warn!("GfxSemaphore({}): {} on a binary semaphore is ignored", self.name, op);
            debug_assert!(false, "{op} requires a timeline semaphore");
            return false;
        }
        true
    }

    /// 等待 timeline 到达 value，超时返回 false
    pub fn wait(&self, value: u64, timeout_ns: u64) -> bool {
        if !self.is_timeline("wait") {
            return false;
        }
        let semaphores = [self.handle()];
        let wait_info =
            vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(std::slice::from_ref(&value));
        match unsafe { self.device_functions.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) => false,
            Err(e) => Err::<bool, _>(e).vk_fatal("vkWaitSemaphores"),
        }
    }

    /// 在 CPU 端 signal，value 必须大于当前值
    pub fn signal(&self, value: u64) {
        if !self.is_timeline("signal") {
            return;
        }
        let current = self.value();
        if value <= current {
            log::warn!("GfxSemaphore({}): signal {} is not greater than current value {}", self.name, value, current);
            debug_assert!(false, "timeline semaphore values must increase");
            return;
        }
        let signal_info = vk::SemaphoreSignalInfo::default().semaphore(self.handle()).value(value);
        unsafe { self.device_functions.signal_semaphore(&signal_info) }.vk_fatal("vkSignalSemaphore");
    }

    /// 当前的 timeline 值；binary semaphore 返回 0
    pub fn value(&self) -> u64 {
        if !self.is_timeline("value") {
            return 0;
        }
        unsafe { self.device_functions.get_semaphore_counter_value(self.handle()) }
            .vk_fatal("vkGetSemaphoreCounterValue")
    }
}

// destroy
impl GfxSemaphore {
    pub fn release<A>(mut self, deletion_queue: &DeletionQueue<A>) {
        if let Some(handle) = self.handle.take() {
            deletion_queue.add_handle(handle);
        }
    }

    pub fn destroy(mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { self.device_functions.destroy_semaphore(handle, None) };
        }
    }
}
impl Drop for GfxSemaphore {
    fn drop(&mut self) {
        if self.handle.is_some() {
            log::warn!("GfxSemaphore({}) dropped without destroy() or release(), leaked", self.name);
        }
    }
}

impl DebugType for GfxSemaphore {
    fn debug_type_name() -> &'static str {
        "GfxSemaphore"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle()
    }
}
