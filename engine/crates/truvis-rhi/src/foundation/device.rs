use std::{
    collections::HashMap,
    ffi::{CStr, CString},
    ops::Deref,
    sync::{Arc, Mutex},
};

use ash::vk;
use itertools::Itertools;

use crate::{
    commands::{
        command_buffer::GfxCommandBuffer,
        command_pool::GfxCommandPool,
        fence::GfxFence,
        queue::{GfxQueue, QueueRole},
        submit_info::GfxSubmitInfo,
    },
    error::{GfxError, GfxResult, VkResultExt},
    foundation::{
        debug_messenger::{DebugType, object_name_info, typed_debug_name},
        instance::GfxInstance,
        physical_device::{GfxPhysicalDevice, PhysicalDeviceSelector},
    },
    swapchain::surface::GfxSurface,
};

/// Vulkan 设备函数指针的集合
///
/// 这些函数指针在整个应用生命周期中保持不变，可以在线程间共享
pub struct DeviceFunctions {
    /// 核心 Vulkan 设备 API（包含 1.3 的 dynamic rendering 与 synchronization2）
    pub(crate) device: ash::Device,
    pub(crate) swapchain: ash::khr::swapchain::Device,
    /// 只有在 instance 启用了 debug utils 时才有值
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,
}

// getters
impl DeviceFunctions {
    #[inline]
    pub fn swapchain(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain
    }

    #[inline]
    pub fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Device> {
        self.debug_utils.as_ref()
    }
}

// tools
impl DeviceFunctions {
    pub fn set_object_debug_name<T: vk::Handle>(&self, handle: T, name: impl AsRef<str>) {
        let Some(debug_utils) = self.debug_utils.as_ref() else {
            return;
        };
        let name = CString::new(name.as_ref()).unwrap_or_default();
        let result = unsafe { debug_utils.set_debug_utils_object_name(&object_name_info(handle, &name)) };
        if let Err(e) = result {
            log::warn!("failed to set debug name {:?}: {:?}", name, e);
        }
    }

    pub fn set_debug_name<T: DebugType>(&self, handle: &T, name: impl AsRef<str>) {
        self.set_object_debug_name(handle.vk_handle(), typed_debug_name::<T>(name.as_ref()));
    }
}

impl Deref for DeviceFunctions {
    type Target = ash::Device;
    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

/// 用于 `cmd_immediate_submit` 的对象，在 transfer queue 上执行
struct ImmediateSubmit {
    pool: GfxCommandPool,
    cmd: GfxCommandBuffer,
    fence: GfxFence,
}

/// 逻辑设备，以及 4 个角色的 queue
///
/// # Destroy
/// 必须在所有依赖 device 的对象销毁之后，手动调用 `destroy()`
pub struct GfxDevice {
    /// 多个组件需要共享相同的设备函数指针（GfxQueue、GfxCommandBuffer、GfxFence 等）
    pub(crate) functions: Arc<DeviceFunctions>,
    physical_device: GfxPhysicalDevice,

    graphics_queue: GfxQueue,
    present_queue: GfxQueue,
    transfer_queue: GfxQueue,
    compute_queue: GfxQueue,

    /// 销毁之后为 None
    immediate: Mutex<Option<ImmediateSubmit>>,
    destroyed: bool,
}

// new & init
impl GfxDevice {
    /// 选择 physical device，创建 logical device、queue，以及 immediate submit 所需的对象
    pub fn new(
        instance: &GfxInstance,
        surface: Option<&GfxSurface>,
        selector: &PhysicalDeviceSelector,
    ) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxDevice::new");

        let physical_device = selector.select(instance.ash_instance(), surface)?;
        let families = physical_device.queue_families().unique_families();

        // 每个 family 创建一个 queue
        let priorities = [1.0_f32];
        let queue_create_infos = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default().queue_family_index(family).queue_priorities(&priorities)
            })
            .collect_vec();

        let device = Self::create_device(instance, &physical_device, &queue_create_infos)?;
        let debug_utils = instance
            .debug_utils_enabled()
            .then(|| ash::ext::debug_utils::Device::new(instance.ash_instance(), &device));
        let functions = Arc::new(DeviceFunctions {
            swapchain: ash::khr::swapchain::Device::new(instance.ash_instance(), &device),
            device,
            debug_utils,
        });

        // 同一个 VkQueue 共享同一把锁
        let queue_locks: HashMap<u32, Arc<Mutex<()>>> =
            families.iter().map(|&family| (family, Arc::new(Mutex::new(())))).collect();
        let make_queue = |role: QueueRole| {
            let family_index = physical_device.queue_families().family(role);
            let queue = GfxQueue {
                handle: unsafe { functions.get_device_queue(family_index, 0) },
                role,
                family_index,
                device_functions: functions.clone(),
                lock: queue_locks[&family_index].clone(),
            };
            functions.set_object_debug_name(queue.handle, role.debug_name());
            queue
        };

        let graphics_queue = make_queue(QueueRole::Graphics);
        let present_queue = make_queue(QueueRole::Present);
        let transfer_queue = make_queue(QueueRole::Transfer);
        let compute_queue = make_queue(QueueRole::Compute);

        let pool = GfxCommandPool::new_with(
            functions.clone(),
            transfer_queue.family_index(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER | vk::CommandPoolCreateFlags::TRANSIENT,
            "immediate",
        )?;
        let cmd = pool.allocate_buffer("immediate")?;
        let fence = GfxFence::new_with(functions.clone(), true, "immediate")?;

        Ok(Self {
            functions,
            physical_device,
            graphics_queue,
            present_queue,
            transfer_queue,
            compute_queue,
            immediate: Mutex::new(Some(ImmediateSubmit { pool, cmd, fence })),
            destroyed: false,
        })
    }

    fn create_device(
        instance: &GfxInstance,
        physical_device: &GfxPhysicalDevice,
        queue_create_infos: &[vk::DeviceQueueCreateInfo],
    ) -> GfxResult<ash::Device> {
        let device_exts = physical_device.enabled_extensions.iter().map(|e| e.as_ptr()).collect_vec();
        log::info!(
            "device extensions: {}",
            physical_device.enabled_extensions.iter().map(|e| format!("\n\t{:?}", e.as_c_str())).join("")
        );

        // device 所需的所有 features：core + vulkan 1.2 + vulkan 1.3
        let features = physical_device.enabled_features();
        let mut features12 = features.vulkan12_features();
        let mut features13 = features.vulkan13_features();
        let mut all_features = vk::PhysicalDeviceFeatures2::default()
            .features(features.core_features())
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(queue_create_infos)
            .enabled_extension_names(&device_exts)
            .push_next(&mut all_features);

        unsafe { instance.ash_instance().create_device(physical_device.handle(), &device_create_info, None) }
            .vk_err("vkCreateDevice")
    }
}

// getters
impl GfxDevice {
    #[inline]
    pub fn functions(&self) -> &Arc<DeviceFunctions> {
        &self.functions
    }

    #[inline]
    pub fn ash_device(&self) -> &ash::Device {
        &self.functions.device
    }

    #[inline]
    pub fn physical_device(&self) -> &GfxPhysicalDevice {
        &self.physical_device
    }

    #[inline]
    pub fn queue(&self, role: QueueRole) -> &GfxQueue {
        match role {
            QueueRole::Graphics => &self.graphics_queue,
            QueueRole::Present => &self.present_queue,
            QueueRole::Transfer => &self.transfer_queue,
            QueueRole::Compute => &self.compute_queue,
        }
    }

    #[inline]
    pub fn graphics_queue(&self) -> &GfxQueue {
        &self.graphics_queue
    }

    #[inline]
    pub fn present_queue(&self) -> &GfxQueue {
        &self.present_queue
    }

    #[inline]
    pub fn transfer_queue(&self) -> &GfxQueue {
        &self.transfer_queue
    }

    #[inline]
    pub fn compute_queue(&self) -> &GfxQueue {
        &self.compute_queue
    }

    #[inline]
    pub fn max_image_dimension_2d(&self) -> u32 {
        self.physical_device.limits().max_image_dimension2_d
    }

    #[inline]
    pub fn max_push_constants_size(&self) -> u32 {
        self.physical_device.limits().max_push_constants_size
    }

    #[inline]
    pub fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.physical_device.limits().min_uniform_buffer_offset_alignment
    }

    #[inline]
    pub fn min_storage_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.physical_device.limits().min_storage_buffer_offset_alignment
    }

    #[inline]
    pub fn gpu_name(&self) -> &CStr {
        self.physical_device.properties().device_name_as_c_str().unwrap_or(c"unknown")
    }
}

// tools
impl GfxDevice {
    /// 等待 device idle
    pub fn wait(&self) {
        unsafe { self.functions.device_wait_idle() }.vk_fatal("vkDeviceWaitIdle");
    }

    /// 依次等待每个 queue idle
    pub fn wait_all(&self) {
        QueueRole::ALL
            .iter()
            .map(|role| self.queue(*role))
            .unique_by(|queue| queue.handle())
            .for_each(|queue| queue.wait_idle());
    }

    /// 立即录制并在 transfer queue 上执行一段命令，阻塞直到 GPU 执行完成
    ///
    /// 多个线程同时调用时会串行执行
    pub fn cmd_immediate_submit<R>(&self, func: impl FnOnce(&GfxCommandBuffer) -> R) -> R {
        match self.cmd_immediate_submit_with_timeout(u64::MAX, func) {
            Ok(result) => result,
            Err(e) => {
                log::error!("{}", e);
                panic!("{}", e);
            }
        }
    }

    /// 同 `cmd_immediate_submit`，但是等待 GPU 最多 timeout_ns
    ///
    /// 超时时返回 `GfxError::Timeout`，此时命令可能仍在执行；
    /// 下一次调用会先等待它完成，之后才会 reset fence 与 command buffer
    pub fn cmd_immediate_submit_with_timeout<R>(
        &self,
        timeout_ns: u64,
        func: impl FnOnce(&GfxCommandBuffer) -> R,
    ) -> GfxResult<R> {
        let _span = tracy_client::span!("GfxDevice::cmd_immediate_submit");

        let guard = self.immediate.lock().unwrap_or_else(|e| e.into_inner());
        let Some(immediate) = guard.as_ref() else {
            log::error!("cmd_immediate_submit called after the device was destroyed");
            panic!("cmd_immediate_submit called after the device was destroyed");
        };

        run_immediate(
            || immediate.fence.wait(timeout_ns),
            || {
                immediate.fence.reset();
                immediate.cmd.reset(vk::CommandBufferResetFlags::empty());

                immediate.cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, "immediate-submit");
                let result = func(&immediate.cmd);
                immediate.cmd.end();

                self.transfer_queue.submit(&[GfxSubmitInfo::new(&[&immediate.cmd])], Some(&immediate.fence));
                result
            },
            timeout_ns,
        )
    }
}

/// immediate submit 的时序：等待上一次提交完成，录制并提交，再等待本次完成
///
/// 上一次提交超时时 fence 仍处于 pending，此时 reset 是非法的，所以只能先等待
fn run_immediate<R>(wait_fence: impl Fn() -> bool, submit: impl FnOnce() -> R, timeout_ns: u64) -> GfxResult<R> {
    if !wait_fence() {
        return Err(GfxError::Timeout {
            call: "previous immediate submit",
            timeout_ns,
        });
    }
    let result = submit();
    if !wait_fence() {
        return Err(GfxError::Timeout {
            call: "immediate submit",
            timeout_ns,
        });
    }
    Ok(result)
}

// destroy
impl GfxDevice {
    /// 销毁 immediate submit 使用的对象；需要在 allocator 之前调用
    pub(crate) fn destroy_immediate(&self) {
        let mut guard = self.immediate.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ImmediateSubmit { pool, cmd, fence }) = guard.take() {
            fence.wait(u64::MAX);
            fence.destroy();
            pool.free_buffers(vec![cmd]);
            pool.destroy();
        }
    }

    /// 所有依赖 device 的对象都销毁之后调用
    pub fn destroy(mut self) {
        self.destroy_immediate();
        log::info!("destroying device");
        unsafe { self.functions.destroy_device(None) };
        self.destroyed = true;
    }
}
impl Drop for GfxDevice {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("GfxDevice dropped without destroy(), device leaked");
        }
    }
}

impl Deref for GfxDevice {
    type Target = DeviceFunctions;
    fn deref(&self) -> &Self::Target {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    /// fence 的模拟：signaled 与否，以及 wait 能否在 timeout 内等到
    struct MockFence {
        signaled: Cell<bool>,
        /// 为 true 时 GPU 在 timeout 内完成
        completes: Cell<bool>,
        log: RefCell<Vec<&'static str>>,
    }
    impl MockFence {
        fn new() -> Self {
            Self {
                signaled: Cell::new(true),
                completes: Cell::new(true),
                log: RefCell::new(vec![]),
            }
        }

        fn wait(&self) -> bool {
            self.log.borrow_mut().push("wait");
            if !self.signaled.get() && self.completes.get() {
                self.signaled.set(true);
            }
            self.signaled.get()
        }

        fn submit(&self) -> u32 {
            assert!(self.signaled.get(), "reset a pending fence");
            self.log.borrow_mut().push("submit");
            self.signaled.set(false);
            7
        }
    }

    #[test]
    fn test_immediate_submit_completes() {
        let fence = MockFence::new();
        let result = run_immediate(|| fence.wait(), || fence.submit(), 1000);
        assert_eq!(result.unwrap(), 7);
        assert_eq!(*fence.log.borrow(), ["wait", "submit", "wait"]);
        assert!(fence.signaled.get());
    }

    #[test]
    fn test_immediate_submit_timeout_then_recover() {
        let fence = MockFence::new();
        fence.completes.set(false);
        let result = run_immediate(|| fence.wait(), || fence.submit(), 1000);
        assert!(matches!(
            result,
            Err(GfxError::Timeout {
                call: "immediate submit",
                timeout_ns: 1000
            })
        ));

        // GPU 仍未完成：不会 reset pending 的 fence，也不会再次提交
        fence.log.borrow_mut().clear();
        let result = run_immediate(|| fence.wait(), || fence.submit(), 1000);
        assert!(matches!(
            result,
            Err(GfxError::Timeout {
                call: "previous immediate submit",
                ..
            })
        ));
        assert_eq!(*fence.log.borrow(), ["wait"]);

        // GPU 完成之后恢复正常
        fence.completes.set(true);
        fence.log.borrow_mut().clear();
        assert_eq!(run_immediate(|| fence.wait(), || fence.submit(), 1000).unwrap(), 7);
        assert_eq!(*fence.log.borrow(), ["wait", "submit", "wait"]);
    }
}
