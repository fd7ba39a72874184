use std::{
    cell::Cell,
    ffi::CString,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::vk;
use itertools::Itertools;

use crate::{
    basic::color::LabelColor,
    commands::barrier::GfxImageBarrier,
    error::VkResultExt,
    foundation::{debug_messenger::DebugType, device::DeviceFunctions},
};

/// command buffer 的生命周期状态
///
/// Initial -(begin)-> Recording -(end)-> Executable -(reset / pool reset)-> Initial
///
/// 提交之后依然是 Executable，可以重复提交（非 ONE_TIME_SUBMIT 时）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}
impl CommandBufferState {
    /// Executable 状态下 begin 会隐式 reset（pool 需要 RESET_COMMAND_BUFFER）
    #[inline]
    pub fn on_begin(self) -> Option<Self> {
        match self {
            Self::Initial | Self::Executable => Some(Self::Recording),
            Self::Recording => None,
        }
    }

    #[inline]
    pub fn on_end(self) -> Option<Self> {
        match self {
            Self::Recording => Some(Self::Executable),
            Self::Initial | Self::Executable => None,
        }
    }

    #[inline]
    pub fn can_submit(self) -> bool {
        self == Self::Executable
    }
}

/// 命令缓冲封装
///
/// 由 [`GfxCommandPool`](crate::commands::command_pool::GfxCommandPool) 分配，随 pool 一起释放。
///
/// # 使用示例
/// ```ignore
/// let cmd = pool.allocate_buffer("my-pass")?;
/// cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, "my-pass");
/// cmd.cmd_bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
/// // 绘制命令...
/// cmd.end();
/// ```
pub struct GfxCommandBuffer {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    family_index: u32,
    device_functions: Arc<DeviceFunctions>,

    state: Cell<CommandBufferState>,
    /// begin 时记录的 pool reset 次数，与 pool 当前值不同说明 pool 被 reset 过
    seen_pool_epoch: Cell<u64>,
    pool_epoch: Arc<AtomicU64>,

    name: String,
}
// new & init
impl GfxCommandBuffer {
    pub(crate) fn new(
        handle: vk::CommandBuffer,
        pool: vk::CommandPool,
        family_index: u32,
        device_functions: Arc<DeviceFunctions>,
        pool_epoch: Arc<AtomicU64>,
        debug_name: &str,
    ) -> Self {
        Self {
            handle,
            pool,
            family_index,
            device_functions,
            state: Cell::new(CommandBufferState::Initial),
            seen_pool_epoch: Cell::new(pool_epoch.load(Ordering::Acquire)),
            pool_epoch,
            name: debug_name.to_string(),
        }
    }
}
// getters
impl GfxCommandBuffer {
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// pool reset 之后，所有 command buffer 回到 Initial
    pub fn state(&self) -> CommandBufferState {
        if self.pool_epoch.load(Ordering::Acquire) != self.seen_pool_epoch.get() {
            CommandBufferState::Initial
        } else {
            self.state.get()
        }
    }
}
// basic 命令
impl GfxCommandBuffer {
    /// 开始录制 command，并自动设置 debug label
    pub fn begin(&self, usage_flag: vk::CommandBufferUsageFlags, debug_label_name: &str) {
        let Some(next) = self.state().on_begin() else {
            log::warn!("GfxCommandBuffer({}): begin while {:?}", self.name, self.state());
            debug_assert!(false, "command buffer is already recording");
            return;
        };
        unsafe {
            self.device_functions
                .begin_command_buffer(self.handle, &vk::CommandBufferBeginInfo::default().flags(usage_flag))
                .vk_fatal("vkBeginCommandBuffer");
        }
        self.seen_pool_epoch.set(self.pool_epoch.load(Ordering::Acquire));
        self.state.set(next);
        self.begin_label(debug_label_name, LabelColor::COLOR_CMD);
    }

    /// 结束录制 command，并结束 debug label
    pub fn end(&self) {
        let Some(next) = self.state().on_end() else {
            log::warn!("GfxCommandBuffer({}): end while {:?}", self.name, self.state());
            debug_assert!(false, "command buffer is not recording");
            return;
        };
        self.end_label();
        unsafe { self.device_functions.end_command_buffer(self.handle) }.vk_fatal("vkEndCommandBuffer");
        self.state.set(next);
    }

    /// 需要 pool 带有 RESET_COMMAND_BUFFER
    pub fn reset(&self, flags: vk::CommandBufferResetFlags) {
        unsafe { self.device_functions.reset_command_buffer(self.handle, flags) }.vk_fatal("vkResetCommandBuffer");
        self.state.set(CommandBufferState::Initial);
    }
}
// 数据传输类型
impl GfxCommandBuffer {
    /// - command type: action
    /// - supported queue types: transfer, graphics, compute
    #[inline]
    pub fn cmd_copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device_functions.cmd_copy_buffer(self.handle, src, dst, regions) }
    }

    /// - command type: action
    /// - supported queue types: transfer, graphics, compute
    #[inline]
    pub fn cmd_copy_buffer_to_image(&self, copy_info: &vk::CopyBufferToImageInfo2) {
        unsafe { self.device_functions.cmd_copy_buffer_to_image2(self.handle, copy_info) }
    }

    /// - command type: action
    /// - supported queue types: transfer, graphics, compute
    #[inline]
    pub fn cmd_copy_image(&self, copy_info: &vk::CopyImageInfo2) {
        unsafe { self.device_functions.cmd_copy_image2(self.handle, copy_info) }
    }

    /// - command type: action
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_blit_image(&self, blit_info: &vk::BlitImageInfo2) {
        unsafe { self.device_functions.cmd_blit_image2(self.handle, blit_info) }
    }

    /// 将 data 传输到 buffer 中，大小限制：65536Bytes=64KB
    ///
    /// 需要在 render pass 之外进行，注意同步
    ///
    /// - command type: action
    /// - supported queue types: transfer, graphics, compute
    #[inline]
    pub fn cmd_update_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) {
        unsafe { self.device_functions.cmd_update_buffer(self.handle, buffer, offset, data) }
    }

    /// - command type: action
    /// - supported queue types: graphics, compute
    #[inline]
    pub fn cmd_clear_color_image(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        clear_value: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe { self.device_functions.cmd_clear_color_image(self.handle, image, layout, clear_value, ranges) }
    }

    /// - command type: state
    /// - supported queue types: graphics, compute
    #[inline]
    pub fn cmd_push_constants(
        &self,
        pipeline_layout: vk::PipelineLayout,
        stage: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.device_functions.cmd_push_constants(self.handle, pipeline_layout, stage, offset, data) }
    }
}
// 绘制类型的命令
impl GfxCommandBuffer {
    /// - command type: action, state
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_begin_rendering(&self, rendering_info: &vk::RenderingInfo) {
        unsafe { self.device_functions.cmd_begin_rendering(self.handle, rendering_info) }
    }

    /// - command type: action, state
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_end_rendering(&self) {
        unsafe { self.device_functions.cmd_end_rendering(self.handle) }
    }

    /// - command type: action
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device_functions.cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    /// - command type: action
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_draw_indexed(
        &self,
        index_cnt: u32,
        first_index: u32,
        instance_cnt: u32,
        first_instance: u32,
        vertex_offset: i32,
    ) {
        unsafe {
            self.device_functions.cmd_draw_indexed(
                self.handle,
                index_cnt,
                instance_cnt,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    /// - command type: state
    /// - supported queue types: graphics, compute
    #[inline]
    pub fn cmd_bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device_functions.cmd_bind_pipeline(self.handle, bind_point, pipeline) }
    }

    /// - command type: state
    /// - supported queue types: graphics, compute
    #[inline]
    pub fn cmd_bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: Option<&[u32]>,
    ) {
        unsafe {
            self.device_functions.cmd_bind_descriptor_sets(
                self.handle,
                bind_point,
                pipeline_layout,
                first_set,
                descriptor_sets,
                dynamic_offsets.unwrap_or(&[]),
            );
        }
    }

    /// buffers 每个 vertex buffer 以及 offset
    /// - command type: state
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_bind_vertex_buffers(&self, first_bind: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        unsafe { self.device_functions.cmd_bind_vertex_buffers(self.handle, first_bind, buffers, offsets) }
    }

    /// - command type: state
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe { self.device_functions.cmd_bind_index_buffer(self.handle, buffer, offset, index_type) }
    }

    /// - command type: state
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_set_viewport(&self, first_viewport: u32, viewports: &[vk::Viewport]) {
        unsafe { self.device_functions.cmd_set_viewport(self.handle, first_viewport, viewports) }
    }

    /// - command type: state
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_set_scissor(&self, first_scissor: u32, scissors: &[vk::Rect2D]) {
        unsafe { self.device_functions.cmd_set_scissor(self.handle, first_scissor, scissors) }
    }

    /// - command type: state
    /// - supported queue types: graphics
    #[inline]
    pub fn cmd_set_cull_mode(&self, cull_mode: vk::CullModeFlags) {
        unsafe { self.device_functions.cmd_set_cull_mode(self.handle, cull_mode) }
    }
}
// 计算着色器相关命令
impl GfxCommandBuffer {
    /// - command type: action
    /// - supported queue types: compute
    #[inline]
    pub fn cmd_dispatch(&self, group_cnt: glam::UVec3) {
        unsafe { self.device_functions.cmd_dispatch(self.handle, group_cnt.x, group_cnt.y, group_cnt.z) }
    }
}
// 同步相关命令
impl GfxCommandBuffer {
    /// - command type: synchronize
    /// - supported queue types: graphics, compute, transfer
    pub fn image_memory_barrier(&self, dependency_flags: vk::DependencyFlags, barriers: &[GfxImageBarrier]) {
        let barriers = barriers.iter().map(|b| *b.inner()).collect_vec();
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(&barriers).dependency_flags(dependency_flags);
        unsafe { self.device_functions.cmd_pipeline_barrier2(self.handle, &dependency_info) }
    }

    /// 粗粒度的 layout 转换，aspect 由 layout 和 format 推断
    ///
    /// - command type: synchronize
    /// - supported queue types: graphics, compute, transfer
    pub fn transition_image_layout(
        &self,
        image: vk::Image,
        format: vk::Format,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let barrier = GfxImageBarrier::layout_transition(image, format, old_layout, new_layout);
        self.image_memory_barrier(vk::DependencyFlags::empty(), std::slice::from_ref(&barrier));
    }
}
// debug 相关命令
impl GfxCommandBuffer {
    /// - command type: state, action
    /// - supported queue type: graphics, compute
    pub fn begin_label(&self, label_name: &str, label_color: glam::Vec4) {
        let Some(debug_utils) = self.device_functions.debug_utils.as_ref() else {
            return;
        };
        let name = CString::new(label_name).unwrap_or_default();
        unsafe {
            debug_utils.cmd_begin_debug_utils_label(
                self.handle,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(label_color.into()),
            );
        }
    }

    /// - command type: state, action
    /// - supported queue type: graphics, compute
    pub fn end_label(&self) {
        if let Some(debug_utils) = self.device_functions.debug_utils.as_ref() {
            unsafe { debug_utils.cmd_end_debug_utils_label(self.handle) };
        }
    }

    /// - command type: action
    /// - supported queue type: graphics, compute
    pub fn insert_label(&self, label_name: &str, label_color: glam::Vec4) {
        let Some(debug_utils) = self.device_functions.debug_utils.as_ref() else {
            return;
        };
        let name = CString::new(label_name).unwrap_or_default();
        unsafe {
            debug_utils.cmd_insert_debug_utils_label(
                self.handle,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(label_color.into()),
            );
        }
    }
}
impl DebugType for GfxCommandBuffer {
    fn debug_type_name() -> &'static str {
        "GfxCommandBuffer"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use CommandBufferState::*;

        assert_eq!(Initial.on_begin(), Some(Recording));
        assert_eq!(Recording.on_end(), Some(Executable));
        assert!(Executable.can_submit());

        // Executable 可以再次 begin（隐式 reset）
        assert_eq!(Executable.on_begin(), Some(Recording));

        // 误用
        assert_eq!(Recording.on_begin(), None);
        assert_eq!(Initial.on_end(), None);
        assert_eq!(Executable.on_end(), None);
        assert!(!Initial.can_submit());
        assert!(!Recording.can_submit());
    }
}
