use std::sync::Arc;

use ash::vk;

use crate::{
    commands::{
        command_buffer::GfxCommandBuffer, fence::GfxFence, queue::GfxQueue, semaphore::GfxSemaphore,
        submit_info::GfxSubmitInfo,
    },
    error::{GfxError, GfxResult, VkResultExt},
    foundation::device::{DeviceFunctions, GfxDevice},
    swapchain::{
        negotiate::{
            DESIRED_SURFACE_FORMATS, SWAPCHAIN_IMAGE_USAGE, check_frames_fit, check_resize_extent,
            present_mode_for_vsync, select_composite_alpha, select_extent, select_image_count, select_pre_transform,
            select_present_mode, select_sharing_mode, select_surface_format,
        },
        present_state::{FrameCursor, SwapchainState, classify_acquire, classify_present, is_presentable_layout},
        surface::GfxSurface,
    },
};

/// 创建 swapchain 的参数
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    /// 通常是 window 的 physical size；surface 固定了 extent 时会被忽略
    pub extent: vk::Extent2D,
    /// frames in flight，必须小于最终的 image 数量
    pub frames_count: usize,
    pub vsync: bool,
    /// 按优先级排列
    pub desired_formats: Vec<vk::SurfaceFormatKHR>,
}
impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            frames_count: 2,
            vsync: true,
            desired_formats: DESIRED_SURFACE_FORMATS.to_vec(),
        }
    }
}

/// 每个 frame in flight 独占的同步对象
pub struct FrameSyncData {
    /// 该帧提交的 GPU 工作完成后 signal；创建时就是 signaled
    pub render_fence: GfxFence,
    /// acquire 完成后 signal，submit 时等待
    pub image_acquired: GfxSemaphore,
    /// 渲染完成后 signal，present 时等待
    pub render_complete: GfxSemaphore,
}
impl FrameSyncData {
    /// 中途失败时，已经创建的对象会被销毁
    fn new(device_functions: &Arc<DeviceFunctions>, frame_index: usize) -> GfxResult<Self> {
        let render_fence = GfxFence::new_with(device_functions.clone(), true, format!("render_frame_{frame_index}"))?;
        let image_acquired =
            match GfxSemaphore::new_binary_with(device_functions.clone(), format!("image_acquired_{frame_index}")) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    render_fence.destroy();
                    return Err(e);
                }
            };
        let render_complete =
            match GfxSemaphore::new_binary_with(device_functions.clone(), format!("render_complete_{frame_index}")) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    render_fence.destroy();
                    image_acquired.destroy();
                    return Err(e);
                }
            };
        Ok(Self {
            render_fence,
            image_acquired,
            render_complete,
        })
    }

    fn destroy(self) {
        self.render_fence.destroy();
        self.image_acquired.destroy();
        self.render_complete.destroy();
    }
}

/// swapchain，以及 frames in flight 的同步对象
///
/// 一帧的流程：
/// 1. `acquire_next_image`：推进 frame ring，等待该 slot 的 fence，acquire image
/// 2. 录制命令，通过 `set_layout` 将 image 转换为 PRESENT_SRC
/// 3. `present`：提交命令并 present
///
/// 收到 out of date / suboptimal 后 `is_resize_required()` 为 true，需要调用者 `resize`
///
/// # Destroy
/// 需要在 device 销毁之前手动调用 `destroy()`
pub struct GfxSwapchain {
    device_functions: Arc<DeviceFunctions>,
    surface: GfxSurface,
    pdevice: vk::PhysicalDevice,
    max_image_dimension: u32,

    graphics_queue: GfxQueue,
    present_queue: GfxQueue,

    handle: Option<vk::SwapchainKHR>,
    state: SwapchainState,

    desired_extent: vk::Extent2D,
    desired_present_mode: vk::PresentModeKHR,
    desired_formats: Vec<vk::SurfaceFormatKHR>,

    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,

    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    image_layouts: Vec<vk::ImageLayout>,

    frames: Vec<FrameSyncData>,
    cursor: FrameCursor,
}

// new & init
impl GfxSwapchain {
    pub fn new(device: &GfxDevice, surface: &GfxSurface, desc: SwapchainDesc) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxSwapchain::new");

        if desc.frames_count == 0 {
            return Err(GfxError::TooFewSwapchainImages {
                frames: 0,
                images: 0,
            });
        }

        let mut swapchain = Self {
            device_functions: device.functions().clone(),
            surface: surface.clone(),
            pdevice: device.physical_device().handle(),
            max_image_dimension: device.max_image_dimension_2d(),

            graphics_queue: device.graphics_queue().clone(),
            present_queue: device.present_queue().clone(),

            handle: None,
            state: SwapchainState::Uninitialized,

            desired_extent: desc.extent,
            desired_present_mode: present_mode_for_vsync(desc.vsync),
            desired_formats: desc.desired_formats,

            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),

            images: vec![],
            image_views: vec![],
            image_layouts: vec![],

            frames: vec![],
            cursor: FrameCursor::new(desc.frames_count),
        };

        if let Err(e) = swapchain.create(vk::SwapchainKHR::null()) {
            swapchain.destroy();
            return Err(e);
        }
        swapchain.state = SwapchainState::Live;
        Ok(swapchain)
    }

    /// 创建 swapchain handle、image view 以及每帧的同步对象
    ///
    /// 失败时本次创建的 handle、view 与同步对象都会被销毁，`self.handle` 保持为 None
    ///
    /// # param
    /// * old_swapchain - resize 时传入旧的 swapchain，由调用者在之后销毁
    fn create(&mut self, old_swapchain: vk::SwapchainKHR) -> GfxResult<()> {
        let caps = self.surface.capabilities(self.pdevice)?;
        if !caps.supported_usage_flags.contains(SWAPCHAIN_IMAGE_USAGE) {
            return Err(GfxError::UnsupportedSurfaceUsage(SWAPCHAIN_IMAGE_USAGE));
        }

        let surface_format = select_surface_format(&self.desired_formats, &self.surface.formats(self.pdevice)?)
            .ok_or(GfxError::NoSurfaceFormat)?;
        let present_mode = select_present_mode(self.desired_present_mode, &self.surface.present_modes(self.pdevice)?);
        let extent = select_extent(&caps, self.desired_extent);
        let image_count = select_image_count(&caps, self.cursor.frames_count());
        let (sharing_mode, queue_family_indices) =
            select_sharing_mode(self.graphics_queue.family_index(), self.present_queue.family_index());

        log::info!(
            "create swapchain:
            surface current extent: {}x{}, min extent: {}x{}, max extent: {}x{}
            desired extent: {}x{}
            final swapchain extent: {}x{}, format: {:?}, present mode: {:?}, min image count: {}",
            caps.current_extent.width,
            caps.current_extent.height,
            caps.min_image_extent.width,
            caps.min_image_extent.height,
            caps.max_image_extent.width,
            caps.max_image_extent.height,
            self.desired_extent.width,
            self.desired_extent.height,
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(SWAPCHAIN_IMAGE_USAGE)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(select_pre_transform(&caps))
            .composite_alpha(select_composite_alpha(&caps))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain_fns = &self.device_functions.swapchain;
        let handle = unsafe { swapchain_fns.create_swapchain(&create_info, None) }.vk_err("vkCreateSwapchainKHR")?;
        self.device_functions.set_object_debug_name(handle, "main");

        let images = match unsafe { swapchain_fns.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_fns.destroy_swapchain(handle, None) };
                return Err(GfxError::Vk {
                    call: "vkGetSwapchainImagesKHR",
                    result: e,
                });
            }
        };
        if let Err(e) = check_frames_fit(self.cursor.frames_count(), images.len()) {
            unsafe { swapchain_fns.destroy_swapchain(handle, None) };
            return Err(e);
        }

        self.handle = Some(handle);
        self.surface_format = surface_format;
        self.present_mode = present_mode;
        self.extent = extent;
        self.image_layouts = vec![vk::ImageLayout::UNDEFINED; images.len()];
        self.images = images;

        for (i, image) in self.images.iter().enumerate() {
            self.device_functions.set_object_debug_name(*image, format!("swapchain_image_{i}"));
        }
        if let Err(e) = self.create_frame_resources() {
            self.destroy_frame_resources();
            if let Some(handle) = self.handle.take() {
                unsafe { self.device_functions.swapchain.destroy_swapchain(handle, None) };
            }
            return Err(e);
        }

        log::info!("swapchain created with {} images, {} frames in flight", self.images.len(), self.frames.len());
        Ok(())
    }

    /// 逐个 push 到 self 中，失败时由调用者通过 `destroy_frame_resources` 回收已经创建的部分
    fn create_frame_resources(&mut self) -> GfxResult<()> {
        for (i, image) in self.images.iter().enumerate() {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { self.device_functions.create_image_view(&create_info, None) }
                .vk_err("vkCreateImageView")?;
            self.device_functions.set_object_debug_name(view, format!("swapchain_image_view_{i}"));
            self.image_views.push(view);
        }
        for i in 0..self.cursor.frames_count() {
            self.frames.push(FrameSyncData::new(&self.device_functions, i)?);
        }
        Ok(())
    }
}

// getters
impl GfxSwapchain {
    #[inline]
    pub fn handle(&self) -> Option<vk::SwapchainKHR> {
        self.handle
    }

    /// resize 之后才会刷新为 ResizePending 以外的状态
    #[inline]
    pub fn state(&self) -> SwapchainState {
        self.state
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    #[inline]
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// 实际生效的 present mode 是否为 FIFO
    #[inline]
    pub fn is_vsync(&self) -> bool {
        self.present_mode == vk::PresentModeKHR::FIFO
    }

    #[inline]
    pub fn frames_count(&self) -> usize {
        self.cursor.frames_count()
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn frame_index(&self) -> Option<usize> {
        self.cursor.frame_index()
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.cursor.frame_id()
    }

    #[inline]
    pub fn image_index(&self) -> Option<u32> {
        self.cursor.image_index()
    }

    #[inline]
    pub fn is_resize_required(&self) -> bool {
        self.cursor.is_resize_required()
    }

    /// 当前 acquire 到的 image
    #[inline]
    pub fn image(&self) -> Option<vk::Image> {
        self.image_index().map(|i| self.images[i as usize])
    }

    #[inline]
    pub fn image_view(&self) -> Option<vk::ImageView> {
        self.image_index().map(|i| self.image_views[i as usize])
    }

    /// 当前 image 被记录的 layout
    #[inline]
    pub fn layout(&self) -> Option<vk::ImageLayout> {
        self.image_index().map(|i| self.image_layouts[i as usize])
    }

    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    #[inline]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// 当前 frame slot 的同步对象
    #[inline]
    pub fn current_frame(&self) -> Option<&FrameSyncData> {
        self.frame_index().map(|i| &self.frames[i])
    }
}

// update
impl GfxSwapchain {
    /// 推进 frame ring 并 acquire 下一张 image，没有超时
    ///
    /// return: 是否 acquire 到了 image。false 时应当跳过这一帧，并在 resize 之后重试
    #[inline]
    pub fn acquire_next_image(&mut self) -> bool {
        self.acquire_next_image_with_timeout(u64::MAX)
    }

    /// 同 `acquire_next_image`，等待 fence 与 acquire image 各自最多 timeout_ns
    ///
    /// 超时时返回 false，这一帧被跳过，不需要 resize：
    /// - fence 超时：frame ring 不前进，下一次调用重试同一个 slot
    /// - acquire 超时：fence 没有被 reset，slot 可以直接复用
    pub fn acquire_next_image_with_timeout(&mut self, timeout_ns: u64) -> bool {
        let _span = tracy_client::span!("GfxSwapchain::acquire_next_image");

        let Some(handle) = self.handle.filter(|_| self.state.can_acquire()) else {
            if self.state != SwapchainState::ResizePending {
                log::warn!("acquire next image while swapchain is {:?}", self.state);
            }
            self.cursor.request_resize();
            return false;
        };

        let frames = &self.frames;
        let Some(frame_index) = self.cursor.begin_frame(|slot| {
            let _span = tracy_client::span!("wait render fence");
            frames[slot].render_fence.wait(timeout_ns)
        }) else {
            log::debug!("wait render fence timed out after {} ns", timeout_ns);
            return false;
        };
        let frame = &self.frames[frame_index];

        let result = unsafe {
            self.device_functions.swapchain.acquire_next_image(
                handle,
                timeout_ns,
                frame.image_acquired.handle(),
                vk::Fence::null(),
            )
        };
        let outcome = classify_acquire(result).vk_fatal("vkAcquireNextImageKHR");

        // 只有确实会提交 GPU 工作时才 reset，否则下一次 wait 会永远等待
        if outcome.should_reset_fence() {
            frame.render_fence.reset();
        }
        self.cursor.on_acquire(outcome);
        self.sync_state();

        outcome.image_index().is_some()
    }

    /// 提交命令，并将当前 image present 出去
    ///
    /// 命令中需要已经将 image 转换为 PRESENT_SRC_KHR
    pub fn present(&mut self, cmd: &GfxCommandBuffer) {
        let _span = tracy_client::span!("GfxSwapchain::present");

        let (Some(handle), Some(frame_index), Some(image_index)) =
            (self.handle, self.cursor.frame_index(), self.cursor.image_index())
        else {
            log::error!("present without an acquired swapchain image");
            debug_assert!(false, "present without an acquired swapchain image");
            return;
        };
        let layout = self.image_layouts[image_index as usize];
        if !is_presentable_layout(layout) {
            log::warn!("present swapchain image {} in layout {:?}, expect PRESENT_SRC_KHR", image_index, layout);
            debug_assert!(false, "swapchain image must be transitioned to PRESENT_SRC_KHR before present");
        }

        let frame = &self.frames[frame_index];
        let submit_info = GfxSubmitInfo::new(&[cmd])
            .wait(&frame.image_acquired, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, None)
            .signal(&frame.render_complete, vk::PipelineStageFlags2::ALL_GRAPHICS, None);
        self.graphics_queue.submit(&[submit_info], Some(&frame.render_fence));

        let wait_semaphores = [frame.render_complete.handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .image_indices(&image_indices)
            .swapchains(std::slice::from_ref(&handle));

        let outcome = classify_present(self.present_queue.present(&present_info)).vk_fatal("vkQueuePresentKHR");
        self.cursor.on_present(outcome);
        self.sync_state();
    }

    /// 重建 swapchain；会等待 device idle
    ///
    /// 同步对象会重新创建，frame index 与 image index 回到无效值
    pub fn resize(&mut self, width: u32, height: u32) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxSwapchain::resize");

        if !self.state.can_resize() {
            return Err(GfxError::InvalidSwapchainState(self.state));
        }
        let desired_extent = check_resize_extent(width, height, self.max_image_dimension)?;

        log::info!("resize swapchain: {}x{} -> {}x{}", self.extent.width, self.extent.height, width, height);
        unsafe { self.device_functions.device_wait_idle() }.vk_fatal("vkDeviceWaitIdle");

        self.desired_extent = desired_extent;
        self.cursor.invalidate();
        self.destroy_frame_resources();

        let old_swapchain = self.handle.take();
        let result = self.create(old_swapchain.unwrap_or_default());
        if let Some(old_swapchain) = old_swapchain {
            unsafe { self.device_functions.swapchain.destroy_swapchain(old_swapchain, None) };
        }
        if let Err(e) = result {
            // create 已经销毁了本次创建的对象，旧 handle 也在上面销毁了
            // handle 为 None，保持 ResizePending，下一次 resize 不带 old swapchain 重新创建
            self.state = SwapchainState::ResizePending;
            return Err(e);
        }

        self.cursor.clear_resize_required();
        self.state = SwapchainState::Live;
        Ok(())
    }

    /// 修改 vsync；实际的 present mode 在下一次 resize 时生效
    pub fn set_vsync(&mut self, vsync: bool) {
        let desired = present_mode_for_vsync(vsync);
        if desired == self.desired_present_mode {
            return;
        }
        log::info!("vsync: {} -> {}", self.desired_present_mode == vk::PresentModeKHR::FIFO, vsync);
        self.desired_present_mode = desired;
        self.cursor.request_resize();
        self.sync_state();
    }

    /// 将当前 image 转换到指定 layout，并记录下来
    pub fn set_layout(&mut self, cmd: &GfxCommandBuffer, new_layout: vk::ImageLayout) {
        let Some(image_index) = self.image_index() else {
            log::warn!("set swapchain image layout without an acquired image");
            return;
        };
        let old_layout = self.image_layouts[image_index as usize];
        if old_layout == new_layout {
            return;
        }
        cmd.transition_image_layout(self.images[image_index as usize], self.format(), old_layout, new_layout);
        self.image_layouts[image_index as usize] = new_layout;
    }

    /// 将 src image 整体 blit 到当前 swapchain image 上
    ///
    /// src 需要处于 TRANSFER_SRC_OPTIMAL，swapchain image 需要处于 TRANSFER_DST_OPTIMAL
    pub fn blit_to_swapchain(&self, cmd: &GfxCommandBuffer, src_image: vk::Image, src_extent: vk::Extent2D) {
        let (Some(dst_image), Some(dst_layout)) = (self.image(), self.layout()) else {
            log::warn!("blit to swapchain without an acquired image");
            return;
        };
        debug_assert_eq!(dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let offsets = |extent: vk::Extent2D| {
            [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: extent.width as i32,
                    y: extent.height as i32,
                    z: 1,
                },
            ]
        };
        let regions = [vk::ImageBlit2::default()
            .src_subresource(subresource)
            .src_offsets(offsets(src_extent))
            .dst_subresource(subresource)
            .dst_offsets(offsets(self.extent))];
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(src_image)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(dst_image)
            .dst_image_layout(dst_layout)
            .regions(&regions)
            .filter(vk::Filter::LINEAR);
        cmd.cmd_blit_image(&blit_info);
    }

    fn sync_state(&mut self) {
        if self.state == SwapchainState::Live && self.cursor.is_resize_required() {
            self.state = SwapchainState::ResizePending;
        }
    }
}

// destroy
impl GfxSwapchain {
    fn destroy_frame_resources(&mut self) {
        for view in self.image_views.drain(..) {
            unsafe { self.device_functions.destroy_image_view(view, None) };
        }
        self.frames.drain(..).for_each(FrameSyncData::destroy);
        self.images.clear();
        self.image_layouts.clear();
    }

    pub fn destroy(mut self) {
        unsafe { self.device_functions.device_wait_idle() }.vk_fatal("vkDeviceWaitIdle");
        self.destroy_frame_resources();
        if let Some(handle) = self.handle.take() {
            unsafe { self.device_functions.swapchain.destroy_swapchain(handle, None) };
        }
        self.state = SwapchainState::Destroyed;
        log::info!("swapchain destroyed");
    }
}
impl Drop for GfxSwapchain {
    fn drop(&mut self) {
        if self.state != SwapchainState::Destroyed {
            log::warn!(
                "GfxSwapchain dropped without destroy(), {} frames of sync objects leaked",
                self.frames.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_desc() {
        let desc = SwapchainDesc::default();
        assert_eq!(desc.frames_count, 2);
        assert!(desc.vsync);
        assert_eq!(desc.desired_formats, DESIRED_SURFACE_FORMATS.to_vec());
    }

    /// resize 失败之后停留在 ResizePending：不能 acquire，但是可以再次 resize
    #[test]
    fn test_failed_resize_leaves_resize_pending() {
        let state = SwapchainState::ResizePending;
        assert!(!state.can_acquire());
        assert!(state.can_resize());
        assert!(check_resize_extent(800, 600, 16384).is_ok());

        // 销毁之后任何 resize 都会被拒绝
        assert!(!SwapchainState::Destroyed.can_resize());
        assert!(matches!(check_resize_extent(0, 600, 16384), Err(GfxError::InvalidExtent { .. })));
    }

    #[test]
    fn test_default_desc_fits_default_image_count() {
        let desc = SwapchainDesc::default();
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        let image_count = select_image_count(&caps, desc.frames_count);
        assert!(check_frames_fit(desc.frames_count, image_count as usize).is_ok());
    }
}
