use ash::vk;
use truvis_rhi::{
    basic::color::{ClearColor, LabelColor},
    commands::{command_buffer::GfxCommandBuffer, command_pool::GfxCommandPool},
    config::GfxConfig,
    gfx::Gfx,
    resources::{
        buffer::{GfxBuffer, MemoryLocation},
        image::GfxImage,
    },
    swapchain::{
        surface::GfxSurface,
        swapchain::{GfxSwapchain, SwapchainDesc},
    },
};

const CHECKER_SIZE: u32 = 8;
/// 每隔多少帧重建一次 frame uniform，旧的交给 deletion queue
const UNIFORM_ROTATE_FRAMES: u64 = 120;
const BUDGET_LOG_FRAMES: u64 = 600;

fn checker_pixels(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x + y) % 2 == 0 { [230, 230, 230, 255] } else { [40, 40, 40, 255] }
        })
        .collect()
}

fn clear_color_at(frame_id: u64) -> ClearColor {
    let t = frame_id as f32 * 0.01;
    ClearColor(glam::vec4(
        0.5 + 0.5 * t.sin(),
        0.5 + 0.5 * (t + 2.094).sin(),
        0.5 + 0.5 * (t + 4.188).sin(),
        1.0,
    ))
}

/// 每帧清屏（或者将一张 checker 纹理 blit 到屏幕上），然后 present
pub struct ClearScreenRenderer {
    swapchain: GfxSwapchain,

    /// 每个 frame in flight 一个 pool，每帧整体 reset
    frame_pools: Vec<GfxCommandPool>,
    frame_cmds: Vec<GfxCommandBuffer>,

    checker: GfxImage,
    /// 模拟每隔一段时间重建的 per-frame 数据
    frame_uniform: Option<GfxBuffer>,

    vsync: bool,
    show_checker: bool,
}

// new & init
impl ClearScreenRenderer {
    pub fn new(gfx: &Gfx, surface: &GfxSurface, config: &GfxConfig, extent: vk::Extent2D) -> anyhow::Result<Self> {
        let device = gfx.device();
        let swapchain = GfxSwapchain::new(
            device,
            surface,
            SwapchainDesc {
                extent,
                frames_count: config.frames_in_flight,
                vsync: config.vsync,
                ..Default::default()
            },
        )?;

        let graphics_family = device.graphics_queue().family_index();
        let mut frame_pools = Vec::with_capacity(swapchain.frames_count());
        let mut frame_cmds = Vec::with_capacity(swapchain.frames_count());
        for i in 0..swapchain.frames_count() {
            let pool = GfxCommandPool::new(
                device,
                graphics_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
                format!("frame_{i}"),
            )?;
            frame_cmds.push(pool.allocate_buffer(format!("frame_{i}"))?);
            frame_pools.push(pool);
        }

        let mut checker = GfxImage::new_2d(
            gfx,
            "checker",
            vk::Extent2D {
                width: CHECKER_SIZE,
                height: CHECKER_SIZE,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::SAMPLED,
        )?;
        checker.upload(gfx, &checker_pixels(CHECKER_SIZE))?;

        Ok(Self {
            swapchain,
            frame_pools,
            frame_cmds,
            checker,
            frame_uniform: None,
            vsync: config.vsync,
            show_checker: false,
        })
    }
}

// update
impl ClearScreenRenderer {
    pub fn render(&mut self, gfx: &Gfx, window_extent: vk::Extent2D) {
        let _span = tracy_client::span!("ClearScreenRenderer::render");

        if self.swapchain.is_resize_required() {
            self.resize(gfx, window_extent.width, window_extent.height);
        }
        if !self.swapchain.acquire_next_image() {
            // out of date，下一帧 resize 之后重试
            return;
        }
        let (Some(frame_index), Some(image)) = (self.swapchain.frame_index(), self.swapchain.image()) else {
            return;
        };
        let frame_id = self.swapchain.frame_id();

        // 当前 slot 的 fence 已经 wait 过了，可以回收 frames in flight 之前退休的资源
        gfx.cleanup_retired(frame_id, self.swapchain.frames_count());
        if frame_id % UNIFORM_ROTATE_FRAMES == 0 {
            self.rotate_frame_uniform(gfx, frame_id);
        }
        if frame_id % BUDGET_LOG_FRAMES == 0 {
            let budget = gfx.memory_budget();
            log::info!(
                "frame {}: device local memory {} MiB / {} MiB, {} resources waiting for destruction",
                frame_id,
                budget.usage_bytes >> 20,
                budget.budget_bytes >> 20,
                gfx.deletion_queue().len()
            );
        }

        self.frame_pools[frame_index].reset(vk::CommandPoolResetFlags::empty());
        let cmd = &self.frame_cmds[frame_index];
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, "clear-screen");

        self.swapchain.set_layout(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        if self.show_checker {
            cmd.begin_label("blit checker", LabelColor::COLOR_PASS);
            self.checker.set_layout(cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            self.swapchain.blit_to_swapchain(cmd, self.checker.handle(), self.checker.extent());
            cmd.end_label();
        } else {
            cmd.begin_label("clear", LabelColor::COLOR_PASS);
            cmd.cmd_clear_color_image(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color_at(frame_id).to_vk(),
                &[vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                }],
            );
            cmd.end_label();
        }
        self.swapchain.set_layout(cmd, vk::ImageLayout::PRESENT_SRC_KHR);

        cmd.end();
        self.swapchain.present(cmd);
    }

    fn rotate_frame_uniform(&mut self, gfx: &Gfx, frame_id: u64) {
        let buffer = GfxBuffer::new(
            gfx,
            format!("frame_uniform_{frame_id}"),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            size_of::<[f32; 4]>() as vk::DeviceSize,
            self.swapchain.frames_count() as vk::DeviceSize,
            MemoryLocation::CpuToGpu,
            true,
        );
        match buffer {
            Ok(buffer) => {
                let color = clear_color_at(frame_id).0.to_array();
                let bytes = color.iter().flat_map(|c| c.to_ne_bytes()).collect::<Vec<_>>();
                buffer.update(gfx, &bytes, 0);
                if let Some(old) = self.frame_uniform.replace(buffer) {
                    old.release(gfx);
                }
            }
            Err(e) => log::warn!("failed to create frame uniform: {}", e),
        }
    }

    /// width 或 height 为 0（窗口最小化）时跳过
    pub fn resize(&mut self, gfx: &Gfx, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        match self.swapchain.resize(width, height) {
            Ok(()) => {
                // resize 时 device 已经 idle，顺便清空 deletion queue
                gfx.flush_deletion_queue();
            }
            Err(e) => log::error!("failed to resize swapchain to {}x{}: {}", width, height, e),
        }
    }

    pub fn toggle_vsync(&mut self) {
        self.vsync = !self.vsync;
        self.swapchain.set_vsync(self.vsync);
    }

    pub fn toggle_checker(&mut self) {
        self.show_checker = !self.show_checker;
        log::info!("show checker: {}", self.show_checker);
    }
}

// destroy
impl ClearScreenRenderer {
    /// 资源交给 deletion queue，由 `Gfx::destroy` 统一销毁
    pub fn destroy(self, gfx: &Gfx) {
        gfx.device().wait();

        self.swapchain.destroy();
        // command buffer 随 pool 一起释放
        for pool in self.frame_pools {
            pool.release(gfx.deletion_queue());
        }
        self.checker.release(gfx);
        if let Some(buffer) = self.frame_uniform {
            buffer.release(gfx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checker_pixels() {
        let pixels = checker_pixels(4);
        assert_eq!(pixels.len(), 4 * 4 * 4);
        assert_eq!(&pixels[0..4], &[230, 230, 230, 255]);
        assert_eq!(&pixels[4..8], &[40, 40, 40, 255]);
        // 第二行从暗色开始
        assert_eq!(&pixels[16..20], &[40, 40, 40, 255]);
    }

    #[test]
    fn test_clear_color_in_range() {
        for frame_id in [0, 1, 100, 12345] {
            let color = clear_color_at(frame_id).0;
            assert!(color.min_element() >= 0.0 && color.max_element() <= 1.0);
        }
    }
}
