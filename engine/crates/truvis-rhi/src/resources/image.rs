use ash::vk;
use vk_mem::Alloc;

use crate::{
    commands::{barrier::format_aspect, command_buffer::GfxCommandBuffer},
    error::{GfxError, GfxResult, VkResultExt},
    foundation::debug_messenger::DebugType,
    gfx::Gfx,
    resources::buffer::{GfxBuffer, MemoryLocation, shared_queue_families},
};

/// 计算指定 format 下每个像素需要的字节数；不支持的 format 返回 None
pub fn pixel_size_in_bytes(format: vk::Format) -> Option<usize> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// VMA 分配的 2D image，以及一个覆盖整个 image 的 view
///
/// layout 由调用者通过 `set_layout` 维护
///
/// # Destroy
/// 需要手动 `destroy()`，或者通过 `release()` 交给 deletion queue
pub struct GfxImage {
    handle: vk::Image,
    view: vk::ImageView,
    allocation: Option<vk_mem::Allocation>,

    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    layout: vk::ImageLayout,

    name: String,
}
impl DebugType for GfxImage {
    fn debug_type_name() -> &'static str {
        "GfxImage2D"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

// new & init
impl GfxImage {
    pub fn new_2d(
        gfx: &Gfx,
        name: impl AsRef<str>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> GfxResult<Self> {
        let name = name.as_ref().to_string();
        let queue_families = shared_queue_families(gfx);
        let mut image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if queue_families.len() > 1 {
            image_ci = image_ci.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&queue_families);
        }

        let allocator = gfx.allocator();
        let (handle, mut allocation) = unsafe {
            allocator.create_image(&image_ci, &MemoryLocation::GpuOnly.alloc_info())
        }
        .map_err(|result| GfxError::Allocation {
            name: name.clone(),
            result,
        })?;

        let view_ci = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: format_aspect(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { gfx.device().create_image_view(&view_ci, None) }.vk_err("vkCreateImageView") {
            Ok(view) => view,
            Err(e) => {
                unsafe { allocator.destroy_image(handle, &mut allocation) };
                return Err(e);
            }
        };

        let image = Self {
            handle,
            view,
            allocation: Some(allocation),
            extent,
            format,
            usage,
            layout: vk::ImageLayout::UNDEFINED,
            name,
        };
        gfx.device().set_debug_name(&image, &image.name);
        gfx.device().set_object_debug_name(view, format!("GfxImageView::{}", image.name));
        Ok(image)
    }
}

// getters
impl GfxImage {
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
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
        self.format
    }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    #[inline]
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// tools
impl GfxImage {
    /// 录制一个 layout 转换，并记录新的 layout
    pub fn set_layout(&mut self, cmd: &GfxCommandBuffer, new_layout: vk::ImageLayout) {
        if self.layout == new_layout {
            return;
        }
        cmd.transition_image_layout(self.handle, self.format, self.layout, new_layout);
        self.layout = new_layout;
    }

    /// 通过 staging buffer 上传整张 image 的像素，完成后 image 处于 SHADER_READ_ONLY_OPTIMAL
    ///
    /// 阻塞直到 GPU 执行完成；image 需要包含 TRANSFER_DST usage
    pub fn upload(&mut self, gfx: &Gfx, data: &[u8]) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxImage::upload");

        let pixel_size = pixel_size_in_bytes(self.format);
        let pixels_cnt = self.extent.width as usize * self.extent.height as usize;
        debug_assert_eq!(pixel_size.map(|s| s * pixels_cnt), Some(data.len()), "upload size mismatch");

        let staging = GfxBuffer::new_staging(gfx, data.len() as vk::DeviceSize, format!("{}-staging", self.name))?;
        staging.update(gfx, data, 0);

        let copy_region = vk::BufferImageCopy2::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: format_aspect(self.format),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            });

        // 上传会覆盖整张 image，原有内容不需要保留
        self.layout = vk::ImageLayout::UNDEFINED;
        gfx.cmd_immediate_submit(|cmd| {
            self.set_layout(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            cmd.cmd_copy_buffer_to_image(
                &vk::CopyBufferToImageInfo2::default()
                    .src_buffer(staging.handle())
                    .dst_image(self.handle)
                    .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .regions(std::slice::from_ref(&copy_region)),
            );
            self.set_layout(cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        });

        staging.destroy(gfx);
        Ok(())
    }
}

// destroy
impl GfxImage {
    /// 交给 deletion queue，在 GPU 不再使用之后销毁
    pub fn release(mut self, gfx: &Gfx) {
        if let Some(allocation) = self.allocation.take() {
            gfx.deletion_queue().add_image(self.handle, Some(self.view), allocation);
        }
    }

    /// 立即销毁，调用者需要保证 GPU 不再使用
    pub fn destroy(mut self, gfx: &Gfx) {
        log::debug!("destroying GfxImage: {}", self.name);
        if let Some(mut allocation) = self.allocation.take() {
            unsafe {
                gfx.device().destroy_image_view(self.view, None);
                gfx.allocator().destroy_image(self.handle, &mut allocation);
            }
        }
    }
}
impl Drop for GfxImage {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            log::warn!("GfxImage {} dropped without destroy() or release(), memory leaked", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_size() {
        assert_eq!(pixel_size_in_bytes(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(pixel_size_in_bytes(vk::Format::B8G8R8A8_SRGB), Some(4));
        assert_eq!(pixel_size_in_bytes(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(pixel_size_in_bytes(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(pixel_size_in_bytes(vk::Format::BC7_UNORM_BLOCK), None);
    }
}
