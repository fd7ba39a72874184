use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::{
    commands::queue::QueueRole,
    error::{GfxError, GfxResult},
    foundation::debug_messenger::DebugType,
    gfx::Gfx,
};

/// 将 value 向上对齐到 alignment 的整数倍；alignment 为 0 时不做处理
#[inline]
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment == 0 { value } else { value.div_ceil(alignment) * alignment }
}

/// buffer 中每个元素占用的字节数
///
/// UBO / SSBO 需要按照 descriptor offset 的对齐要求排布，这样每个元素都可以单独绑定
pub fn buffer_stride(
    item_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    min_ubo_align: vk::DeviceSize,
    min_ssbo_align: vk::DeviceSize,
) -> vk::DeviceSize {
    let mut align = 1;
    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        align = align.max(min_ubo_align);
    }
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        align = align.max(min_ssbo_align);
    }
    align_up(item_size, align)
}

/// 资源所在的内存位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// 只有 GPU 访问，数据通过 staging buffer 上传
    GpuOnly,
    /// CPU 顺序写入，GPU 读取，例如 staging buffer 或者每帧更新的 uniform
    CpuToGpu,
    /// 位于 host memory，CPU 随机读写，例如回读
    CpuOnly,
}
impl MemoryLocation {
    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }

    pub(crate) fn alloc_info(self) -> vk_mem::AllocationCreateInfo {
        let (usage, flags) = match self {
            Self::GpuOnly => (vk_mem::MemoryUsage::AutoPreferDevice, vk_mem::AllocationCreateFlags::empty()),
            Self::CpuToGpu => (
                vk_mem::MemoryUsage::AutoPreferDevice,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            Self::CpuOnly => (vk_mem::MemoryUsage::AutoPreferHost, vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM),
        };
        vk_mem::AllocationCreateInfo {
            usage,
            flags,
            ..Default::default()
        }
    }
}

/// graphics 与 transfer 不是同一个 family 时，资源需要在两者之间共享
pub(crate) fn shared_queue_families(gfx: &Gfx) -> Vec<u32> {
    [QueueRole::Graphics, QueueRole::Transfer, QueueRole::Compute]
        .iter()
        .map(|role| gfx.device().queue(*role).family_index())
        .sorted()
        .dedup()
        .collect()
}

/// VMA 分配的 buffer
///
/// # Destroy
/// 需要手动 `destroy()`，或者通过 `release()` 交给 deletion queue
pub struct GfxBuffer {
    handle: vk::Buffer,
    allocation: Option<vk_mem::Allocation>,

    size: vk::DeviceSize,
    stride: vk::DeviceSize,
    count: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,

    /// 在初始化阶段写死
    map_ptr: Option<*mut u8>,
    /// 只有在 buffer usage 包含 SHADER_DEVICE_ADDRESS 时才有值
    device_addr: Option<vk::DeviceAddress>,

    name: String,
}
impl DebugType for GfxBuffer {
    fn debug_type_name() -> &'static str {
        "GfxBuffer"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

// new & init
impl GfxBuffer {
    /// # param
    /// * item_size, count - buffer 由 count 个元素组成，每个元素按 `buffer_stride` 对齐
    /// * mapped - 是否在创建时 map；只对 host visible 的 location 有效
    pub fn new(
        gfx: &Gfx,
        name: impl AsRef<str>,
        usage: vk::BufferUsageFlags,
        item_size: vk::DeviceSize,
        count: vk::DeviceSize,
        location: MemoryLocation,
        mapped: bool,
    ) -> GfxResult<Self> {
        let name = name.as_ref().to_string();
        let stride = buffer_stride(
            item_size,
            usage,
            gfx.device().min_uniform_buffer_offset_alignment(),
            gfx.device().min_storage_buffer_offset_alignment(),
        );
        let size = stride * count;
        if mapped && !location.is_host_visible() {
            log::warn!("buffer {} is GpuOnly and can not be mapped", name);
        }

        let queue_families = shared_queue_families(gfx);
        let mut buffer_ci = vk::BufferCreateInfo::default().size(size).usage(usage);
        if queue_families.len() > 1 {
            buffer_ci = buffer_ci.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&queue_families);
        }

        let allocator = gfx.allocator();
        let (handle, mut allocation) = unsafe { allocator.create_buffer(&buffer_ci, &location.alloc_info()) }
            .map_err(|result| GfxError::Allocation {
                name: name.clone(),
                result,
            })?;

        let map_ptr = if mapped && location.is_host_visible() {
            match unsafe { allocator.map_memory(&mut allocation) } {
                Ok(ptr) => Some(ptr),
                Err(result) => {
                    unsafe { allocator.destroy_buffer(handle, &mut allocation) };
                    return Err(GfxError::Allocation { name, result });
                }
            }
        } else {
            None
        };

        let device_addr = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| unsafe {
            gfx.device().get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(handle))
        });

        let buffer = Self {
            handle,
            allocation: Some(allocation),
            size,
            stride,
            count,
            usage,
            location,
            map_ptr,
            device_addr,
            name,
        };
        gfx.device().set_debug_name(&buffer, &buffer.name);
        Ok(buffer)
    }

    #[inline]
    pub fn new_staging(gfx: &Gfx, size: vk::DeviceSize, name: impl AsRef<str>) -> GfxResult<Self> {
        Self::new(gfx, name, vk::BufferUsageFlags::TRANSFER_SRC, size, 1, MemoryLocation::CpuToGpu, true)
    }
}

// getters
impl GfxBuffer {
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn stride(&self) -> vk::DeviceSize {
        self.stride
    }

    #[inline]
    pub fn count(&self) -> vk::DeviceSize {
        self.count
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline]
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    #[inline]
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_addr
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.map_ptr.is_some()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// tools
impl GfxBuffer {
    /// 通过 mem map 将 bytes 写入 buffer 的 offset 处
    pub fn update(&self, gfx: &Gfx, bytes: &[u8], offset: vk::DeviceSize) {
        let (Some(ptr), Some(allocation)) = (self.map_ptr, self.allocation.as_ref()) else {
            log::warn!("buffer {} is not mapped, write ignored", self.name);
            debug_assert!(false, "write to an unmapped buffer");
            return;
        };
        if offset + bytes.len() as vk::DeviceSize > self.size {
            log::error!(
                "write out of range: buffer {} size {}, offset {}, len {}",
                self.name,
                self.size,
                offset,
                bytes.len()
            );
            debug_assert!(false, "write out of range");
            return;
        }

        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len()) };
        if let Err(e) = gfx.allocator().flush_allocation(allocation, offset, bytes.len() as vk::DeviceSize) {
            log::warn!("failed to flush buffer {}: {:?}", self.name, e);
        }
    }

    /// 创建一个临时的 staging buffer，先将数据放入 staging buffer，再 copy 到 self
    ///
    /// 阻塞直到 GPU 执行完成；self 需要包含 TRANSFER_DST usage
    pub fn upload<T: bytemuck::Pod>(&self, gfx: &Gfx, data: &[T]) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxBuffer::upload");

        let size = size_of_val(data) as vk::DeviceSize;
        let staging = Self::new_staging(gfx, size, format!("{}-staging", self.name))?;
        staging.update(gfx, bytemuck::cast_slice(data), 0);

        gfx.cmd_immediate_submit(|cmd| {
            cmd.cmd_copy_buffer(
                staging.handle(),
                self.handle,
                &[vk::BufferCopy {
                    size,
                    ..Default::default()
                }],
            );
        });

        staging.destroy(gfx);
        Ok(())
    }
}

// destroy
impl GfxBuffer {
    fn unmap(&mut self, gfx: &Gfx) {
        if let (Some(_), Some(allocation)) = (self.map_ptr.take(), self.allocation.as_mut()) {
            unsafe { gfx.allocator().unmap_memory(allocation) };
        }
    }

    /// 交给 deletion queue，在 GPU 不再使用之后销毁
    pub fn release(mut self, gfx: &Gfx) {
        self.unmap(gfx);
        if let Some(allocation) = self.allocation.take() {
            gfx.deletion_queue().add_buffer(self.handle, allocation);
        }
    }

    /// 立即销毁，调用者需要保证 GPU 不再使用
    pub fn destroy(mut self, gfx: &Gfx) {
        self.unmap(gfx);
        if let Some(mut allocation) = self.allocation.take() {
            unsafe { gfx.allocator().destroy_buffer(self.handle, &mut allocation) };
        }
    }
}
impl Drop for GfxBuffer {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            log::warn!("GfxBuffer {} dropped without destroy() or release(), memory leaked", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 64), 320);
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn test_buffer_stride() {
        let ubo = vk::BufferUsageFlags::UNIFORM_BUFFER;
        let ssbo = vk::BufferUsageFlags::STORAGE_BUFFER;
        let vbo = vk::BufferUsageFlags::VERTEX_BUFFER;

        assert_eq!(buffer_stride(72, ubo, 256, 16), 256);
        assert_eq!(buffer_stride(72, ssbo, 256, 16), 80);
        assert_eq!(buffer_stride(72, ubo | ssbo, 64, 256), 256);
        assert_eq!(buffer_stride(72, vbo, 256, 256), 72);
        assert_eq!(buffer_stride(512, ubo, 256, 16), 512);
    }

    #[test]
    fn test_memory_location() {
        assert!(!MemoryLocation::GpuOnly.is_host_visible());
        assert!(MemoryLocation::CpuToGpu.is_host_visible());
        assert!(
            MemoryLocation::CpuToGpu
                .alloc_info()
                .flags
                .contains(vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE)
        );
        assert!(MemoryLocation::GpuOnly.alloc_info().flags.is_empty());
        assert!(MemoryLocation::CpuOnly.is_host_visible());
    }
}
