use std::ops::Deref;

use ash::vk;

use crate::error::{GfxResult, VkResultExt};

/// 超过这个值的 budget 视为驱动返回的无效值
const ABSURD_BUDGET: vk::DeviceSize = 1 << 60;

/// device local heap 的显存预算与用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBudget {
    pub budget_bytes: vk::DeviceSize,
    pub usage_bytes: vk::DeviceSize,
}

/// 对所有 device local heap 的 (budget, usage) 求和
///
/// `heaps[i]` 与 `budgets[i]` 一一对应，budgets 的每一项为 (budget, usage)
pub fn sum_device_local_budget(
    heaps: &[vk::MemoryHeap],
    budgets: &[(vk::DeviceSize, vk::DeviceSize)],
) -> MemoryBudget {
    heaps
        .iter()
        .zip(budgets)
        .filter(|(heap, (budget, _))| {
            heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) && *budget < ABSURD_BUDGET
        })
        .fold(MemoryBudget::default(), |acc, (_, (budget, usage))| MemoryBudget {
            budget_bytes: acc.budget_bytes + budget,
            usage_bytes: acc.usage_bytes + usage,
        })
}

pub struct GfxMemAllocator {
    inner: vk_mem::Allocator,
}

impl GfxMemAllocator {
    /// 由于 vma 的生命周期设定：需要引用 Instance 以及 Device，
    /// 因此需要在 device 创建完成后再初始化 vma，并在 device 销毁之前 drop
    pub fn new(instance: &ash::Instance, pdevice: vk::PhysicalDevice, device: &ash::Device) -> GfxResult<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(instance, device, pdevice);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;

        let vma = unsafe { vk_mem::Allocator::new(vma_ci) }.vk_err("vmaCreateAllocator")?;

        Ok(Self { inner: vma })
    }

    /// 查询当前 device local 显存的预算与用量
    pub fn memory_budget(&self, memory_properties: &vk::PhysicalDeviceMemoryProperties) -> MemoryBudget {
        match self.inner.get_heap_budgets() {
            Ok(budgets) => {
                let budgets = budgets.iter().map(|b| (b.budget, b.usage)).collect::<Vec<_>>();
                sum_device_local_budget(memory_properties.memory_heaps_as_slice(), &budgets)
            }
            Err(e) => {
                log::warn!("failed to query heap budgets: {:?}", e);
                MemoryBudget::default()
            }
        }
    }
}

impl Deref for GfxMemAllocator {
    type Target = vk_mem::Allocator;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(size: vk::DeviceSize, device_local: bool) -> vk::MemoryHeap {
        vk::MemoryHeap {
            size,
            flags: if device_local { vk::MemoryHeapFlags::DEVICE_LOCAL } else { vk::MemoryHeapFlags::empty() },
        }
    }

    #[test]
    fn test_sum_device_local_budget() {
        let heaps = [heap(8 << 30, true), heap(16 << 30, false), heap(256 << 20, true), heap(1 << 30, true)];
        let budgets = [
            (7 << 30, 1 << 30),
            (12 << 30, 2 << 30),
            (200 << 20, 10 << 20),
            // 驱动返回的无效值
            (u64::MAX, 5),
        ];
        let budget = sum_device_local_budget(&heaps, &budgets);
        assert_eq!(budget.budget_bytes, (7 << 30) + (200 << 20));
        assert_eq!(budget.usage_bytes, (1 << 30) + (10 << 20));

        assert_eq!(sum_device_local_budget(&[], &[]), MemoryBudget::default());
    }
}
