use std::ffi::{CStr, CString};

use ash::vk;
use itertools::Itertools;
use serde::Deserialize;

use crate::{
    commands::queue::QueueRole,
    error::{GfxError, GfxResult, VkResultExt},
    swapchain::surface::GfxSurface,
};

/// 设备需要开启的 features
///
/// 对应 VkPhysicalDeviceFeatures / Vulkan12Features / Vulkan13Features 中的若干字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
    pub sample_rate_shading: bool,

    pub buffer_device_address: bool,
    pub descriptor_indexing: bool,
    pub timeline_semaphore: bool,

    pub dynamic_rendering: bool,
    pub synchronization2: bool,
}
impl Default for DeviceFeatures {
    fn default() -> Self {
        Self {
            sampler_anisotropy: true,
            ..Self::REQUIRED_BY_RHI
        }
    }
}
impl DeviceFeatures {
    /// RHI 自身依赖的 features：submit2 / 动态渲染 / timeline semaphore / bda
    pub const REQUIRED_BY_RHI: Self = Self {
        sampler_anisotropy: false,
        fill_mode_non_solid: false,
        sample_rate_shading: false,
        buffer_device_address: true,
        descriptor_indexing: true,
        timeline_semaphore: true,
        dynamic_rendering: true,
        synchronization2: true,
    };

    pub const NONE: Self = Self {
        sampler_anisotropy: false,
        fill_mode_non_solid: false,
        sample_rate_shading: false,
        buffer_device_address: false,
        descriptor_indexing: false,
        timeline_semaphore: false,
        dynamic_rendering: false,
        synchronization2: false,
    };

    fn named(&self) -> [(&'static str, bool); 8] {
        [
            ("samplerAnisotropy", self.sampler_anisotropy),
            ("fillModeNonSolid", self.fill_mode_non_solid),
            ("sampleRateShading", self.sample_rate_shading),
            ("bufferDeviceAddress", self.buffer_device_address),
            ("descriptorIndexing", self.descriptor_indexing),
            ("timelineSemaphore", self.timeline_semaphore),
            ("dynamicRendering", self.dynamic_rendering),
            ("synchronization2", self.synchronization2),
        ]
    }

    /// self 中要求开启，但 supported 中不支持的 feature 名称
    pub fn missing_from(&self, supported: &DeviceFeatures) -> Vec<&'static str> {
        self.named()
            .into_iter()
            .zip(supported.named())
            .filter(|((_, required), (_, available))| *required && !*available)
            .map(|((name, _), _)| name)
            .collect()
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            sampler_anisotropy: self.sampler_anisotropy || other.sampler_anisotropy,
            fill_mode_non_solid: self.fill_mode_non_solid || other.fill_mode_non_solid,
            sample_rate_shading: self.sample_rate_shading || other.sample_rate_shading,
            buffer_device_address: self.buffer_device_address || other.buffer_device_address,
            descriptor_indexing: self.descriptor_indexing || other.descriptor_indexing,
            timeline_semaphore: self.timeline_semaphore || other.timeline_semaphore,
            dynamic_rendering: self.dynamic_rendering || other.dynamic_rendering,
            synchronization2: self.synchronization2 || other.synchronization2,
        }
    }

    /// 查询 gpu 支持的 features
    fn query(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> Self {
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 =
            vk::PhysicalDeviceFeatures2::default().push_next(&mut features12).push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(pdevice, &mut features2) };
        let core = features2.features;

        Self {
            sampler_anisotropy: core.sampler_anisotropy == vk::TRUE,
            fill_mode_non_solid: core.fill_mode_non_solid == vk::TRUE,
            sample_rate_shading: core.sample_rate_shading == vk::TRUE,
            buffer_device_address: features12.buffer_device_address == vk::TRUE,
            descriptor_indexing: features12.descriptor_indexing == vk::TRUE,
            timeline_semaphore: features12.timeline_semaphore == vk::TRUE,
            dynamic_rendering: features13.dynamic_rendering == vk::TRUE,
            synchronization2: features13.synchronization2 == vk::TRUE,
        }
    }

    /// 创建 device 时使用的 feature 结构体
    pub(crate) fn core_features(&self) -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(self.sampler_anisotropy)
            .fill_mode_non_solid(self.fill_mode_non_solid)
            .sample_rate_shading(self.sample_rate_shading)
    }

    pub(crate) fn vulkan12_features(&self) -> vk::PhysicalDeviceVulkan12Features<'static> {
        vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(self.buffer_device_address)
            .descriptor_indexing(self.descriptor_indexing)
            .timeline_semaphore(self.timeline_semaphore)
    }

    pub(crate) fn vulkan13_features(&self) -> vk::PhysicalDeviceVulkan13Features<'static> {
        vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(self.dynamic_rendering)
            .synchronization2(self.synchronization2)
    }
}

/// 一个 queue family 的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyCaps {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// 是否可以 present 到目标 surface
    pub present: bool,
}

/// 每个 queue 角色使用的 queue family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyAssignment {
    pub graphics: u32,
    /// 不需要 present 时（headless）为 None
    pub present: Option<u32>,
    pub transfer: u32,
    pub compute: u32,
}
impl QueueFamilyAssignment {
    /// present 未分配时回落到 graphics family
    #[inline]
    pub fn family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present.unwrap_or(self.graphics),
            QueueRole::Transfer => self.transfer,
            QueueRole::Compute => self.compute,
        }
    }

    /// 需要创建 queue 的 family，去重且有序
    pub fn unique_families(&self) -> Vec<u32> {
        QueueRole::ALL.iter().map(|role| self.family(*role)).sorted().dedup().collect()
    }
}

/// 为各个角色分配 queue family
///
/// 1. 找到第一个同时支持 graphics + transfer + compute（需要时还有 present）的 family，作为所有角色的默认值
/// 2. 需要独立 transfer 时，寻找支持 transfer、不支持 compute、且不是 graphics 的 family
/// 3. 需要独立 compute 时，寻找支持 compute、且不是 graphics 的 family
///
/// 找不到独立的 family 时保留默认值
pub fn assign_queue_families(
    families: &[QueueFamilyCaps],
    require_present: bool,
    dedicated_transfer: bool,
    dedicated_compute: bool,
) -> Option<QueueFamilyAssignment> {
    let all_purpose = vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER | vk::QueueFlags::COMPUTE;

    let (graphics, _) = families.iter().find_position(|caps| {
        caps.queue_count > 0 && caps.flags.contains(all_purpose) && (!require_present || caps.present)
    })?;
    let graphics = graphics as u32;

    let mut assignment = QueueFamilyAssignment {
        graphics,
        present: require_present.then_some(graphics),
        transfer: graphics,
        compute: graphics,
    };

    let find_family = |include: vk::QueueFlags, exclude: vk::QueueFlags| {
        families
            .iter()
            .enumerate()
            .find(|(idx, caps)| {
                *idx as u32 != graphics
                    && caps.queue_count > 0
                    && caps.flags.contains(include)
                    && !caps.flags.intersects(exclude)
            })
            .map(|(idx, _)| idx as u32)
    };

    if dedicated_transfer {
        match find_family(vk::QueueFlags::TRANSFER, vk::QueueFlags::COMPUTE) {
            Some(family) => assignment.transfer = family,
            None => log::info!("no dedicated transfer queue family, falling back to family {}", graphics),
        }
    }
    if dedicated_compute {
        match find_family(vk::QueueFlags::COMPUTE, vk::QueueFlags::empty()) {
            Some(family) => assignment.compute = family,
            None => log::info!("no dedicated compute queue family, falling back to family {}", graphics),
        }
    }

    Some(assignment)
}

/// 评分，按字段顺序比较：首先是否为偏好的设备类型，其次是 limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceScore {
    pub preferred_type: bool,
    pub max_image_dimension_2d: u32,
    pub device_local_bytes: vk::DeviceSize,
}

/// 选择过程中的候选 gpu，选择结束后即丢弃
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<QueueFamilyCaps>,
    pub extensions: Vec<CString>,
    pub features: DeviceFeatures,
}
impl PhysicalDeviceCandidate {
    fn query(instance: &ash::Instance, pdevice: vk::PhysicalDevice, surface: Option<&GfxSurface>) -> GfxResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(pdevice) };
        let name = properties.device_name_as_c_str().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();

        let extensions = unsafe { instance.enumerate_device_extension_properties(pdevice) }
            .vk_err("vkEnumerateDeviceExtensionProperties")?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect_vec();

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) }
            .iter()
            .enumerate()
            .map(|(idx, props)| QueueFamilyCaps {
                flags: props.queue_flags,
                queue_count: props.queue_count,
                present: surface.is_some_and(|s| s.supports_present(pdevice, idx as u32)),
            })
            .collect_vec();
        log::debug!("gpu {}: queue families:\n{:#?}", name, queue_families);

        Ok(Self {
            handle: pdevice,
            name,
            properties,
            memory_properties: unsafe { instance.get_physical_device_memory_properties(pdevice) },
            queue_families,
            extensions,
            features: DeviceFeatures::query(instance, pdevice),
        })
    }

    #[inline]
    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.properties.device_type
    }

    /// 所有 device local heap 的总大小
    pub fn device_local_bytes(&self) -> vk::DeviceSize {
        self.memory_properties
            .memory_heaps_as_slice()
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    fn supports_extension(&self, ext: &CStr) -> bool {
        self.extensions.iter().any(|e| e.as_c_str() == ext)
    }
}

/// 根据需求从所有 gpu 中选出一个
#[derive(Debug, Clone)]
pub struct PhysicalDeviceSelector {
    extensions: Vec<CString>,
    preferred_type: vk::PhysicalDeviceType,
    features: DeviceFeatures,
    require_present: bool,
    dedicated_transfer_queue: bool,
    dedicated_compute_queue: bool,
}
impl Default for PhysicalDeviceSelector {
    fn default() -> Self {
        Self {
            extensions: vec![ash::khr::swapchain::NAME.to_owned()],
            preferred_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            features: DeviceFeatures::default(),
            require_present: true,
            dedicated_transfer_queue: false,
            dedicated_compute_queue: false,
        }
    }
}
// builder
impl PhysicalDeviceSelector {
    /// 完全替换 extension 列表
    pub fn extensions<'a>(mut self, exts: impl IntoIterator<Item = &'a CStr>) -> Self {
        self.extensions = exts.into_iter().map(CStr::to_owned).collect();
        self
    }

    pub fn add_extension(mut self, ext: &CStr) -> Self {
        if !self.extensions.iter().any(|e| e.as_c_str() == ext) {
            self.extensions.push(ext.to_owned());
        }
        self
    }

    pub fn preferred_type(mut self, device_type: vk::PhysicalDeviceType) -> Self {
        self.preferred_type = device_type;
        self
    }

    /// RHI 自身依赖的 features 总会被加上
    pub fn features(mut self, features: DeviceFeatures) -> Self {
        self.features = features.union(DeviceFeatures::REQUIRED_BY_RHI);
        self
    }

    pub fn require_present(mut self, require: bool) -> Self {
        self.require_present = require;
        self
    }

    pub fn dedicated_transfer_queue(mut self, dedicated: bool) -> Self {
        self.dedicated_transfer_queue = dedicated;
        self
    }

    pub fn dedicated_compute_queue(mut self, dedicated: bool) -> Self {
        self.dedicated_compute_queue = dedicated;
        self
    }
}
// getters
impl PhysicalDeviceSelector {
    #[inline]
    pub fn required_extensions(&self) -> &[CString] {
        &self.extensions
    }

    #[inline]
    pub fn required_features(&self) -> DeviceFeatures {
        self.features
    }

    #[inline]
    pub fn requires_present(&self) -> bool {
        self.require_present
    }
}
// select
impl PhysicalDeviceSelector {
    /// 检查需求本身是否自洽
    pub fn validate(&self, has_surface: bool) -> GfxResult<()> {
        if self.require_present && !has_surface {
            return Err(GfxError::InvalidSelector("present is required but no surface is set".to_string()));
        }
        if self.extensions.is_empty() {
            log::warn!("physical device selector: no device extensions are set");
        }
        if self.require_present && !self.extensions.iter().any(|e| e.as_c_str() == ash::khr::swapchain::NAME) {
            return Err(GfxError::InvalidSelector(format!(
                "present is required but {:?} is not in the extension list",
                ash::khr::swapchain::NAME
            )));
        }
        Ok(())
    }

    /// 检查一个候选 gpu，满足所有需求时返回 queue family 的分配结果
    pub fn evaluate(&self, candidate: &PhysicalDeviceCandidate) -> Option<QueueFamilyAssignment> {
        let api_version = candidate.properties.api_version;
        if vk::api_version_major(api_version) < 1
            || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
        {
            log::info!(
                "gpu {} rejected: vulkan {}.{} < 1.3",
                candidate.name,
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version)
            );
            return None;
        }

        let missing_exts = self.extensions.iter().filter(|ext| !candidate.supports_extension(ext)).collect_vec();
        if !missing_exts.is_empty() {
            log::info!("gpu {} rejected: missing extensions {:?}", candidate.name, missing_exts);
            return None;
        }

        let Some(assignment) = assign_queue_families(
            &candidate.queue_families,
            self.require_present,
            self.dedicated_transfer_queue,
            self.dedicated_compute_queue,
        ) else {
            log::info!("gpu {} rejected: no suitable graphics/present queue family", candidate.name);
            return None;
        };

        let missing_features = self.features.missing_from(&candidate.features);
        if !missing_features.is_empty() {
            log::info!("gpu {} rejected: missing features {:?}", candidate.name, missing_features);
            return None;
        }

        Some(assignment)
    }

    pub fn score(&self, candidate: &PhysicalDeviceCandidate) -> DeviceScore {
        DeviceScore {
            preferred_type: candidate.device_type() == self.preferred_type,
            max_image_dimension_2d: candidate.properties.limits.max_image_dimension2_d,
            device_local_bytes: candidate.device_local_bytes(),
        }
    }

    /// 从候选中选出分数最高的，分数相同时保留靠前的
    pub fn pick(
        &self,
        candidates: impl IntoIterator<Item = PhysicalDeviceCandidate>,
    ) -> Option<(PhysicalDeviceCandidate, QueueFamilyAssignment)> {
        candidates
            .into_iter()
            .filter_map(|candidate| {
                let assignment = self.evaluate(&candidate)?;
                Some((self.score(&candidate), candidate, assignment))
            })
            .collect_vec()
            .into_iter()
            // max_by_key 在分数相同时返回最后一个，反转之后即为最靠前的
            .rev()
            .max_by_key(|(score, _, _)| *score)
            .map(|(_, candidate, assignment)| (candidate, assignment))
    }

    /// 枚举所有 gpu，返回最合适的那一个
    pub fn select(&self, instance: &ash::Instance, surface: Option<&GfxSurface>) -> GfxResult<GfxPhysicalDevice> {
        let _span = tracy_client::span!("PhysicalDeviceSelector::select");

        self.validate(surface.is_some())?;

        let pdevices = unsafe { instance.enumerate_physical_devices() }.vk_err("vkEnumeratePhysicalDevices")?;
        if pdevices.is_empty() {
            log::error!("failed to find GPUs with vulkan support");
            return Err(GfxError::NoPhysicalDevice);
        }

        let candidates: Vec<_> = pdevices
            .into_iter()
            .map(|pdevice| PhysicalDeviceCandidate::query(instance, pdevice, surface))
            .try_collect()?;
        for candidate in &candidates {
            log::info!("found gpu: {} ({:?})", candidate.name, candidate.device_type());
        }

        let Some((candidate, queue_families)) = self.pick(candidates) else {
            log::error!("failed to find a suitable physical device");
            return Err(GfxError::NoSuitableDevice);
        };

        log::info!("physical device: {}", candidate.name);
        log::info!(
            "GRAPHICS: {} | PRESENT: {:?} | TRANSFER: {} | COMPUTE: {}",
            queue_families.graphics,
            queue_families.present,
            queue_families.transfer,
            queue_families.compute
        );

        Ok(GfxPhysicalDevice {
            handle: candidate.handle,
            name: candidate.name,
            properties: candidate.properties,
            memory_properties: candidate.memory_properties,
            queue_families,
            family_caps: candidate.queue_families,
            enabled_features: self.features,
            enabled_extensions: self.extensions.clone(),
        })
    }
}

/// 选中的物理显卡
pub struct GfxPhysicalDevice {
    pub(crate) handle: vk::PhysicalDevice,
    pub(crate) name: String,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) queue_families: QueueFamilyAssignment,
    pub(crate) family_caps: Vec<QueueFamilyCaps>,
    pub(crate) enabled_features: DeviceFeatures,
    pub(crate) enabled_extensions: Vec<CString>,
}
// getters
impl GfxPhysicalDevice {
    #[inline]
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    #[inline]
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    #[inline]
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyAssignment {
        &self.queue_families
    }

    #[inline]
    pub fn queue_family_caps(&self, family: u32) -> Option<&QueueFamilyCaps> {
        self.family_caps.get(family as usize)
    }

    #[inline]
    pub fn enabled_features(&self) -> DeviceFeatures {
        self.enabled_features
    }

    #[inline]
    pub fn is_discrete_gpu(&self) -> bool {
        self.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps {
            flags,
            queue_count: 1,
            present,
        }
    }

    fn candidate(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        max_image_dimension2_d: u32,
        families: Vec<QueueFamilyCaps>,
    ) -> PhysicalDeviceCandidate {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.api_version = vk::API_VERSION_1_3;
        properties.device_type = device_type;
        properties.limits.max_image_dimension2_d = max_image_dimension2_d;

        PhysicalDeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            properties,
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_families: families,
            extensions: vec![ash::khr::swapchain::NAME.to_owned()],
            features: DeviceFeatures::default(),
        }
    }

    #[test]
    fn test_single_family_takes_every_role() {
        // 只有一个 family，支持 graphics + present
        let families = [family(ALL, true)];
        let assignment = assign_queue_families(&families, true, false, false).unwrap();
        assert_eq!(
            assignment,
            QueueFamilyAssignment {
                graphics: 0,
                present: Some(0),
                transfer: 0,
                compute: 0,
            }
        );

        // 请求独立 queue 但没有可用的 family，依然回落到同一个 family
        let assignment = assign_queue_families(&families, true, true, true).unwrap();
        assert_eq!(assignment.transfer, 0);
        assert_eq!(assignment.compute, 0);
        assert_eq!(assignment.unique_families(), vec![0]);
    }

    #[test]
    fn test_dedicated_transfer_family() {
        let families = [
            family(ALL, true),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING, false),
        ];
        let assignment = assign_queue_families(&families, true, true, false).unwrap();
        assert_eq!(assignment.graphics, 0);
        assert_eq!(assignment.present, Some(0));
        assert_eq!(assignment.transfer, 2);
        assert_eq!(assignment.compute, 0);
        assert_eq!(assignment.unique_families(), vec![0, 2]);
    }

    #[test]
    fn test_dedicated_compute_family() {
        let families = [
            family(ALL, true),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let assignment = assign_queue_families(&families, true, true, true).unwrap();
        assert_eq!(assignment.transfer, 2);
        assert_eq!(assignment.compute, 1);
        assert_eq!(assignment.family(QueueRole::Present), 0);
    }

    #[test]
    fn test_graphics_family_must_present_when_required() {
        // 第一个全能 family 不能 present，第二个可以
        let families = [family(ALL, false), family(ALL, true)];
        let assignment = assign_queue_families(&families, true, false, false).unwrap();
        assert_eq!(assignment.graphics, 1);
        assert_eq!(assignment.present, Some(1));

        // headless 时不关心 present
        let assignment = assign_queue_families(&families, false, false, false).unwrap();
        assert_eq!(assignment.graphics, 0);
        assert_eq!(assignment.present, None);
        assert_eq!(assignment.family(QueueRole::Present), 0);
    }

    #[test]
    fn test_no_all_purpose_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true),
            family(vk::QueueFlags::COMPUTE, false),
        ];
        assert!(assign_queue_families(&families, true, false, false).is_none());
        assert!(assign_queue_families(&[], false, false, false).is_none());
    }

    #[test]
    fn test_missing_features() {
        let required = DeviceFeatures {
            fill_mode_non_solid: true,
            ..DeviceFeatures::REQUIRED_BY_RHI
        };
        let supported = DeviceFeatures {
            dynamic_rendering: false,
            ..DeviceFeatures::default()
        };
        assert_eq!(required.missing_from(&supported), vec!["fillModeNonSolid", "dynamicRendering"]);
        assert!(DeviceFeatures::NONE.missing_from(&DeviceFeatures::NONE).is_empty());
    }

    #[test]
    fn test_selector_features_keep_rhi_requirements() {
        let selector = PhysicalDeviceSelector::default().features(DeviceFeatures::NONE);
        assert_eq!(selector.required_features(), DeviceFeatures::REQUIRED_BY_RHI);
    }

    #[test]
    fn test_validate() {
        let selector = PhysicalDeviceSelector::default();
        assert!(selector.validate(true).is_ok());
        assert!(matches!(selector.validate(false), Err(GfxError::InvalidSelector(_))));

        let selector = PhysicalDeviceSelector::default().extensions([]);
        assert!(matches!(selector.validate(true), Err(GfxError::InvalidSelector(_))));

        // headless 时不需要 swapchain extension，空列表只是警告
        let selector = PhysicalDeviceSelector::default().extensions([]).require_present(false);
        assert!(selector.validate(false).is_ok());
    }

    #[test]
    fn test_evaluate_rejects_missing_extension_and_feature() {
        let selector = PhysicalDeviceSelector::default();

        let mut no_swapchain = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU, 16384, vec![family(ALL, true)]);
        no_swapchain.extensions.clear();
        assert!(selector.evaluate(&no_swapchain).is_none());

        let mut no_sync2 = candidate("b", vk::PhysicalDeviceType::DISCRETE_GPU, 16384, vec![family(ALL, true)]);
        no_sync2.features.synchronization2 = false;
        assert!(selector.evaluate(&no_sync2).is_none());

        let mut old_api = candidate("c", vk::PhysicalDeviceType::DISCRETE_GPU, 16384, vec![family(ALL, true)]);
        old_api.properties.api_version = vk::API_VERSION_1_2;
        assert!(selector.evaluate(&old_api).is_none());

        let good = candidate("d", vk::PhysicalDeviceType::DISCRETE_GPU, 16384, vec![family(ALL, true)]);
        assert!(selector.evaluate(&good).is_some());
    }

    #[test]
    fn test_pick_prefers_device_type_then_limits() {
        let selector = PhysicalDeviceSelector::default();
        let picked = selector
            .pick(vec![
                candidate("integrated-big", vk::PhysicalDeviceType::INTEGRATED_GPU, 32768, vec![family(ALL, true)]),
                candidate("discrete-small", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![family(ALL, true)]),
                candidate("discrete-big", vk::PhysicalDeviceType::DISCRETE_GPU, 16384, vec![family(ALL, true)]),
                // 分数最高但无法 present
                candidate("discrete-headless", vk::PhysicalDeviceType::DISCRETE_GPU, 65536, vec![family(ALL, false)]),
            ])
            .unwrap();
        assert_eq!(picked.0.name, "discrete-big");

        // 没有偏好类型时，任何合法的设备都可以被选中
        let picked = selector
            .pick(vec![candidate("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192, vec![family(ALL, true)])])
            .unwrap();
        assert_eq!(picked.0.name, "integrated");

        // 分数相同时保留靠前的
        let picked = selector
            .pick(vec![
                candidate("first", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![family(ALL, true)]),
                candidate("second", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![family(ALL, true)]),
            ])
            .unwrap();
        assert_eq!(picked.0.name, "first");

        assert!(selector.pick(vec![]).is_none());
    }

    #[test]
    fn test_pick_from_single_pass_iterator() {
        let selector = PhysicalDeviceSelector::default();
        let mut pending = vec![
            candidate("second", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![family(ALL, true)]),
            candidate("first", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, vec![family(ALL, true)]),
            candidate("cpu", vk::PhysicalDeviceType::CPU, 4096, vec![family(ALL, true)]),
        ];
        // from_fn 只能单向迭代，依次产出 cpu、first、second
        let candidates = std::iter::from_fn(move || pending.pop());

        let (picked, assignment) = selector.pick(candidates).unwrap();
        assert_eq!(picked.name, "first");
        assert_eq!(assignment.graphics, 0);
    }
}
