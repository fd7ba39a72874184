use std::{ffi::CString, path::Path};

use anyhow::Context;
use ash::vk;
use serde::Deserialize;

use crate::foundation::physical_device::{DeviceFeatures, PhysicalDeviceSelector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTypePreference {
    #[default]
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}
impl DeviceTypePreference {
    pub fn vk_type(self) -> vk::PhysicalDeviceType {
        match self {
            Self::Discrete => vk::PhysicalDeviceType::DISCRETE_GPU,
            Self::Integrated => vk::PhysicalDeviceType::INTEGRATED_GPU,
            Self::Virtual => vk::PhysicalDeviceType::VIRTUAL_GPU,
            Self::Cpu => vk::PhysicalDeviceType::CPU,
            Self::Other => vk::PhysicalDeviceType::OTHER,
        }
    }
}

/// RHI 的启动参数，通常从 toml 文件读取
///
/// ```toml
/// app_name = "clear-screen"
/// validation = true
/// frames_in_flight = 2
/// vsync = true
/// preferred_device_type = "discrete"
///
/// [features]
/// fill_mode_non_solid = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    pub app_name: String,
    /// 是否启用 validation layer 与 debug utils
    pub validation: bool,
    pub frames_in_flight: usize,
    pub vsync: bool,
    pub preferred_device_type: DeviceTypePreference,
    pub dedicated_transfer_queue: bool,
    pub dedicated_compute_queue: bool,
    /// RHI 自身需要的 features 总会被加上
    pub features: DeviceFeatures,
    /// swapchain 之外额外需要的 device extension
    pub device_extensions: Vec<String>,
}
impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            app_name: "Truvis".to_string(),
            validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            vsync: true,
            preferred_device_type: DeviceTypePreference::default(),
            dedicated_transfer_queue: false,
            dedicated_compute_queue: false,
            features: DeviceFeatures::default(),
            device_extensions: vec![],
        }
    }
}

impl GfxConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse gfx config")?;
        anyhow::ensure!(config.frames_in_flight > 0, "frames_in_flight must be at least 1");
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read gfx config: {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid gfx config: {}", path.display()))
    }

    /// 将配置转换为 physical device 的选择条件；是否需要 present 由是否有 surface 决定
    pub fn physical_device_selector(&self) -> anyhow::Result<PhysicalDeviceSelector> {
        let mut selector = PhysicalDeviceSelector::default()
            .preferred_type(self.preferred_device_type.vk_type())
            .features(self.features)
            .dedicated_transfer_queue(self.dedicated_transfer_queue)
            .dedicated_compute_queue(self.dedicated_compute_queue);
        for ext in &self.device_extensions {
            let ext = CString::new(ext.as_str()).with_context(|| format!("invalid extension name: {ext:?}"))?;
            selector = selector.add_extension(&ext);
        }
        Ok(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = GfxConfig::from_toml_str(
            r#"
            app_name = "clear-screen"
            validation = false
            frames_in_flight = 3
            vsync = false
            preferred_device_type = "integrated"
            dedicated_transfer_queue = true
            device_extensions = ["VK_KHR_ray_query"]

            [features]
            fill_mode_non_solid = true
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "clear-screen");
        assert!(!config.validation);
        assert_eq!(config.frames_in_flight, 3);
        assert!(!config.vsync);
        assert_eq!(config.preferred_device_type, DeviceTypePreference::Integrated);
        assert!(config.dedicated_transfer_queue);
        assert!(!config.dedicated_compute_queue);
        assert!(config.features.fill_mode_non_solid);
        // 没有写出来的 feature 使用默认值
        assert_eq!(config.features.sampler_anisotropy, DeviceFeatures::default().sampler_anisotropy);

        let selector = config.physical_device_selector().unwrap();
        assert!(selector.required_extensions().iter().any(|e| e.as_c_str() == c"VK_KHR_ray_query"));
        assert!(selector.required_extensions().iter().any(|e| e.as_c_str() == ash::khr::swapchain::NAME));
        assert!(selector.required_features().fill_mode_non_solid);
        assert!(selector.required_features().dynamic_rendering);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GfxConfig::from_toml_str("").unwrap();
        assert_eq!(config, GfxConfig::default());
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.vsync);
    }

    #[test]
    fn test_invalid_config() {
        assert!(GfxConfig::from_toml_str("frames_in_flight = 0").is_err());
        assert!(GfxConfig::from_toml_str(r#"preferred_device_type = "quantum""#).is_err());
        assert!(GfxConfig::from_toml_str("vsync = 3").is_err());

        let config = GfxConfig {
            device_extensions: vec!["bad\0name".to_string()],
            ..Default::default()
        };
        assert!(config.physical_device_selector().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(GfxConfig::from_file("/definitely/not/here/gfx.toml").is_err());
    }
}
