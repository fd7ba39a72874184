/// debug label 使用的颜色，在 RenderDoc / Nsight 中区分不同类型的区段
pub struct LabelColor;
impl LabelColor {
    const RED: glam::Vec4 = glam::vec4(1.0, 0.0, 0.0, 1.0);
    const GREEN: glam::Vec4 = glam::vec4(0.0, 1.0, 0.0, 1.0);
    const BLUE: glam::Vec4 = glam::vec4(0.0, 0.0, 1.0, 1.0);
    const YELLOW: glam::Vec4 = glam::vec4(1.0, 1.0, 0.0, 1.0);
    const CYAN: glam::Vec4 = glam::vec4(0.0, 1.0, 1.0, 1.0);

    pub const COLOR_PASS: glam::Vec4 = Self::BLUE;
    pub const COLOR_STAGE: glam::Vec4 = Self::YELLOW;
    pub const COLOR_CMD: glam::Vec4 = Self::GREEN;
    /// 立即提交（上传）使用的 command
    pub const COLOR_UPLOAD: glam::Vec4 = Self::CYAN;
    /// present 之前的最后一段
    pub const COLOR_PRESENT: glam::Vec4 = Self::RED;
}

/// 清屏颜色
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor(pub glam::Vec4);
impl ClearColor {
    pub const BLACK: Self = Self(glam::Vec4::new(0.0, 0.0, 0.0, 1.0));

    #[inline]
    pub fn to_vk(self) -> ash::vk::ClearColorValue {
        ash::vk::ClearColorValue {
            float32: self.0.to_array(),
        }
    }
}
